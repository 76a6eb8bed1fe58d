// Copyright 2025 Irreducible Inc.

use std::mem;

use lutnet_compute::{DataType, ExecContext, FrameBuffer, Shape};
use tracing::{debug, instrument};

use crate::{BinaryToReal, Error, Layer, ModulationConfig, RealToBinary};

/// Options of [`BinaryModulation`].
#[derive(Debug, Default)]
pub struct BinaryModulationConfig {
	/// Output shape of the reducer; `None` keeps the inner layer's output shape.
	pub output_shape: Option<Shape>,
	pub training: ModulationConfig,
	pub inference: ModulationConfig,
	/// Element type of the binary frames handed to the inner layer.
	pub bin_dtype: DataType,
}

/// Runs an inner layer on modulated binary frames with real-valued input and output.
///
/// The expander and reducer are configured for training at construction and again on every
/// `set_input_shape`, which also rewinds both modes' value generators. A forward whose mode
/// differs from the current one first swaps in the other mode's parameters.
pub struct BinaryModulation {
	real2bin: RealToBinary,
	layer: Box<dyn Layer>,
	bin2real: BinaryToReal,
	/// Parameters of the mode that is not active.
	standby: ModulationConfig,
	training: bool,
}

impl BinaryModulation {
	pub fn new(layer: Box<dyn Layer>, config: BinaryModulationConfig) -> Result<Self, Error> {
		config.inference.validate("BinaryModulation")?;
		let modulation_size = config.training.modulation_size;
		Ok(Self {
			real2bin: RealToBinary::new(config.training, config.bin_dtype)?,
			layer,
			bin2real: BinaryToReal::new(modulation_size, config.output_shape),
			standby: config.inference,
			training: true,
		})
	}

	pub fn is_training(&self) -> bool {
		self.training
	}

	/// Parameters in effect for the next forward in the current mode.
	pub fn active_modulation(&self) -> &ModulationConfig {
		self.real2bin.modulation()
	}

	pub fn layer(&self) -> &dyn Layer {
		self.layer.as_ref()
	}

	pub fn layer_mut(&mut self) -> &mut dyn Layer {
		self.layer.as_mut()
	}

	fn switch_mode(&mut self, training: bool) {
		if training == self.training {
			return;
		}
		mem::swap(&mut self.standby, self.real2bin.modulation_mut());
		let modulation_size = self.real2bin.modulation().modulation_size;
		self.bin2real.set_modulation_size(modulation_size);
		self.training = training;
		debug!(training, modulation_size, "switched modulation mode");
	}
}

impl Layer for BinaryModulation {
	fn class_name(&self) -> String {
		"BinaryModulation".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		self.real2bin.input_shape()
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.bin2real.output_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.switch_mode(true);
		self.standby.reset_generator();
		let shape = self.real2bin.set_input_shape(shape)?;
		let shape = self.layer.set_input_shape(&shape)?;
		self.bin2real.set_input_shape(&shape)
	}

	#[instrument(skip_all, fields(frames = x.frames(), train))]
	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		self.switch_mode(train);
		let x = self.real2bin.forward(ctx, x, train)?;
		let x = self.layer.forward(ctx, x, train)?;
		self.bin2real.forward(ctx, x, train)
	}

	#[instrument(skip_all, fields(frames = dy.frames()))]
	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let dy = self.bin2real.backward(ctx, dy)?;
		let dy = self.layer.backward(ctx, dy)?;
		self.real2bin.backward(ctx, dy)
	}

	fn children(&self) -> Vec<&dyn Layer> {
		vec![&self.real2bin as &dyn Layer, self.layer.as_ref(), &self.bin2real]
	}

	fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
		vec![
			&mut self.real2bin as &mut dyn Layer,
			self.layer.as_mut(),
			&mut self.bin2real,
		]
	}
}
