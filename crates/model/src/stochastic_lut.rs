// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};
use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_connect::ConnectionTable;
use lutnet_utils::{DeserializeBytes, SerializeBytes};
use serde_json::Value;
use tracing::{instrument, trace};

use crate::{
	layer::{backward_without_forward, from_payload},
	BatchNormalization, BatchNormalizationConfig, Checkpoint, Command, Error, ForwardNode, Layer,
	LutConfig, SparseConnectable, StochasticLutN, Variable, Variables,
};

/// Options of [`StochasticLut`].
#[derive(Debug, Clone, PartialEq)]
pub struct StochasticLutConfig {
	pub lut: LutConfig,
	pub batch_norm: BatchNormalizationConfig,
	pub bn_enable: bool,
	pub memory_saving: bool,
}

impl StochasticLutConfig {
	pub fn new(output_shape: impl Into<Shape>) -> Self {
		Self {
			lut: LutConfig::new(output_shape),
			batch_norm: BatchNormalizationConfig {
				momentum: 0.001,
				gamma: 0.2,
				beta: 0.5,
				fix_gamma: true,
				fix_beta: true,
				..Default::default()
			},
			bn_enable: true,
			memory_saving: false,
		}
	}

	pub fn with_bn_enable(self, bn_enable: bool) -> Self {
		Self { bn_enable, ..self }
	}
}

/// Stochastic tables followed by an optional batch normalization stage.
///
/// The `batch_normalization` command switches the stage, and its parameters, on and off. A
/// backward follows the composition of its training forward even if the switch flips between
/// the two.
pub struct StochasticLut<const N: usize> {
	lut: StochasticLutN<N>,
	batch_norm: BatchNormalization,
	bn_enable: bool,
	memory_saving: bool,
	/// `bn_enable` as of the last training forward.
	forward_bn: Option<bool>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StochasticLutPayload {
	bn_enable: bool,
}

impl<const N: usize> StochasticLut<N> {
	pub fn new(config: StochasticLutConfig) -> Result<Self, Error> {
		Ok(Self {
			lut: StochasticLutN::new(config.lut)?,
			batch_norm: BatchNormalization::new(config.batch_norm),
			bn_enable: config.bn_enable,
			memory_saving: config.memory_saving,
			forward_bn: None,
		})
	}

	pub fn bn_enabled(&self) -> bool {
		self.bn_enable
	}
}

impl<const N: usize> Layer for StochasticLut<N> {
	fn class_name(&self) -> String {
		"StochasticLut".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		self.lut.input_shape()
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.lut.output_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.forward_bn = None;
		let shape = self.lut.set_input_shape(shape)?;
		self.batch_norm.set_input_shape(&shape)
	}

	#[instrument(skip_all, fields(frames = x.frames(), train, bn = self.bn_enable))]
	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		let y = self.lut.forward(ctx, x, train)?;
		self.forward_bn = train.then_some(self.bn_enable);
		if !self.bn_enable {
			return Ok(y);
		}
		let y = self.batch_norm.forward(ctx, y, train)?;
		if self.memory_saving || !train {
			self.batch_norm.forget();
		}
		Ok(y)
	}

	#[instrument(skip_all, fields(frames = dy.frames()))]
	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let bn_enable = self
			.forward_bn
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let dy = if bn_enable {
			if !self.batch_norm.retains_activations() {
				let x = self
					.lut
					.cached_input()
					.ok_or_else(|| backward_without_forward(&self.class_name()))?;
				trace!("recomputing normalization input");
				let y = self.lut.evaluate(x)?;
				self.batch_norm.recompute(ctx, y)?;
			}
			self.batch_norm.backward(ctx, dy)?
		} else {
			dy
		};
		self.lut.backward(ctx, dy)
	}

	fn parameters(&self) -> Variables {
		let mut variables = self.lut.parameters();
		if self.bn_enable {
			variables.extend(self.batch_norm.parameters());
		}
		variables
	}

	fn gradients(&self) -> Variables {
		let mut variables = self.lut.gradients();
		if self.bn_enable {
			variables.extend(self.batch_norm.gradients());
		}
		variables
	}

	fn handle_command(&mut self, command: &Command) {
		match *command {
			Command::BatchNormalization(enable) => self.bn_enable = enable,
			Command::MemorySaving(memory_saving) => self.memory_saving = memory_saving,
			_ => {}
		}
	}

	fn children(&self) -> Vec<&dyn Layer> {
		vec![&self.lut as &dyn Layer, &self.batch_norm]
	}

	fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
		vec![&mut self.lut as &mut dyn Layer, &mut self.batch_norm]
	}

	fn as_sparse(&self) -> Option<&dyn SparseConnectable> {
		Some(self)
	}

	fn as_sparse_mut(&mut self) -> Option<&mut dyn SparseConnectable> {
		Some(self)
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		Ok(self.bn_enable.serialize(buf)?)
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		self.bn_enable = bool::deserialize(buf)?;
		Ok(())
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(StochasticLutPayload {
			bn_enable: self.bn_enable,
		})?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		let payload: StochasticLutPayload = from_payload(payload)?;
		self.bn_enable = payload.bn_enable;
		Ok(())
	}
}

impl<const N: usize> SparseConnectable for StochasticLut<N> {
	fn connection_table(&self) -> Result<&ConnectionTable, Error> {
		self.lut.connection_table()
	}

	fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable, Error> {
		self.lut.connection_table_mut()
	}

	fn table_weights(&self) -> &Variable {
		self.lut.weights()
	}
}

impl<const N: usize> ForwardNode for StochasticLut<N> {
	fn forward_node(&self, node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let y = self.lut.forward_node(node, x)?;
		if self.bn_enable {
			self.batch_norm.forward_node(node, &y)
		} else {
			Ok(y)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::Target;

	fn trainable_bn(output: usize) -> StochasticLutConfig {
		let mut config = StochasticLutConfig::new([output]);
		config.batch_norm.fix_gamma = false;
		config.batch_norm.fix_beta = false;
		config
	}

	#[test]
	fn test_batch_normalization_command_toggles_parameters() {
		let mut layer = StochasticLut::<2>::new(trainable_bn(3)).unwrap();
		layer.set_input_shape(&shape(6)).unwrap();
		assert_eq!(layer.parameters().len(), 3);
		assert_eq!(layer.gradients().len(), 3);

		layer.send_command(&Command::BatchNormalization(false), &Target::All);
		assert!(!layer.bn_enabled());
		assert_eq!(layer.parameters().len(), 1);
		assert_eq!(layer.gradients().len(), 1);
	}

	#[test]
	fn test_fixed_normalization_exposes_only_tables() {
		let mut layer = StochasticLut::<6>::new(StochasticLutConfig::new([2])).unwrap();
		layer.set_input_shape(&shape(12)).unwrap();
		assert_eq!(layer.parameters().len(), 1);
		assert_eq!(layer.parameters().total_len(), 2 << 6);
	}

	#[test]
	fn test_disabled_normalization_passes_table_output() {
		let ctx = ExecContext::host();
		let mut layer = StochasticLut::<2>::new(trainable_bn(2).with_bn_enable(false)).unwrap();
		layer.set_input_shape(&shape(4)).unwrap();
		let x = FrameBuffer::from_frames(&[0.2f32, 0.4, 0.6, 0.8], 1, [4]).unwrap();
		let y = layer.forward(&ctx, x.clone(), true).unwrap();
		let y_lut = layer.lut.evaluate(&x).unwrap();
		assert_eq!(y.to_frames::<f32>().unwrap(), y_lut.to_frames::<f32>().unwrap());
		let dx = layer
			.backward(&ctx, FrameBuffer::from_frames(&[1.0f32, 1.0], 1, [2]).unwrap())
			.unwrap();
		assert_eq!(dx.shape(), &shape(4));
	}

	#[test]
	fn test_backward_follows_forward_composition() {
		let ctx = ExecContext::host();
		let x = FrameBuffer::from_frames(
			&[0.1f32, 0.7, 0.4, 0.9, 0.2, 0.6, 0.8, 0.3, 0.5, 0.35, 0.65, 0.15],
			2,
			[6],
		)
		.unwrap();
		let dy = FrameBuffer::from_frames(&[0.5f32, -1.0, 0.25, 1.0, 0.75, -0.5], 2, [3]).unwrap();
		let train = |bn_enable: bool, toggle: Option<bool>| {
			let mut layer =
				StochasticLut::<2>::new(trainable_bn(3).with_bn_enable(bn_enable)).unwrap();
			layer.set_input_shape(&shape(6)).unwrap();
			layer.forward(&ctx, x.clone(), true).unwrap();
			if let Some(enable) = toggle {
				layer.send_command(&Command::BatchNormalization(enable), &Target::All);
			}
			let dx = layer.backward(&ctx, dy.clone()).unwrap();
			let dw = layer.lut.gradients().get(0).unwrap().read().clone();
			(dx.to_frames::<f32>().unwrap(), dw)
		};

		assert_eq!(train(true, Some(false)), train(true, None));
		assert_eq!(train(false, Some(true)), train(false, None));
		assert_ne!(train(true, None), train(false, None));
	}

	fn shape(nodes: usize) -> Shape {
		Shape::from([nodes])
	}
}
