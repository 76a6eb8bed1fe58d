// Copyright 2025 Irreducible Inc.

use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_connect::ConnectionTable;
use tracing::{instrument, trace};

use crate::{
	layer::backward_without_forward, BatchNormalization, BatchNormalizationConfig, Checkpoint,
	Command, Error, ForwardNode, HardTanh, Layer, LutConfig, SparseConnectable, StochasticLutN,
	Variable,
};

/// Options of [`SparseLutN`].
#[derive(Debug, Clone, PartialEq)]
pub struct SparseLutConfig {
	pub lut: LutConfig,
	pub batch_norm: BatchNormalizationConfig,
	/// Drop the normalization and activation buffers after forward and rebuild them in
	/// backward from the table input.
	pub memory_saving: bool,
}

impl SparseLutConfig {
	pub fn new(output_shape: impl Into<Shape>) -> Self {
		Self {
			lut: LutConfig::new(output_shape),
			batch_norm: BatchNormalizationConfig {
				momentum: 0.01,
				gamma: 0.2,
				beta: 0.5,
				..Default::default()
			},
			memory_saving: true,
		}
	}

	pub fn with_connection(self, connection: impl Into<String>) -> Self {
		Self {
			lut: self.lut.with_connection(connection),
			..self
		}
	}

	pub fn with_seed(self, seed: u64) -> Self {
		Self {
			lut: self.lut.with_seed(seed),
			..self
		}
	}

	pub fn with_memory_saving(self, memory_saving: bool) -> Self {
		Self {
			memory_saving,
			..self
		}
	}
}

/// Sparse LUT block: `N`-input stochastic tables, batch normalization, then a clip to `[0, 1]`.
pub struct SparseLutN<const N: usize> {
	lut: StochasticLutN<N>,
	batch_norm: BatchNormalization,
	activation: HardTanh,
	memory_saving: bool,
}

impl<const N: usize> SparseLutN<N> {
	pub fn new(config: SparseLutConfig) -> Result<Self, Error> {
		Ok(Self {
			lut: StochasticLutN::new(config.lut)?,
			batch_norm: BatchNormalization::new(config.batch_norm),
			activation: HardTanh::new(0.0, 1.0),
			memory_saving: config.memory_saving,
		})
	}

	pub fn memory_saving(&self) -> bool {
		self.memory_saving
	}

	pub fn lut(&self) -> &StochasticLutN<N> {
		&self.lut
	}

	pub fn batch_norm(&self) -> &BatchNormalization {
		&self.batch_norm
	}

	/// Whether backward has to rebuild intermediates from the checkpoint first.
	fn needs_recompute(&self) -> bool {
		!self.batch_norm.retains_activations() || !self.activation.retains_activations()
	}
}

impl<const N: usize> Layer for SparseLutN<N> {
	fn class_name(&self) -> String {
		format!("SparseLut{N}")
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		self.lut.input_shape()
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.activation.output_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		let shape = self.lut.set_input_shape(shape)?;
		let shape = self.batch_norm.set_input_shape(&shape)?;
		self.activation.set_input_shape(&shape)
	}

	#[instrument(skip_all, fields(frames = x.frames(), train, memory_saving = self.memory_saving))]
	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		let discard = self.memory_saving || !train;
		let y = self.lut.forward(ctx, x, train)?;
		let y = self.batch_norm.forward(ctx, y, train)?;
		if discard {
			self.batch_norm.forget();
		}
		let y = self.activation.forward(ctx, y, train)?;
		if discard {
			self.activation.forget();
		}
		Ok(y)
	}

	#[instrument(skip_all, fields(frames = dy.frames()))]
	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		if self.needs_recompute() {
			let x = self
				.lut
				.cached_input()
				.ok_or_else(|| backward_without_forward(&self.class_name()))?;
			trace!("recomputing activations from the table input");
			let y = self.lut.evaluate(x)?;
			let y = self.batch_norm.recompute(ctx, y)?;
			self.activation.recompute(ctx, y)?;
		}
		let dy = self.activation.backward(ctx, dy)?;
		let dy = self.batch_norm.backward(ctx, dy)?;
		self.lut.backward(ctx, dy)
	}

	fn handle_command(&mut self, command: &Command) {
		if let Command::MemorySaving(memory_saving) = *command {
			self.memory_saving = memory_saving;
		}
	}

	fn children(&self) -> Vec<&dyn Layer> {
		vec![
			&self.lut as &dyn Layer,
			&self.batch_norm,
			&self.activation,
		]
	}

	fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
		vec![
			&mut self.lut as &mut dyn Layer,
			&mut self.batch_norm,
			&mut self.activation,
		]
	}

	fn as_sparse(&self) -> Option<&dyn SparseConnectable> {
		Some(self)
	}

	fn as_sparse_mut(&mut self) -> Option<&mut dyn SparseConnectable> {
		Some(self)
	}
}

impl<const N: usize> SparseConnectable for SparseLutN<N> {
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

impl<const N: usize> ForwardNode for SparseLutN<N> {
	fn forward_node(&self, node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let y = self.lut.forward_node(node, x)?;
		let y = self.batch_norm.forward_node(node, &y)?;
		self.activation.forward_node(node, &y)
	}
}
