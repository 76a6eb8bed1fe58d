// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};
use lutnet_compute::{DataType, ExecContext, FrameBuffer, Shape, Tensor};
use lutnet_utils::{ensure, DeserializeBytes, SerializeBytes};
use rayon::prelude::*;
use serde_json::Value;
use tracing::instrument;

use crate::{
	layer::{backward_without_forward, check_input, check_nodes, from_payload, shape_or_unset},
	Checkpoint, Error, ForwardNode, Layer, Variable, Variables,
};

/// Options of [`BatchNormalization`].
///
/// `momentum` is the weight of each training batch in the running statistics:
/// `running = (1 - momentum) * running + momentum * batch`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormalizationConfig {
	pub momentum: f32,
	pub gamma: f32,
	pub beta: f32,
	pub fix_gamma: bool,
	pub fix_beta: bool,
	pub epsilon: f32,
}

impl Default for BatchNormalizationConfig {
	fn default() -> Self {
		Self {
			momentum: 0.1,
			gamma: 1.0,
			beta: 0.0,
			fix_gamma: false,
			fix_beta: false,
			epsilon: 1.0e-7,
		}
	}
}

impl BatchNormalizationConfig {
	pub fn with_momentum(self, momentum: f32) -> Self {
		Self { momentum, ..self }
	}
}

/// Per-node statistics of one training batch.
#[derive(Clone, Debug)]
struct BatchStats {
	mean: Vec<f32>,
	rstd: Vec<f32>,
}

/// Normalizes every node over the frames of a batch, then scales by `gamma` and shifts by
/// `beta`. Inference uses the running statistics.
pub struct BatchNormalization {
	config: BatchNormalizationConfig,
	shape: Option<Shape>,
	gamma: Variable,
	beta: Variable,
	dgamma: Variable,
	dbeta: Variable,
	running_mean: Tensor,
	running_var: Tensor,
	stats: Option<BatchStats>,
	x: Option<FrameBuffer>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct BatchNormPayload {
	gamma: Tensor,
	beta: Tensor,
	running_mean: Tensor,
	running_var: Tensor,
}

impl BatchNormalization {
	pub fn new(config: BatchNormalizationConfig) -> Self {
		Self {
			config,
			shape: None,
			gamma: Variable::default(),
			beta: Variable::default(),
			dgamma: Variable::default(),
			dbeta: Variable::default(),
			running_mean: Tensor::default(),
			running_var: Tensor::default(),
			stats: None,
			x: None,
		}
	}

	pub fn config(&self) -> &BatchNormalizationConfig {
		&self.config
	}

	pub fn running_mean(&self) -> &Tensor {
		&self.running_mean
	}

	pub fn running_var(&self) -> &Tensor {
		&self.running_var
	}

	fn normalize(
		&self,
		x: &FrameBuffer,
		mean: &[f32],
		rstd: &[f32],
	) -> Result<FrameBuffer, Error> {
		let gamma = self.gamma.read();
		let beta = self.beta.read();
		let (gamma, beta) = (gamma.as_slice(), beta.as_slice());
		let xv = x.lock::<f32>()?;
		let mut y = FrameBuffer::new(DataType::Fp32, x.frames(), x.shape().clone());
		y.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.for_each(|(node, row)| {
				for (out, &x) in row.iter_mut().zip(xv.node(node)) {
					*out = gamma[node] * (x - mean[node]) * rstd[node] + beta[node];
				}
			});
		Ok(y)
	}

	fn batch_stats(&self, x: &FrameBuffer) -> Result<(BatchStats, Vec<f32>), Error> {
		let epsilon = self.config.epsilon as f64;
		let xv = x.lock::<f32>()?;
		let frames = x.frames().max(1) as f64;
		let per_node: Vec<(f32, f32, f32)> = (0..x.node_count())
			.into_par_iter()
			.map(|node| {
				let row = xv.node(node);
				let mean = row.iter().map(|&v| v as f64).sum::<f64>() / frames;
				let var = row.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / frames;
				(mean as f32, (1.0 / (var + epsilon).sqrt()) as f32, var as f32)
			})
			.collect();
		let mean = per_node.iter().map(|s| s.0).collect();
		let rstd = per_node.iter().map(|s| s.1).collect();
		let var = per_node.iter().map(|s| s.2).collect();
		Ok((BatchStats { mean, rstd }, var))
	}

	fn node_count(&self) -> Result<usize, Error> {
		Ok(self.input_shape()?.node_count())
	}
}

impl Default for BatchNormalization {
	fn default() -> Self {
		Self::new(BatchNormalizationConfig::default())
	}
}

impl Layer for BatchNormalization {
	fn class_name(&self) -> String {
		"BatchNormalization".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		let nodes = [shape.node_count()];
		*self.gamma.write() = Tensor::filled(nodes, self.config.gamma);
		*self.beta.write() = Tensor::filled(nodes, self.config.beta);
		*self.dgamma.write() = Tensor::zeros(nodes);
		*self.dbeta.write() = Tensor::zeros(nodes);
		self.running_mean = Tensor::zeros(nodes);
		self.running_var = Tensor::filled(nodes, 1.0);
		self.stats = None;
		self.x = None;
		self.shape = Some(shape.clone());
		Ok(shape.clone())
	}

	#[instrument(skip_all, level = "trace", fields(frames = x.frames(), train))]
	fn forward(
		&mut self,
		_ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		let x = if x.dtype() == DataType::Fp32 {
			x
		} else {
			x.convert(DataType::Fp32)?
		};

		if !train {
			self.stats = None;
			self.x = None;
			let epsilon = self.config.epsilon;
			let rstd: Vec<f32> = self
				.running_var
				.as_slice()
				.iter()
				.map(|&var| 1.0 / (var + epsilon).sqrt())
				.collect();
			return self.normalize(&x, self.running_mean.as_slice(), &rstd);
		}

		let (stats, var) = self.batch_stats(&x)?;
		let y = self.normalize(&x, &stats.mean, &stats.rstd)?;
		let momentum = self.config.momentum;
		for (running, &batch) in self.running_mean.as_mut_slice().iter_mut().zip(&stats.mean) {
			*running = (1.0 - momentum) * *running + momentum * batch;
		}
		for (running, &batch) in self.running_var.as_mut_slice().iter_mut().zip(&var) {
			*running = (1.0 - momentum) * *running + momentum * batch;
		}
		self.stats = Some(stats);
		self.x = Some(x);
		Ok(y)
	}

	#[instrument(skip_all, level = "trace")]
	fn backward(&mut self, _ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let (Some(x), Some(stats)) = (self.x.take(), self.stats.as_ref()) else {
			return Err(backward_without_forward(&self.class_name()));
		};
		check_nodes(&self.class_name(), x.node_count(), &dy)?;
		ensure!(
			dy.frames() == x.frames(),
			Error::FrameCountMismatch {
				class: self.class_name(),
				expected: x.frames(),
				actual: dy.frames(),
			}
		);
		let mut dy = if dy.dtype() == DataType::Fp32 {
			dy
		} else {
			dy.convert(DataType::Fp32)?
		};
		if dy.shares_storage(&x) {
			dy.make_unique()?;
		}

		let frames = x.frames().max(1) as f32;
		let gamma = self.gamma.read();
		let gamma = gamma.as_slice();
		let xv = x.lock::<f32>()?;
		let dyv = dy.lock::<f32>()?;
		let mut dx = FrameBuffer::new(DataType::Fp32, x.frames(), x.shape().clone());
		let sums: Vec<(f32, f32)> = dx
			.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.map(|(node, out)| {
				let (mean, rstd) = (stats.mean[node], stats.rstd[node]);
				let (x, dy) = (xv.node(node), dyv.node(node));
				let mut dy_sum = 0.0f32;
				let mut dy_xhat_sum = 0.0f32;
				for (&x, &dy) in x.iter().zip(dy) {
					dy_sum += dy;
					dy_xhat_sum += dy * (x - mean) * rstd;
				}
				let scale = gamma[node] * rstd / frames;
				for ((out, &x), &dy) in out.iter_mut().zip(x).zip(dy) {
					let xhat = (x - mean) * rstd;
					*out = scale * (frames * dy - dy_sum - xhat * dy_xhat_sum);
				}
				(dy_xhat_sum, dy_sum)
			})
			.collect();

		let mut dgamma = self.dgamma.write();
		let mut dbeta = self.dbeta.write();
		for ((dgamma, dbeta), (dy_xhat_sum, dy_sum)) in dgamma
			.as_mut_slice()
			.iter_mut()
			.zip(dbeta.as_mut_slice())
			.zip(sums)
		{
			*dgamma += dy_xhat_sum;
			*dbeta += dy_sum;
		}
		Ok(dx)
	}

	fn parameters(&self) -> Variables {
		let mut variables = Variables::new();
		if !self.config.fix_gamma {
			variables.push(self.gamma.clone());
		}
		if !self.config.fix_beta {
			variables.push(self.beta.clone());
		}
		variables
	}

	fn gradients(&self) -> Variables {
		let mut variables = Variables::new();
		if !self.config.fix_gamma {
			variables.push(self.dgamma.clone());
		}
		if !self.config.fix_beta {
			variables.push(self.dbeta.clone());
		}
		variables
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		self.gamma.read().serialize(&mut *buf)?;
		self.beta.read().serialize(&mut *buf)?;
		self.running_mean.serialize(&mut *buf)?;
		self.running_var.serialize(buf)?;
		Ok(())
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		let payload = BatchNormPayload {
			gamma: Tensor::deserialize(&mut *buf)?,
			beta: Tensor::deserialize(&mut *buf)?,
			running_mean: Tensor::deserialize(&mut *buf)?,
			running_var: Tensor::deserialize(buf)?,
		};
		self.commit(payload)
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(BatchNormPayload {
			gamma: self.gamma.read().clone(),
			beta: self.beta.read().clone(),
			running_mean: self.running_mean.clone(),
			running_var: self.running_var.clone(),
		})?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		let payload = from_payload(payload)?;
		self.commit(payload)
	}
}

impl BatchNormalization {
	fn commit(&mut self, payload: BatchNormPayload) -> Result<(), Error> {
		let nodes = self.node_count()?;
		for (tensor, what) in [
			(&payload.gamma, "gamma"),
			(&payload.beta, "beta"),
			(&payload.running_mean, "running mean"),
			(&payload.running_var, "running variance"),
		] {
			ensure!(
				tensor.len() == nodes,
				Error::InvalidPayload {
					class: self.class_name(),
					what,
				}
			);
		}
		*self.gamma.write() = payload.gamma;
		*self.beta.write() = payload.beta;
		self.running_mean = payload.running_mean;
		self.running_var = payload.running_var;
		Ok(())
	}
}

impl Checkpoint for BatchNormalization {
	fn forget(&mut self) {
		self.x = None;
	}

	fn retains_activations(&self) -> bool {
		self.x.is_some()
	}

	fn recompute(&mut self, _ctx: &ExecContext, x: FrameBuffer) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		let stats = self
			.stats
			.as_ref()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let y = self.normalize(&x, &stats.mean, &stats.rstd)?;
		self.x = Some(x);
		Ok(y)
	}
}

impl ForwardNode for BatchNormalization {
	fn forward_node(&self, node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let nodes = self.node_count()?;
		ensure!(
			node < nodes,
			lutnet_connect::Error::NodeOutOfRange {
				node,
				output_node_count: nodes,
			}
		);
		let gamma = self.gamma.read().as_slice()[node] as f64;
		let beta = self.beta.read().as_slice()[node] as f64;
		let mean = self.running_mean.as_slice()[node] as f64;
		let var = self.running_var.as_slice()[node] as f64;
		let rstd = 1.0 / (var + self.config.epsilon as f64).sqrt();
		Ok(x.iter().map(|&x| gamma * (x - mean) * rstd + beta).collect())
	}
}
