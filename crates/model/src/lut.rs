// Copyright 2025 Irreducible Inc.

use std::ops::{Add, Mul, Sub};

use bytes::{Buf, BufMut};
use lutnet_compute::{DataType, ExecContext, FrameBuffer, Shape, Tensor};
use lutnet_connect::{generate, ConnectionRule, ConnectionTable};
use lutnet_utils::{ensure, DeserializeBytes, SerializeBytes};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::{
	layer::{backward_without_forward, check_input, check_nodes, from_payload, shape_or_unset},
	Error, ForwardNode, Layer, SparseConnectable, Variable, Variables,
};

/// Largest supported fan-in of a lookup table node.
pub const MAX_LUT_INPUTS: usize = 6;

const MAX_TABLE_SIZE: usize = 1 << MAX_LUT_INPUTS;

/// Options of a sparse lookup table layer.
#[derive(Debug, Clone, PartialEq)]
pub struct LutConfig {
	pub output_shape: Shape,
	/// Name of the [`ConnectionRule`]; empty means random.
	pub connection: String,
	pub seed: u64,
}

impl LutConfig {
	pub fn new(output_shape: impl Into<Shape>) -> Self {
		Self {
			output_shape: output_shape.into(),
			connection: ConnectionRule::Random.name().to_string(),
			seed: 1,
		}
	}

	pub fn with_connection(self, connection: impl Into<String>) -> Self {
		Self {
			connection: connection.into(),
			..self
		}
	}

	pub fn with_seed(self, seed: u64) -> Self {
		Self { seed, ..self }
	}
}

/// Probability of each table entry being addressed when input `i` is 1 with probability
/// `x[i]`. Bit `i` of the entry index selects input `i`.
fn probabilities<T>(x: &[T], p: &mut [T])
where
	T: Copy + From<f32> + Sub<Output = T> + Mul<Output = T>,
{
	p[0] = T::from(1.0);
	for (i, &xi) in x.iter().enumerate() {
		let half = 1 << i;
		for k in 0..half {
			let pk = p[k];
			p[k | half] = pk * xi;
			p[k] = pk * (T::from(1.0) - xi);
		}
	}
}

/// Expected table output, `sum_k W_k p_k`, with the weights clipped to `[0, 1]`.
fn expected_output<T>(x: &[T], weights: &[f32]) -> T
where
	T: Copy + From<f32> + Add<Output = T> + Sub<Output = T> + Mul<Output = T>,
{
	let mut p = [T::from(0.0); MAX_TABLE_SIZE];
	let p = &mut p[..1 << x.len()];
	probabilities(x, p);
	p.iter()
		.zip(weights)
		.fold(T::from(0.0), |acc, (&p, &w)| acc + p * T::from(w.clamp(0.0, 1.0)))
}

/// Differentiable `N`-input lookup table.
///
/// Inputs are read as probabilities in `[0, 1]`; each output node holds `2^N` table weights
/// and outputs their expectation under independent input bits.
#[derive(Debug)]
pub struct StochasticLutN<const N: usize> {
	config: LutConfig,
	rule: ConnectionRule,
	input_shape: Option<Shape>,
	table: Option<ConnectionTable>,
	w: Variable,
	dw: Variable,
	x: Option<FrameBuffer>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct LutPayload {
	connection: ConnectionTable,
	weights: Tensor,
}

impl<const N: usize> StochasticLutN<N> {
	pub fn new(config: LutConfig) -> Result<Self, Error> {
		ensure!(
			(1..=MAX_LUT_INPUTS).contains(&N),
			Error::InvalidConfig {
				class: format!("StochasticLut{N}"),
				reason: format!("fan-in must be between 1 and {MAX_LUT_INPUTS}"),
			}
		);
		let rule = config.connection.parse()?;
		Ok(Self {
			config,
			rule,
			input_shape: None,
			table: None,
			w: Variable::default(),
			dw: Variable::default(),
			x: None,
		})
	}

	pub fn config(&self) -> &LutConfig {
		&self.config
	}

	/// Input of the last training forward, kept until the next one.
	pub fn cached_input(&self) -> Option<&FrameBuffer> {
		self.x.as_ref()
	}

	pub fn weights(&self) -> &Variable {
		&self.w
	}

	fn table(&self) -> Result<&ConnectionTable, Error> {
		self.table.as_ref().ok_or_else(|| Error::ShapeNotSet {
			class: self.class_name(),
		})
	}

	fn output_node_count(&self) -> usize {
		self.config.output_shape.node_count()
	}

	/// Table outputs for `x` without touching the training cache.
	pub(crate) fn evaluate(&self, x: &FrameBuffer) -> Result<FrameBuffer, Error> {
		let table = self.table()?;
		let weights = self.w.read();
		let weights = weights.as_slice();
		let xv = x.lock::<f32>()?;
		let frames = x.frames();
		let mut y = FrameBuffer::new(DataType::Fp32, frames, self.config.output_shape.clone());
		y.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.for_each(|(node, out)| {
				let rows: Vec<&[f32]> = table.row(node).iter().map(|&i| xv.node(i)).collect();
				let w = &weights[node << N..(node + 1) << N];
				let mut xs = [0.0f32; MAX_LUT_INPUTS];
				for (frame, out) in out.iter_mut().enumerate() {
					for (slot, row) in rows.iter().enumerate() {
						xs[slot] = row[frame].clamp(0.0, 1.0);
					}
					*out = expected_output(&xs[..N], w);
				}
			});
		Ok(y)
	}

	fn commit(&mut self, payload: LutPayload) -> Result<(), Error> {
		let input_nodes = self.input_shape()?.node_count();
		let output_nodes = self.output_node_count();
		let LutPayload {
			connection,
			weights,
		} = payload;
		ensure!(
			connection.input_node_count() == input_nodes
				&& connection.output_node_count() == output_nodes
				&& connection.fan_in() == N,
			Error::InvalidPayload {
				class: self.class_name(),
				what: "connection table",
			}
		);
		ensure!(
			weights.len() == output_nodes << N,
			Error::InvalidPayload {
				class: self.class_name(),
				what: "table weights",
			}
		);
		self.table = Some(connection);
		*self.w.write() = weights;
		Ok(())
	}
}

impl<const N: usize> Layer for StochasticLutN<N> {
	fn class_name(&self) -> String {
		format!("StochasticLut{N}")
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.input_shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		Ok(self.config.output_shape.clone())
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		let table = generate(self.rule, shape, &self.config.output_shape, N, self.config.seed)?;
		let output_nodes = self.output_node_count();
		let mut rng = StdRng::seed_from_u64(self.config.seed);
		let weights = (0..output_nodes << N)
			.map(|_| 0.5 + 0.01 * rng.sample::<f32, _>(StandardNormal))
			.collect();
		*self.w.write() = Tensor::from_vec([1 << N, output_nodes], weights)?;
		*self.dw.write() = Tensor::zeros([1 << N, output_nodes]);
		self.table = Some(table);
		self.input_shape = Some(shape.clone());
		self.x = None;
		debug!(
			class = %self.class_name(),
			input = %shape,
			output = %self.config.output_shape,
			"initialized lookup tables"
		);
		Ok(self.config.output_shape.clone())
	}

	#[instrument(skip_all, level = "trace", fields(frames = x.frames(), train))]
	fn forward(
		&mut self,
		_ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.input_shape, &x)?;
		let x = if x.dtype() == DataType::Fp32 {
			x
		} else {
			x.convert(DataType::Fp32)?
		};
		let y = self.evaluate(&x)?;
		self.x = train.then_some(x);
		Ok(y)
	}

	#[instrument(skip_all, level = "trace")]
	fn backward(&mut self, _ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let x = self
			.x
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		check_nodes(&self.class_name(), self.output_node_count(), &dy)?;
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
		let frames = x.frames();
		let table = self.table()?;

		// Per output node: table weight gradient and slot-major input gradient.
		let partials: Vec<(Vec<f32>, Vec<f32>)> = {
			let weights = self.w.read();
			let weights = weights.as_slice();
			let xv = x.lock::<f32>()?;
			let dyv = dy.lock::<f32>()?;
			(0..self.output_node_count())
				.into_par_iter()
				.map(|node| {
					let rows: Vec<&[f32]> = table.row(node).iter().map(|&i| xv.node(i)).collect();
					let w = &weights[node << N..(node + 1) << N];
					let mut dw = vec![0.0f32; 1 << N];
					let mut dx = vec![0.0f32; N * frames];
					let mut xs = [0.0f32; MAX_LUT_INPUTS];
					let mut p = [0.0f32; MAX_TABLE_SIZE];
					for (frame, &dy) in dyv.node(node).iter().enumerate() {
						for (slot, row) in rows.iter().enumerate() {
							xs[slot] = row[frame].clamp(0.0, 1.0);
						}
						probabilities(&xs[..N], &mut p[..1 << N]);
						for (dw, &p) in dw.iter_mut().zip(&p[..1 << N]) {
							*dw += dy * p;
						}
						// The output is multilinear, so each partial is a difference of two
						// corners.
						for slot in 0..N {
							let saved = xs[slot];
							xs[slot] = 1.0;
							let hi = expected_output(&xs[..N], w);
							xs[slot] = 0.0;
							let lo = expected_output(&xs[..N], w);
							xs[slot] = saved;
							dx[slot * frames + frame] = dy * (hi - lo);
						}
					}
					(dw, dx)
				})
				.collect()
		};

		let mut dx = FrameBuffer::new(DataType::Fp32, frames, x.shape().clone());
		{
			let mut dxv = dx.lock_mut::<f32>()?;
			let mut dw = self.dw.write();
			let dw = dw.as_mut_slice();
			for (node, (node_dw, node_dx)) in partials.iter().enumerate() {
				for (acc, &g) in dw[node << N..(node + 1) << N].iter_mut().zip(node_dw) {
					*acc += g;
				}
				for (slot, &input) in table.row(node).iter().enumerate() {
					let grads = &node_dx[slot * frames..(slot + 1) * frames];
					for (acc, &g) in dxv.node_mut(input).iter_mut().zip(grads) {
						*acc += g;
					}
				}
			}
		}
		Ok(dx)
	}

	fn parameters(&self) -> Variables {
		[self.w.clone()].into_iter().collect()
	}

	fn gradients(&self) -> Variables {
		[self.dw.clone()].into_iter().collect()
	}

	fn as_sparse(&self) -> Option<&dyn SparseConnectable> {
		Some(self)
	}

	fn as_sparse_mut(&mut self) -> Option<&mut dyn SparseConnectable> {
		Some(self)
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		self.table()?.serialize(&mut *buf)?;
		self.w.read().serialize(buf)?;
		Ok(())
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		let payload = LutPayload {
			connection: ConnectionTable::deserialize(&mut *buf)?,
			weights: Tensor::deserialize(buf)?,
		};
		self.commit(payload)
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(LutPayload {
			connection: self.table()?.clone(),
			weights: self.w.read().clone(),
		})?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		let payload = from_payload(payload)?;
		self.commit(payload)
	}
}

impl<const N: usize> SparseConnectable for StochasticLutN<N> {
	fn connection_table(&self) -> Result<&ConnectionTable, Error> {
		self.table()
	}

	fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable, Error> {
		let class = self.class_name();
		self.table
			.as_mut()
			.ok_or(Error::ShapeNotSet { class })
	}

	fn table_weights(&self) -> &Variable {
		&self.w
	}
}

impl<const N: usize> ForwardNode for StochasticLutN<N> {
	fn forward_node(&self, node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let output_nodes = self.output_node_count();
		ensure!(
			node < output_nodes,
			lutnet_connect::Error::NodeOutOfRange {
				node,
				output_node_count: output_nodes,
			}
		);
		ensure!(
			x.len() == N,
			Error::NodeCountMismatch {
				class: self.class_name(),
				expected: N,
				actual: x.len(),
			}
		);
		let weights = self.w.read();
		let w = &weights.as_slice()[node << N..(node + 1) << N];
		let mut xs = [0.0f64; MAX_LUT_INPUTS];
		for (slot, &value) in x.iter().enumerate() {
			xs[slot] = value.clamp(0.0, 1.0);
		}
		Ok(vec![expected_output(&xs[..N], w)])
	}
}
