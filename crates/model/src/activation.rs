// Copyright 2025 Irreducible Inc.

//! Elementwise activations. Every one of them runs through [`ops::elementwise`], so the
//! device path and the host path share the kernel bodies.

use bytes::{Buf, BufMut};
use lutnet_compute::{ops, DataType, ExecContext, FrameBuffer, Kernel, Shape};
use lutnet_utils::{ensure, DeserializeBytes, SerializeBytes};
use serde_json::Value;

use crate::{
	layer::{backward_without_forward, check_input, from_payload, shape_or_unset},
	Checkpoint, Command, Error, ForwardNode, Layer,
};

/// Clip band of the straight-through estimator used by binarizing activations.
const STRAIGHT_THROUGH: Kernel = Kernel::HardTanhBackward { lo: -1.0, hi: 1.0 };

fn to_fp32(x: FrameBuffer) -> Result<FrameBuffer, Error> {
	if x.dtype() == DataType::Fp32 {
		Ok(x)
	} else {
		Ok(x.convert(DataType::Fp32)?)
	}
}

fn run(
	ctx: &ExecContext,
	kernel: Kernel,
	inputs: &[&FrameBuffer],
	host_only: bool,
) -> Result<FrameBuffer, Error> {
	Ok(ops::elementwise(ctx, kernel, inputs, host_only)?)
}

fn set_identity_shape(shape_slot: &mut Option<Shape>, shape: &Shape) -> Shape {
	*shape_slot = Some(shape.clone());
	shape.clone()
}

enum ReluCache {
	Output(FrameBuffer),
	Input(FrameBuffer),
}

/// `max(x, 0)`. In binary mode the output is stepped to `{0, 1}` and the gradient passes
/// straight through where `|x| <= 1`.
#[derive(Default)]
pub struct Relu {
	binary: bool,
	host_only: bool,
	shape: Option<Shape>,
	cache: Option<ReluCache>,
}

impl Relu {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_binary(&self) -> bool {
		self.binary
	}

	fn forward_kernel(&self) -> Kernel {
		if self.binary {
			Kernel::BinarizeForward {
				threshold: 0.0,
				lo: 0.0,
				hi: 1.0,
			}
		} else {
			Kernel::ReluForward
		}
	}
}

#[derive(serde::Serialize, serde::Deserialize)]
struct BinaryFlag {
	binary: bool,
}

impl Layer for Relu {
	fn class_name(&self) -> String {
		"ReLU".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.cache = None;
		Ok(set_identity_shape(&mut self.shape, shape))
	}

	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		let x = to_fp32(x)?;
		let y = run(ctx, self.forward_kernel(), &[&x], self.host_only)?;
		self.cache = match (train, self.binary) {
			(false, _) => None,
			(true, true) => Some(ReluCache::Input(x)),
			(true, false) => Some(ReluCache::Output(y.clone())),
		};
		Ok(y)
	}

	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let dy = to_fp32(dy)?;
		match self.cache.take() {
			Some(ReluCache::Output(y)) => {
				run(ctx, Kernel::ReluBackward, &[&y, &dy], self.host_only)
			}
			Some(ReluCache::Input(x)) => run(ctx, STRAIGHT_THROUGH, &[&x, &dy], self.host_only),
			None => Err(backward_without_forward(&self.class_name())),
		}
	}

	fn handle_command(&mut self, command: &Command) {
		match *command {
			Command::Binary(binary) => self.binary = binary,
			Command::HostOnly(host_only) => self.host_only = host_only,
			_ => {}
		}
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		Ok(self.binary.serialize(buf)?)
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		self.binary = bool::deserialize(buf)?;
		Ok(())
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(BinaryFlag {
			binary: self.binary,
		})?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		let flag: BinaryFlag = from_payload(payload)?;
		self.binary = flag.binary;
		Ok(())
	}
}

impl ForwardNode for Relu {
	fn forward_node(&self, _node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let kernel = self.forward_kernel();
		Ok(x.iter().map(|&x| kernel.apply_scalar(x)).collect())
	}
}

/// Steps the input to `{0, 1}` at `threshold`; the gradient passes where `lo <= x <= hi`.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BinarizeConfig {
	pub threshold: f32,
	pub clip_lo: f32,
	pub clip_hi: f32,
}

impl Default for BinarizeConfig {
	fn default() -> Self {
		Self {
			threshold: 0.0,
			clip_lo: -1.0,
			clip_hi: 1.0,
		}
	}
}

#[derive(Default)]
pub struct Binarize {
	config: BinarizeConfig,
	host_only: bool,
	shape: Option<Shape>,
	x: Option<FrameBuffer>,
}

impl Binarize {
	pub fn new(config: BinarizeConfig) -> Self {
		Self {
			config,
			..Default::default()
		}
	}

	fn forward_kernel(&self) -> Kernel {
		Kernel::BinarizeForward {
			threshold: self.config.threshold,
			lo: 0.0,
			hi: 1.0,
		}
	}
}

impl Layer for Binarize {
	fn class_name(&self) -> String {
		"Binarize".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.x = None;
		Ok(set_identity_shape(&mut self.shape, shape))
	}

	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		let x = to_fp32(x)?;
		let y = run(ctx, self.forward_kernel(), &[&x], self.host_only)?;
		self.x = train.then_some(x);
		Ok(y)
	}

	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let x = self
			.x
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let kernel = Kernel::HardTanhBackward {
			lo: self.config.clip_lo,
			hi: self.config.clip_hi,
		};
		run(ctx, kernel, &[&x, &to_fp32(dy)?], self.host_only)
	}

	fn handle_command(&mut self, command: &Command) {
		if let Command::HostOnly(host_only) = *command {
			self.host_only = host_only;
		}
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		self.config.threshold.serialize(&mut *buf)?;
		self.config.clip_lo.serialize(&mut *buf)?;
		Ok(self.config.clip_hi.serialize(buf)?)
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		let threshold = f32::deserialize(&mut *buf)?;
		let clip_lo = f32::deserialize(&mut *buf)?;
		let clip_hi = f32::deserialize(buf)?;
		self.config = BinarizeConfig {
			threshold,
			clip_lo,
			clip_hi,
		};
		Ok(())
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(self.config)?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		self.config = from_payload(payload)?;
		Ok(())
	}
}

impl ForwardNode for Binarize {
	fn forward_node(&self, _node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let kernel = self.forward_kernel();
		Ok(x.iter().map(|&x| kernel.apply_scalar(x)).collect())
	}
}

/// Clips to `[lo, hi]`. In binary mode the output is stepped to `{lo, hi}` at the midpoint;
/// the gradient passes where `lo <= x <= hi` in both modes.
pub struct HardTanh {
	lo: f32,
	hi: f32,
	binary: bool,
	host_only: bool,
	shape: Option<Shape>,
	x: Option<FrameBuffer>,
}

impl HardTanh {
	pub fn new(lo: f32, hi: f32) -> Self {
		Self {
			lo,
			hi,
			binary: false,
			host_only: false,
			shape: None,
			x: None,
		}
	}

	pub fn range(&self) -> (f32, f32) {
		(self.lo, self.hi)
	}

	pub fn is_binary(&self) -> bool {
		self.binary
	}

	fn commit(&mut self, lo: f32, hi: f32, binary: bool) -> Result<(), Error> {
		ensure!(
			lo <= hi,
			Error::InvalidPayload {
				class: self.class_name(),
				what: "clip range",
			}
		);
		(self.lo, self.hi, self.binary) = (lo, hi, binary);
		Ok(())
	}

	fn forward_kernel(&self) -> Kernel {
		if self.binary {
			Kernel::BinarizeForward {
				threshold: (self.lo + self.hi) / 2.0,
				lo: self.lo,
				hi: self.hi,
			}
		} else {
			Kernel::HardTanhForward {
				lo: self.lo,
				hi: self.hi,
			}
		}
	}
}

impl Default for HardTanh {
	fn default() -> Self {
		Self::new(-1.0, 1.0)
	}
}

#[derive(serde::Serialize, serde::Deserialize)]
struct HardTanhPayload {
	lo: f32,
	hi: f32,
	binary: bool,
}

impl Layer for HardTanh {
	fn class_name(&self) -> String {
		"HardTanh".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.x = None;
		Ok(set_identity_shape(&mut self.shape, shape))
	}

	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		let x = to_fp32(x)?;
		let y = run(ctx, self.forward_kernel(), &[&x], self.host_only)?;
		self.x = train.then_some(x);
		Ok(y)
	}

	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let x = self
			.x
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let kernel = Kernel::HardTanhBackward {
			lo: self.lo,
			hi: self.hi,
		};
		run(ctx, kernel, &[&x, &to_fp32(dy)?], self.host_only)
	}

	fn handle_command(&mut self, command: &Command) {
		match *command {
			Command::Binary(binary) => self.binary = binary,
			Command::HostOnly(host_only) => self.host_only = host_only,
			_ => {}
		}
	}

	fn save_payload(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		self.lo.serialize(&mut *buf)?;
		self.hi.serialize(&mut *buf)?;
		Ok(self.binary.serialize(buf)?)
	}

	fn load_payload(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		let lo = f32::deserialize(&mut *buf)?;
		let hi = f32::deserialize(&mut *buf)?;
		let binary = bool::deserialize(buf)?;
		self.commit(lo, hi, binary)
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(serde_json::to_value(HardTanhPayload {
			lo: self.lo,
			hi: self.hi,
			binary: self.binary,
		})?)
	}

	fn load_payload_json(&mut self, payload: &Value) -> Result<(), Error> {
		let HardTanhPayload { lo, hi, binary } = from_payload(payload)?;
		self.commit(lo, hi, binary)
	}
}

impl Checkpoint for HardTanh {
	fn forget(&mut self) {
		self.x = None;
	}

	fn retains_activations(&self) -> bool {
		self.x.is_some()
	}

	fn recompute(&mut self, ctx: &ExecContext, x: FrameBuffer) -> Result<FrameBuffer, Error> {
		self.forward(ctx, x, true)
	}
}

impl ForwardNode for HardTanh {
	fn forward_node(&self, _node: usize, x: &[f64]) -> Result<Vec<f64>, Error> {
		let kernel = self.forward_kernel();
		Ok(x.iter().map(|&x| kernel.apply_scalar(x)).collect())
	}
}
