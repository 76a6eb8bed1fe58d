// Copyright 2025 Irreducible Inc.

//! Frame modulation: one real-valued frame becomes `modulation_size` binary frames and back.

use std::fmt;

use lutnet_compute::{DataType, ExecContext, FrameBuffer, Shape};
use lutnet_utils::{bail, checked_arithmetics::checked_int_div, ensure};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use tracing::instrument;

use crate::{
	layer::{backward_without_forward, check_input, check_nodes, shape_or_unset},
	Error, Layer,
};

/// Source of binarization thresholds in `[0, 1]`.
pub trait ValueGenerator: fmt::Debug + Send + Sync {
	fn next_value(&mut self) -> f32;

	/// Restarts the sequence from its seed.
	fn reset(&mut self);
}

/// Uniformly distributed thresholds.
#[derive(Debug)]
pub struct UniformValueGenerator {
	seed: u64,
	rng: StdRng,
}

impl UniformValueGenerator {
	pub fn new(seed: u64) -> Self {
		Self {
			seed,
			rng: StdRng::seed_from_u64(seed),
		}
	}
}

impl ValueGenerator for UniformValueGenerator {
	fn next_value(&mut self) -> f32 {
		self.rng.gen()
	}

	fn reset(&mut self) {
		self.rng = StdRng::seed_from_u64(self.seed);
	}
}

/// Normally distributed thresholds, clipped to `[0, 1]`.
#[derive(Debug)]
pub struct NormalValueGenerator {
	mean: f32,
	std: f32,
	seed: u64,
	rng: StdRng,
}

impl NormalValueGenerator {
	pub fn new(mean: f32, std: f32, seed: u64) -> Self {
		Self {
			mean,
			std,
			seed,
			rng: StdRng::seed_from_u64(seed),
		}
	}
}

impl ValueGenerator for NormalValueGenerator {
	fn next_value(&mut self) -> f32 {
		let z: f32 = self.rng.sample(StandardNormal);
		(self.mean + self.std * z).clamp(0.0, 1.0)
	}

	fn reset(&mut self) {
		self.rng = StdRng::seed_from_u64(self.seed);
	}
}

/// Modulation parameters of one mode (training or inference).
#[derive(Debug)]
pub struct ModulationConfig {
	pub modulation_size: usize,
	/// `None` spaces the thresholds evenly over the input range.
	pub value_generator: Option<Box<dyn ValueGenerator>>,
	/// Draw one threshold per binary frame instead of one per element.
	pub framewise: bool,
	pub input_range_lo: f32,
	pub input_range_hi: f32,
}

impl Default for ModulationConfig {
	fn default() -> Self {
		Self {
			modulation_size: 1,
			value_generator: None,
			framewise: true,
			input_range_lo: 0.0,
			input_range_hi: 1.0,
		}
	}
}

impl ModulationConfig {
	pub fn with_modulation_size(self, modulation_size: usize) -> Self {
		Self {
			modulation_size,
			..self
		}
	}

	pub fn with_value_generator(self, generator: impl ValueGenerator + 'static) -> Self {
		Self {
			value_generator: Some(Box::new(generator)),
			..self
		}
	}

	pub fn with_framewise(self, framewise: bool) -> Self {
		Self { framewise, ..self }
	}

	/// Rewinds the value generator, if any, to its seed.
	pub fn reset_generator(&mut self) {
		if let Some(generator) = &mut self.value_generator {
			generator.reset();
		}
	}

	pub fn with_input_range(self, lo: f32, hi: f32) -> Self {
		Self {
			input_range_lo: lo,
			input_range_hi: hi,
			..self
		}
	}

	pub(crate) fn validate(&self, class: &str) -> Result<(), Error> {
		ensure!(
			self.modulation_size > 0,
			Error::InvalidConfig {
				class: class.to_string(),
				reason: "modulation size must be positive".into(),
			}
		);
		ensure!(
			self.input_range_hi > self.input_range_lo,
			Error::InvalidConfig {
				class: class.to_string(),
				reason: format!(
					"empty input range [{}, {}]",
					self.input_range_lo, self.input_range_hi
				),
			}
		);
		Ok(())
	}
}

enum Thresholds {
	Even(usize),
	PerFrame(Vec<f32>),
	PerElement { values: Vec<f32>, nodes: usize },
}

impl Thresholds {
	fn get(&self, out_frame: usize, node: usize) -> f32 {
		match self {
			Self::Even(modulation_size) => {
				((out_frame % modulation_size) as f32 + 0.5) / *modulation_size as f32
			}
			Self::PerFrame(values) => values[out_frame],
			Self::PerElement { values, nodes } => values[out_frame * nodes + node],
		}
	}
}

/// What backward needs to know about the last training forward.
#[derive(Clone, Copy, Debug)]
struct ModulationState {
	frames: usize,
	modulation_size: usize,
	scale: f32,
}

/// Expands every input frame into `modulation_size` binary frames by comparing the input,
/// mapped from the input range onto `[0, 1]`, with a threshold per binary frame.
#[derive(Debug)]
pub struct RealToBinary {
	modulation: ModulationConfig,
	bin_dtype: DataType,
	shape: Option<Shape>,
	last: Option<ModulationState>,
}

impl RealToBinary {
	/// `bin_dtype` is `Fp32` (0.0/1.0 values) or `Bit`.
	pub fn new(modulation: ModulationConfig, bin_dtype: DataType) -> Result<Self, Error> {
		modulation.validate("RealToBinary")?;
		ensure!(
			bin_dtype != DataType::Fp64,
			Error::InvalidConfig {
				class: "RealToBinary".into(),
				reason: "binary frames are Fp32 or Bit".into(),
			}
		);
		Ok(Self {
			modulation,
			bin_dtype,
			shape: None,
			last: None,
		})
	}

	pub fn modulation(&self) -> &ModulationConfig {
		&self.modulation
	}

	pub(crate) fn modulation_mut(&mut self) -> &mut ModulationConfig {
		&mut self.modulation
	}

	fn thresholds(&mut self, out_frames: usize, nodes: usize) -> Thresholds {
		let modulation = &mut self.modulation;
		match (&mut modulation.value_generator, modulation.framewise) {
			(None, _) => Thresholds::Even(modulation.modulation_size),
			(Some(generator), true) => {
				Thresholds::PerFrame((0..out_frames).map(|_| generator.next_value()).collect())
			}
			(Some(generator), false) => Thresholds::PerElement {
				values: (0..out_frames * nodes)
					.map(|_| generator.next_value())
					.collect(),
				nodes,
			},
		}
	}
}

impl Layer for RealToBinary {
	fn class_name(&self) -> String {
		"RealToBinary".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.shape = Some(shape.clone());
		self.last = None;
		self.modulation.reset_generator();
		Ok(shape.clone())
	}

	#[instrument(
		skip_all,
		level = "trace",
		fields(frames = x.frames(), modulation_size = self.modulation.modulation_size)
	)]
	fn forward(
		&mut self,
		_ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.shape, &x)?;
		self.modulation.validate(&self.class_name())?;
		let x = if x.dtype() == DataType::Fp32 {
			x
		} else {
			x.convert(DataType::Fp32)?
		};
		let modulation_size = self.modulation.modulation_size;
		let (lo, hi) = (self.modulation.input_range_lo, self.modulation.input_range_hi);
		let (frames, nodes) = (x.frames(), x.node_count());
		let out_frames = frames * modulation_size;
		let thresholds = self.thresholds(out_frames, nodes);
		let bit = |value: f32, out_frame: usize, node: usize| {
			(value - lo) / (hi - lo) > thresholds.get(out_frame, node)
		};

		let xv = x.lock::<f32>()?;
		let mut y = FrameBuffer::new(self.bin_dtype, out_frames, x.shape().clone());
		match self.bin_dtype {
			DataType::Bit => {
				let mut yv = y.lock_bits_mut()?;
				for node in 0..nodes {
					for (frame, &value) in xv.node(node).iter().enumerate() {
						for m in 0..modulation_size {
							let out_frame = frame * modulation_size + m;
							yv.set(out_frame, node, bit(value, out_frame, node));
						}
					}
				}
			}
			_ => {
				y.lock_mut::<f32>()?
					.par_nodes_mut()
					.enumerate()
					.for_each(|(node, out)| {
						let row = xv.node(node);
						for (out_frame, out) in out.iter_mut().enumerate() {
							let value = row[out_frame / modulation_size];
							*out = if bit(value, out_frame, node) { 1.0 } else { 0.0 };
						}
					});
			}
		}
		self.last = train.then_some(ModulationState {
			frames,
			modulation_size,
			scale: 1.0 / (hi - lo),
		});
		Ok(y)
	}

	fn backward(&mut self, _ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let state = self
			.last
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let ModulationState {
			frames,
			modulation_size,
			scale,
		} = state;
		check_nodes(&self.class_name(), self.input_shape()?.node_count(), &dy)?;
		ensure!(
			dy.frames() == frames * modulation_size,
			Error::FrameCountMismatch {
				class: self.class_name(),
				expected: frames * modulation_size,
				actual: dy.frames(),
			}
		);
		let dy = if dy.dtype() == DataType::Fp32 {
			dy
		} else {
			dy.convert(DataType::Fp32)?
		};
		let dyv = dy.lock::<f32>()?;
		let mut dx = FrameBuffer::new(DataType::Fp32, frames, dy.shape().clone());
		dx.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.for_each(|(node, out)| {
				let grads = dyv.node(node).chunks_exact(modulation_size);
				for (out, grads) in out.iter_mut().zip(grads) {
					*out = grads.iter().sum::<f32>() * scale;
				}
			});
		Ok(dx)
	}
}

/// Averages groups of `modulation_size` frames back into one real frame. When the output has
/// fewer nodes than the input, input node `i` contributes to output node `i % output_nodes`.
#[derive(Debug)]
pub struct BinaryToReal {
	modulation_size: usize,
	requested_output: Option<Shape>,
	input_shape: Option<Shape>,
	output_shape: Option<Shape>,
	last: Option<(usize, usize)>,
}

impl BinaryToReal {
	/// `output_shape` of `None` keeps the input shape.
	pub fn new(modulation_size: usize, output_shape: Option<Shape>) -> Self {
		Self {
			modulation_size,
			requested_output: output_shape,
			input_shape: None,
			output_shape: None,
			last: None,
		}
	}

	pub fn modulation_size(&self) -> usize {
		self.modulation_size
	}

	pub fn set_modulation_size(&mut self, modulation_size: usize) {
		self.modulation_size = modulation_size;
	}

	fn fold(&self) -> Result<usize, Error> {
		let input = self.input_shape()?.node_count();
		let output = self.output_shape()?.node_count();
		Ok(input / output.max(1))
	}
}

impl Layer for BinaryToReal {
	fn class_name(&self) -> String {
		"BinaryToReal".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.input_shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.output_shape)
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		let output = self.requested_output.clone().unwrap_or_else(|| shape.clone());
		ensure!(
			output.node_count() > 0 && shape.node_count() % output.node_count() == 0,
			Error::InvalidConfig {
				class: self.class_name(),
				reason: format!("{shape} input nodes do not fold onto {output}"),
			}
		);
		self.input_shape = Some(shape.clone());
		self.output_shape = Some(output.clone());
		self.last = None;
		Ok(output)
	}

	#[instrument(
		skip_all,
		level = "trace",
		fields(frames = x.frames(), modulation_size = self.modulation_size)
	)]
	fn forward(
		&mut self,
		_ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		check_input(&self.class_name(), &self.input_shape, &x)?;
		let modulation_size = self.modulation_size;
		let Some(frames) = checked_int_div(x.frames(), modulation_size) else {
			bail!(Error::FrameCountMismatch {
				class: self.class_name(),
				expected: x.frames().next_multiple_of(modulation_size.max(1)),
				actual: x.frames(),
			});
		};
		let x = if x.dtype() == DataType::Fp32 {
			x
		} else {
			x.convert(DataType::Fp32)?
		};
		let output_shape = self.output_shape()?;
		let output_nodes = output_shape.node_count();
		let fold = self.fold()?;
		let norm = 1.0 / (modulation_size * fold) as f32;

		let xv = x.lock::<f32>()?;
		let mut y = FrameBuffer::new(DataType::Fp32, frames, output_shape);
		y.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.for_each(|(node, out)| {
				for (frame, out) in out.iter_mut().enumerate() {
					let mut sum = 0.0f32;
					for group in 0..fold {
						let row = xv.node(node + group * output_nodes);
						sum += row[frame * modulation_size..(frame + 1) * modulation_size]
							.iter()
							.sum::<f32>();
					}
					*out = sum * norm;
				}
			});
		self.last = train.then_some((x.frames(), modulation_size));
		Ok(y)
	}

	fn backward(&mut self, _ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		let (in_frames, modulation_size) = self
			.last
			.take()
			.ok_or_else(|| backward_without_forward(&self.class_name()))?;
		let output_nodes = self.output_shape()?.node_count();
		check_nodes(&self.class_name(), output_nodes, &dy)?;
		ensure!(
			dy.frames() * modulation_size == in_frames,
			Error::FrameCountMismatch {
				class: self.class_name(),
				expected: in_frames / modulation_size,
				actual: dy.frames(),
			}
		);
		let norm = 1.0 / (modulation_size * self.fold()?) as f32;
		let dyv = dy.lock::<f32>()?;
		let mut dx = FrameBuffer::new(DataType::Fp32, in_frames, self.input_shape()?);
		dx.lock_mut::<f32>()?
			.par_nodes_mut()
			.enumerate()
			.for_each(|(node, out)| {
				let grads = dyv.node(node % output_nodes);
				for (in_frame, out) in out.iter_mut().enumerate() {
					*out = grads[in_frame / modulation_size] * norm;
				}
			});
		Ok(dx)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_even_thresholds_encode_the_level() {
		let ctx = ExecContext::host();
		let mut real2bin =
			RealToBinary::new(ModulationConfig::default().with_modulation_size(4), DataType::Fp32)
				.unwrap();
		real2bin.set_input_shape(&Shape::from([1])).unwrap();
		let x = FrameBuffer::from_frames(&[0.6f32], 1, [1]).unwrap();
		let y = real2bin.forward(&ctx, x, false).unwrap();
		assert_eq!(y.frames(), 4);
		// Thresholds are 0.125, 0.375, 0.625 and 0.875.
		assert_eq!(y.to_frames::<f32>().unwrap(), vec![1.0, 1.0, 0.0, 0.0]);
	}

	#[test]
	fn test_bit_output_matches_real_output() {
		let ctx = ExecContext::host();
		let config = || {
			ModulationConfig::default()
				.with_modulation_size(3)
				.with_value_generator(UniformValueGenerator::new(4))
				.with_framewise(false)
		};
		let x = FrameBuffer::from_frames(&[0.1f32, 0.5, 0.9, 0.3, 0.7, 0.2], 2, [3]).unwrap();
		let mut real = RealToBinary::new(config(), DataType::Fp32).unwrap();
		let mut bits = RealToBinary::new(config(), DataType::Bit).unwrap();
		real.set_input_shape(&Shape::from([3])).unwrap();
		bits.set_input_shape(&Shape::from([3])).unwrap();
		let y_real = real.forward(&ctx, x.clone(), false).unwrap();
		let y_bits = bits.forward(&ctx, x, false).unwrap();
		assert_eq!(y_bits.dtype(), DataType::Bit);
		assert_eq!(
			y_real.to_frames::<f32>().unwrap(),
			y_bits.convert(DataType::Fp32).unwrap().to_frames::<f32>().unwrap()
		);
	}

	#[test]
	fn test_input_range_is_mapped() {
		let ctx = ExecContext::host();
		let config = ModulationConfig::default()
			.with_modulation_size(2)
			.with_input_range(-1.0, 1.0);
		let mut real2bin = RealToBinary::new(config, DataType::Fp32).unwrap();
		real2bin.set_input_shape(&Shape::from([1])).unwrap();
		let x = FrameBuffer::from_frames(&[0.0f32], 1, [1]).unwrap();
		let y = real2bin.forward(&ctx, x, true).unwrap();
		assert_eq!(y.to_frames::<f32>().unwrap(), vec![1.0, 0.0]);
		let dx = real2bin
			.backward(&ctx, FrameBuffer::from_frames(&[1.0f32, 1.0], 2, [1]).unwrap())
			.unwrap();
		assert_eq!(dx.to_frames::<f32>().unwrap(), vec![1.0]);
	}

	#[test]
	fn test_binary_to_real_folds_nodes_and_frames() {
		let ctx = ExecContext::host();
		let mut bin2real = BinaryToReal::new(2, Some(Shape::from([2])));
		assert_eq!(bin2real.set_input_shape(&Shape::from([4])).unwrap(), Shape::from([2]));
		let x = FrameBuffer::from_frames(
			&[1.0f32, 0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0],
			2,
			[4],
		)
		.unwrap();
		let y = bin2real.forward(&ctx, x, true).unwrap();
		assert_eq!(y.frames(), 1);
		assert_eq!(y.to_frames::<f32>().unwrap(), vec![0.75, 0.25]);

		let dx = bin2real
			.backward(&ctx, FrameBuffer::from_frames(&[1.0f32, 2.0], 1, [2]).unwrap())
			.unwrap();
		assert_eq!(dx.frames(), 2);
		assert_eq!(
			dx.to_frames::<f32>().unwrap(),
			vec![0.25, 0.5, 0.25, 0.5, 0.25, 0.5, 0.25, 0.5]
		);
	}

	#[test]
	fn test_backward_rejects_misshaped_gradient() {
		let ctx = ExecContext::host();
		let mut bin2real = BinaryToReal::new(1, Some(Shape::from([2])));
		bin2real.set_input_shape(&Shape::from([4])).unwrap();
		let x = FrameBuffer::from_frames(&[1.0f32, 0.0, 1.0, 1.0], 1, [4]).unwrap();
		bin2real.forward(&ctx, x, true).unwrap();
		assert_matches!(
			bin2real.backward(&ctx, FrameBuffer::from_frames(&[1.0f32], 1, [1]).unwrap()),
			Err(Error::NodeCountMismatch {
				expected: 2,
				actual: 1,
				..
			})
		);

		let mut real2bin =
			RealToBinary::new(ModulationConfig::default().with_modulation_size(2), DataType::Fp32)
				.unwrap();
		real2bin.set_input_shape(&Shape::from([2])).unwrap();
		let x = FrameBuffer::from_frames(&[0.3f32, 0.7], 1, [2]).unwrap();
		real2bin.forward(&ctx, x, true).unwrap();
		assert_matches!(
			real2bin.backward(&ctx, FrameBuffer::from_frames(&[1.0f32; 6], 2, [3]).unwrap()),
			Err(Error::NodeCountMismatch {
				expected: 2,
				actual: 3,
				..
			})
		);
	}

	#[test]
	fn test_invalid_configurations() {
		assert_matches!(
			RealToBinary::new(ModulationConfig::default().with_modulation_size(0), DataType::Fp32),
			Err(Error::InvalidConfig { .. })
		);
		assert_matches!(
			RealToBinary::new(
				ModulationConfig::default().with_input_range(1.0, 1.0),
				DataType::Bit
			),
			Err(Error::InvalidConfig { .. })
		);
		let mut bin2real = BinaryToReal::new(1, Some(Shape::from([3])));
		assert_matches!(
			bin2real.set_input_shape(&Shape::from([4])),
			Err(Error::InvalidConfig { .. })
		);

		let mut bin2real = BinaryToReal::new(2, None);
		bin2real.set_input_shape(&Shape::from([1])).unwrap();
		let x = FrameBuffer::from_frames(&[1.0f32, 0.0, 1.0], 3, [1]).unwrap();
		assert_matches!(
			bin2real.forward(&ExecContext::host(), x, false),
			Err(Error::FrameCountMismatch { expected: 4, .. })
		);
	}
}
