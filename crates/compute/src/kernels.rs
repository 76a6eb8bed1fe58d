// Copyright 2025 Irreducible Inc.

//! Scalar reference bodies of the elementwise kernels.
//!
//! The host path runs them node-parallel; devices run them as one launch. Both must produce
//! the same values as a sequential loop over [`Kernel::apply_row`].

pub const MAX_KERNEL_INPUTS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Kernel {
	/// `y = max(x, 0)`
	ReluForward,
	/// Inputs `(y, dy)`: `dx = dy` where `y > 0`.
	ReluBackward,
	/// `y = clamp(x, lo, hi)`
	HardTanhForward { lo: f32, hi: f32 },
	/// Inputs `(x, dy)`: `dx = dy` where `lo <= x <= hi`.
	HardTanhBackward { lo: f32, hi: f32 },
	/// `y = hi` where `x > threshold`, `lo` otherwise.
	BinarizeForward { threshold: f32, lo: f32, hi: f32 },
}

impl Kernel {
	pub const fn arity(&self) -> usize {
		match self {
			Self::ReluForward | Self::HardTanhForward { .. } | Self::BinarizeForward { .. } => 1,
			Self::ReluBackward | Self::HardTanhBackward { .. } => 2,
		}
	}

	/// Applies the kernel to one node row; every slice holds one value per frame.
	pub fn apply_row(&self, inputs: &[&[f32]], out: &mut [f32]) {
		match *self {
			Self::ReluForward => map_unary(inputs[0], out, |x| x.max(0.0)),
			Self::ReluBackward => {
				map_binary(inputs[0], inputs[1], out, |y, dy| if y > 0.0 { dy } else { 0.0 })
			}
			Self::HardTanhForward { lo, hi } => map_unary(inputs[0], out, |x| x.clamp(lo, hi)),
			Self::HardTanhBackward { lo, hi } => map_binary(inputs[0], inputs[1], out, |x, dy| {
				if (lo..=hi).contains(&x) {
					dy
				} else {
					0.0
				}
			}),
			Self::BinarizeForward { threshold, lo, hi } => {
				map_unary(inputs[0], out, |x| if x > threshold { hi } else { lo })
			}
		}
	}

	/// Double-precision evaluation of a forward kernel on a single value.
	pub fn apply_scalar(&self, x: f64) -> f64 {
		match *self {
			Self::ReluForward => x.max(0.0),
			Self::HardTanhForward { lo, hi } => x.clamp(lo as f64, hi as f64),
			Self::BinarizeForward { threshold, lo, hi } => {
				if x > threshold as f64 {
					hi as f64
				} else {
					lo as f64
				}
			}
			Self::ReluBackward | Self::HardTanhBackward { .. } => x,
		}
	}
}

fn map_unary(x: &[f32], out: &mut [f32], f: impl Fn(f32) -> f32) {
	for (o, &x) in out.iter_mut().zip(x) {
		*o = f(x);
	}
}

fn map_binary(a: &[f32], b: &[f32], out: &mut [f32], f: impl Fn(f32, f32) -> f32) {
	for ((o, &a), &b) in out.iter_mut().zip(a).zip(b) {
		*o = f(a, b);
	}
}
