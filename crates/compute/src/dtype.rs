// Copyright 2025 Irreducible Inc.

use std::fmt::Debug;

use bytemuck::Pod;
use serde::{Deserialize, Serialize};

/// Element type tag of a [`crate::FrameBuffer`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
	#[default]
	Fp32,
	Fp64,
	/// One bit per element, 64 frames packed into each word.
	Bit,
}

impl DataType {
	pub const fn bit_width(self) -> usize {
		match self {
			Self::Fp32 => 32,
			Self::Fp64 => 64,
			Self::Bit => 1,
		}
	}
}

/// Scalar element types that can be viewed directly inside a frame buffer row.
pub trait Element: Pod + Debug + Send + Sync + 'static {
	const DATA_TYPE: DataType;

	fn from_f64(value: f64) -> Self;

	fn to_f64(self) -> f64;
}

impl Element for f32 {
	const DATA_TYPE: DataType = DataType::Fp32;

	fn from_f64(value: f64) -> Self {
		value as f32
	}

	fn to_f64(self) -> f64 {
		self as f64
	}
}

impl Element for f64 {
	const DATA_TYPE: DataType = DataType::Fp64;

	fn from_f64(value: f64) -> Self {
		value
	}

	fn to_f64(self) -> f64 {
		self
	}
}
