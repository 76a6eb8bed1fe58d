// Copyright 2025 Irreducible Inc.

use crate::{DataType, Kernel, Shape};

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("buffer holds {actual:?} elements, {expected:?} requested")]
	DataTypeMismatch { expected: DataType, actual: DataType },
	#[error("shape {from} cannot be viewed as {to}: node counts differ")]
	NodeCountMismatch { from: Shape, to: Shape },
	#[error("index {index:?} is out of range for shape {shape}")]
	IndexOutOfRange { index: Vec<usize>, shape: Shape },
	#[error("expected {expected} elements, got {actual}")]
	LengthMismatch { expected: usize, actual: usize },
	#[error("operands disagree on layout: {0}")]
	LayoutMismatch(String),
	#[error("kernel {kernel:?} takes {expected} inputs, got {actual}")]
	KernelArity {
		kernel: Kernel,
		expected: usize,
		actual: usize,
	},
	#[error("device execution was forced but {0}")]
	DeviceRequired(&'static str),
	#[error("buffer is not resident on the requested device")]
	NotResident,
	#[error("device memory belongs to a different device")]
	ForeignMemory,
	#[error("buffer storage is still shared after detaching")]
	SharedStorage,
	#[error("device error: {0}")]
	DeviceError(Box<dyn std::error::Error + Send + Sync + 'static>),
	#[error("serialization error: {0}")]
	Serialization(#[from] lutnet_utils::serialization::Error),
}
