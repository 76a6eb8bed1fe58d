// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};
use lutnet_utils::{
	ensure, serialization::Error as SerializationError, DeserializeBytes, SerializeBytes,
};

use crate::{Error, Shape};

/// Host-resident parameter or gradient array.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Tensor {
	shape: Shape,
	data: Vec<f32>,
}

impl Tensor {
	pub fn zeros(shape: impl Into<Shape>) -> Self {
		Self::filled(shape, 0.0)
	}

	pub fn filled(shape: impl Into<Shape>, value: f32) -> Self {
		let shape = shape.into();
		let data = vec![value; shape.node_count()];
		Self { shape, data }
	}

	pub fn from_vec(shape: impl Into<Shape>, data: Vec<f32>) -> Result<Self, Error> {
		let shape = shape.into();
		ensure!(
			data.len() == shape.node_count(),
			Error::LengthMismatch {
				expected: shape.node_count(),
				actual: data.len(),
			}
		);
		Ok(Self { shape, data })
	}

	pub fn shape(&self) -> &Shape {
		&self.shape
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	pub fn as_slice(&self) -> &[f32] {
		&self.data
	}

	pub fn as_mut_slice(&mut self) -> &mut [f32] {
		&mut self.data
	}

	pub fn fill(&mut self, value: f32) {
		self.data.fill(value);
	}
}

impl SerializeBytes for Tensor {
	fn serialize(&self, mut write_buf: impl BufMut) -> Result<(), SerializationError> {
		self.shape.serialize(&mut write_buf)?;
		self.data.serialize(write_buf)
	}
}

impl DeserializeBytes for Tensor {
	fn deserialize(mut read_buf: impl Buf) -> Result<Self, SerializationError> {
		let shape = Shape::deserialize(&mut read_buf)?;
		let data = Vec::<f32>::deserialize(read_buf)?;
		Self::from_vec(shape, data).map_err(|err| SerializationError::InvalidData(err.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_length_checked() {
		assert_matches!(
			Tensor::from_vec([2, 2], vec![0.0; 3]),
			Err(Error::LengthMismatch {
				expected: 4,
				actual: 3
			})
		);
	}

	#[test]
	fn test_corrupt_shape_rejected_on_load() {
		let mut buf = Vec::new();
		Shape::from([3]).serialize(&mut buf).unwrap();
		vec![1.0f32, 2.0].serialize(&mut buf).unwrap();
		assert_matches!(
			Tensor::deserialize(buf.as_slice()),
			Err(SerializationError::InvalidData(_))
		);
	}
}
