// Copyright 2025 Irreducible Inc.

use std::fmt;

use bytes::{Buf, BufMut};
use lutnet_utils::{
	ensure, serialization::Error as SerializationError, DeserializeBytes, SerializeBytes,
};

use crate::Error;

/// Node layout of one frame.
///
/// The first axis varies fastest: a 3-D `[w, h, c]` shape flattens `(x, y, c)` to
/// `x + w * (y + h * c)`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Shape(Vec<usize>);

impl Shape {
	pub fn new(extents: impl Into<Vec<usize>>) -> Self {
		Self(extents.into())
	}

	pub fn as_slice(&self) -> &[usize] {
		&self.0
	}

	pub fn rank(&self) -> usize {
		self.0.len()
	}

	/// Number of nodes in one frame.
	pub fn node_count(&self) -> usize {
		self.0.iter().product()
	}

	pub fn extent(&self, axis: usize) -> Option<usize> {
		self.0.get(axis).copied()
	}

	/// Flattens a multi-dimensional index.
	pub fn index_of(&self, indices: &[usize]) -> Result<usize, Error> {
		ensure!(
			indices.len() == self.rank() && indices.iter().zip(&self.0).all(|(&i, &e)| i < e),
			Error::IndexOutOfRange {
				index: indices.to_vec(),
				shape: self.clone(),
			}
		);
		Ok(indices
			.iter()
			.zip(&self.0)
			.rev()
			.fold(0, |acc, (&index, &extent)| acc * extent + index))
	}

	/// Inverse of [`Self::index_of`].
	pub fn indices_of(&self, mut node: usize) -> Result<Vec<usize>, Error> {
		ensure!(
			node < self.node_count(),
			Error::IndexOutOfRange {
				index: vec![node],
				shape: self.clone(),
			}
		);
		Ok(self
			.0
			.iter()
			.map(|&extent| {
				let index = node % extent;
				node /= extent;
				index
			})
			.collect())
	}

	/// Advances `indices` like an odometer, first axis fastest. Returns `false` once it wraps
	/// around past the last index.
	pub fn next_indices(&self, indices: &mut [usize]) -> bool {
		for (index, &extent) in indices.iter_mut().zip(&self.0) {
			*index += 1;
			if *index < extent {
				return true;
			}
			*index = 0;
		}
		false
	}

	/// Snaps a real-valued position on `axis` to the nearest valid index.
	pub fn regularize(&self, axis: usize, position: f64) -> usize {
		let extent = self.0.get(axis).copied().unwrap_or(1).max(1);
		let rounded = position.round();
		if rounded <= 0.0 {
			0
		} else {
			(rounded as usize).min(extent - 1)
		}
	}
}

impl From<Vec<usize>> for Shape {
	fn from(extents: Vec<usize>) -> Self {
		Self(extents)
	}
}

impl<const R: usize> From<[usize; R]> for Shape {
	fn from(extents: [usize; R]) -> Self {
		Self(extents.to_vec())
	}
}

impl fmt::Display for Shape {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{:?}", self.0)
	}
}

impl SerializeBytes for Shape {
	fn serialize(&self, write_buf: impl BufMut) -> Result<(), SerializationError> {
		self.0.serialize(write_buf)
	}
}

impl DeserializeBytes for Shape {
	fn deserialize(read_buf: impl Buf) -> Result<Self, SerializationError> {
		Vec::<usize>::deserialize(read_buf).map(Self)
	}
}
