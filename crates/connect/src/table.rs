// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};
use itertools::Itertools;
use lutnet_utils::{
	bail, ensure, serialization::Error as SerializationError, DeserializeBytes, SerializeBytes,
};

use crate::Error;

/// Inputs of every output node of a sparse layer.
///
/// Row `node` lists the `fan_in` input nodes feeding output `node`. Entries are always below
/// `input_node_count` and never repeat within a row.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(into = "TableRepr", try_from = "TableRepr")]
pub struct ConnectionTable {
	input_node_count: usize,
	fan_in: usize,
	entries: Vec<usize>,
}

impl ConnectionTable {
	pub fn from_rows(
		input_node_count: usize,
		fan_in: usize,
		rows: impl IntoIterator<Item = Vec<usize>>,
	) -> Result<Self, Error> {
		ensure!(fan_in > 0, Error::ZeroFanIn);
		let mut entries = Vec::new();
		for (node, row) in rows.into_iter().enumerate() {
			ensure!(
				row.len() == fan_in,
				Error::RowLength {
					node,
					fan_in,
					actual: row.len(),
				}
			);
			entries.extend(row);
		}
		let table = Self {
			input_node_count,
			fan_in,
			entries,
		};
		table.validate()?;
		Ok(table)
	}

	pub fn input_node_count(&self) -> usize {
		self.input_node_count
	}

	pub fn output_node_count(&self) -> usize {
		self.entries.len() / self.fan_in
	}

	pub fn fan_in(&self) -> usize {
		self.fan_in
	}

	pub fn row(&self, node: usize) -> &[usize] {
		&self.entries[node * self.fan_in..(node + 1) * self.fan_in]
	}

	pub fn rows(&self) -> impl Iterator<Item = &[usize]> + '_ {
		self.entries.chunks_exact(self.fan_in)
	}

	pub fn get(&self, node: usize, slot: usize) -> Result<usize, Error> {
		self.check_position(node, slot)?;
		Ok(self.entries[node * self.fan_in + slot])
	}

	/// Rewires one slot. The new input must not already feed `node` through another slot.
	pub fn set(&mut self, node: usize, slot: usize, input: usize) -> Result<(), Error> {
		self.check_position(node, slot)?;
		ensure!(
			input < self.input_node_count,
			Error::InputOutOfRange {
				input,
				input_node_count: self.input_node_count,
			}
		);
		let clash = self
			.row(node)
			.iter()
			.enumerate()
			.any(|(other, &existing)| other != slot && existing == input);
		ensure!(!clash, Error::DuplicateInput { node, input });
		self.entries[node * self.fan_in + slot] = input;
		Ok(())
	}

	/// Replaces the inputs of one node.
	pub fn set_row(&mut self, node: usize, inputs: &[usize]) -> Result<(), Error> {
		self.check_position(node, 0)?;
		ensure!(
			inputs.len() == self.fan_in,
			Error::RowLength {
				node,
				fan_in: self.fan_in,
				actual: inputs.len(),
			}
		);
		check_row(node, inputs, self.input_node_count)?;
		self.entries[node * self.fan_in..(node + 1) * self.fan_in].copy_from_slice(inputs);
		Ok(())
	}

	/// Checks the range and distinctness invariants of every row.
	pub fn validate(&self) -> Result<(), Error> {
		ensure!(self.fan_in > 0, Error::ZeroFanIn);
		ensure!(
			self.entries.len() % self.fan_in == 0,
			Error::RowLength {
				node: self.output_node_count(),
				fan_in: self.fan_in,
				actual: self.entries.len() % self.fan_in,
			}
		);
		for (node, row) in self.rows().enumerate() {
			check_row(node, row, self.input_node_count)?;
		}
		Ok(())
	}

	fn check_position(&self, node: usize, slot: usize) -> Result<(), Error> {
		ensure!(
			node < self.output_node_count(),
			Error::NodeOutOfRange {
				node,
				output_node_count: self.output_node_count(),
			}
		);
		ensure!(
			slot < self.fan_in,
			Error::SlotOutOfRange {
				slot,
				fan_in: self.fan_in,
			}
		);
		Ok(())
	}
}

fn check_row(node: usize, row: &[usize], input_node_count: usize) -> Result<(), Error> {
	for &input in row {
		ensure!(
			input < input_node_count,
			Error::InputOutOfRange {
				input,
				input_node_count,
			}
		);
	}
	if let Some(&input) = row.iter().duplicates().next() {
		bail!(Error::DuplicateInput { node, input });
	}
	Ok(())
}

#[derive(serde::Serialize, serde::Deserialize)]
struct TableRepr {
	input_node_count: usize,
	fan_in: usize,
	rows: Vec<Vec<usize>>,
}

impl From<ConnectionTable> for TableRepr {
	fn from(table: ConnectionTable) -> Self {
		Self {
			input_node_count: table.input_node_count,
			fan_in: table.fan_in,
			rows: table.rows().map(<[usize]>::to_vec).collect(),
		}
	}
}

impl TryFrom<TableRepr> for ConnectionTable {
	type Error = Error;

	fn try_from(repr: TableRepr) -> Result<Self, Error> {
		Self::from_rows(repr.input_node_count, repr.fan_in, repr.rows)
	}
}

impl SerializeBytes for ConnectionTable {
	fn serialize(&self, mut write_buf: impl BufMut) -> Result<(), SerializationError> {
		self.input_node_count.serialize(&mut write_buf)?;
		self.fan_in.serialize(&mut write_buf)?;
		self.entries.serialize(write_buf)
	}
}

impl DeserializeBytes for ConnectionTable {
	fn deserialize(mut read_buf: impl Buf) -> Result<Self, SerializationError> {
		let input_node_count = usize::deserialize(&mut read_buf)?;
		let fan_in = usize::deserialize(&mut read_buf)?;
		let entries = Vec::<usize>::deserialize(read_buf)?;
		let table = Self {
			input_node_count,
			fan_in,
			entries,
		};
		table
			.validate()
			.map_err(|err| SerializationError::InvalidData(err.to_string()))?;
		Ok(table)
	}
}
