// Copyright 2025 Irreducible Inc.

use bytes::{Buf, BufMut};
use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_connect::ConnectionTable;
use lutnet_utils::{ensure, DeserializeBytes, SerializeBytes};
use serde_json::Value;

use crate::{Command, Error, Target, Variable, Variables};

/// A node of a layer tree.
///
/// Leaf layers implement the computation and their own payload hooks; composites list their
/// children and inherit the tree walks for commands, parameters and serialization.
///
/// The call sequence is `set_input_shape`, then any number of `forward` calls, each training
/// forward optionally followed by one `backward` that consumes its cache.
pub trait Layer: Send + Sync {
	/// Tag written by both serialization formats and matched by [`Target::ClassName`].
	fn class_name(&self) -> String;

	fn input_shape(&self) -> Result<Shape, Error>;

	fn output_shape(&self) -> Result<Shape, Error>;

	/// Sizes buffers and (re)initializes parameters for `shape`, returning the output shape.
	///
	/// Calling it again with the same shape gives the same output shape and a freshly
	/// initialized layer.
	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error>;

	/// Computes the output for every frame of `x`. A training forward replaces the cache
	/// consumed by [`Self::backward`].
	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error>;

	/// Gradient with respect to the input of the most recent training forward.
	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error>;

	fn parameters(&self) -> Variables {
		let mut variables = Variables::new();
		for child in self.children() {
			variables.extend(child.parameters());
		}
		variables
	}

	/// Gradients in the same order as [`Self::parameters`].
	fn gradients(&self) -> Variables {
		let mut variables = Variables::new();
		for child in self.children() {
			variables.extend(child.gradients());
		}
		variables
	}

	/// Applies a command addressed to this node. Unknown commands are ignored.
	fn handle_command(&mut self, _command: &Command) {}

	/// Broadcasts `command` through the subtree; nodes whose class name matches `target` act
	/// on it.
	fn send_command(&mut self, command: &Command, target: &Target) {
		if target.matches(&self.class_name()) {
			self.handle_command(command);
		}
		for child in self.children_mut() {
			child.send_command(command, target);
		}
	}

	/// Direct children in construction order.
	fn children(&self) -> Vec<&dyn Layer> {
		Vec::new()
	}

	fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
		Vec::new()
	}

	fn as_sparse(&self) -> Option<&dyn SparseConnectable> {
		None
	}

	fn as_sparse_mut(&mut self) -> Option<&mut dyn SparseConnectable> {
		None
	}

	/// Writes the state owned by this node, excluding children.
	fn save_payload(&self, _buf: &mut dyn BufMut) -> Result<(), Error> {
		Ok(())
	}

	/// Reads what [`Self::save_payload`] wrote. Implementations parse and validate everything
	/// before touching `self`, so a failed load leaves the node unchanged.
	fn load_payload(&mut self, _buf: &mut dyn Buf) -> Result<(), Error> {
		Ok(())
	}

	fn payload_json(&self) -> Result<Value, Error> {
		Ok(Value::Null)
	}

	fn load_payload_json(&mut self, _payload: &Value) -> Result<(), Error> {
		Ok(())
	}

	/// Raw form: class tag and payload of each node, depth first in construction order.
	fn save(&self, buf: &mut dyn BufMut) -> Result<(), Error> {
		self.class_name().serialize(&mut *buf)?;
		self.save_payload(buf)?;
		for child in self.children() {
			child.save(buf)?;
		}
		Ok(())
	}

	/// Loads the raw form. Nodes before a failing one stay loaded; later ones are untouched.
	fn load(&mut self, buf: &mut dyn Buf) -> Result<(), Error> {
		let found = String::deserialize(&mut *buf)?;
		let expected = self.class_name();
		ensure!(found == expected, Error::TagMismatch { expected, found });
		self.load_payload(buf)?;
		for child in self.children_mut() {
			child.load(buf)?;
		}
		Ok(())
	}

	fn to_json(&self) -> Result<JsonNode, Error> {
		Ok(JsonNode {
			class: self.class_name(),
			payload: self.payload_json()?,
			children: self
				.children()
				.into_iter()
				.map(|child| child.to_json())
				.collect::<Result<_, _>>()?,
		})
	}

	fn load_json(&mut self, node: &JsonNode) -> Result<(), Error> {
		let expected = self.class_name();
		ensure!(
			node.class == expected,
			Error::TagMismatch {
				expected,
				found: node.class.clone(),
			}
		);
		let child_count = self.children().len();
		ensure!(
			node.children.len() == child_count,
			Error::ChildCountMismatch {
				class: expected,
				expected: child_count,
				found: node.children.len(),
			}
		);
		self.load_payload_json(&node.payload)?;
		for (child, child_node) in self.children_mut().into_iter().zip(&node.children) {
			child.load_json(child_node)?;
		}
		Ok(())
	}
}

/// Tagged document form of a layer tree: every node carries its class name ahead of its
/// payload and its children.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct JsonNode {
	pub class: String,
	#[serde(default)]
	pub payload: Value,
	#[serde(default)]
	pub children: Vec<JsonNode>,
}

/// Serializes a whole tree to a JSON string.
pub fn save_json_string(layer: &dyn Layer) -> Result<String, Error> {
	Ok(serde_json::to_string_pretty(&layer.to_json()?)?)
}

pub fn load_json_str(layer: &mut dyn Layer, json: &str) -> Result<(), Error> {
	let node: JsonNode = serde_json::from_str(json)?;
	layer.load_json(&node)
}

/// Layers wired through a [`ConnectionTable`], reachable from composites that only know their
/// children as [`Layer`]s.
pub trait SparseConnectable: Layer {
	fn connection_table(&self) -> Result<&ConnectionTable, Error>;

	fn connection_table_mut(&mut self) -> Result<&mut ConnectionTable, Error>;

	/// Lookup table weights, `2^fan_in` consecutive entries per output node.
	fn table_weights(&self) -> &Variable;

	fn node_input_size(&self, node: usize) -> Result<usize, Error> {
		let table = self.connection_table()?;
		ensure!(
			node < table.output_node_count(),
			lutnet_connect::Error::NodeOutOfRange {
				node,
				output_node_count: table.output_node_count(),
			}
		);
		Ok(table.fan_in())
	}

	fn node_input(&self, node: usize, slot: usize) -> Result<usize, Error> {
		Ok(self.connection_table()?.get(node, slot)?)
	}

	fn set_node_input(&mut self, node: usize, slot: usize, input: usize) -> Result<(), Error> {
		Ok(self.connection_table_mut()?.set(node, slot, input)?)
	}

	/// Rewires `slot` of `node` to the input at multi-dimensional `indices`.
	fn set_node_input_indices(
		&mut self,
		node: usize,
		slot: usize,
		indices: &[usize],
	) -> Result<(), Error> {
		let input = self.input_shape()?.index_of(indices)?;
		self.set_node_input(node, slot, input)
	}

	/// One row of input indices per output node.
	fn connection_list(&self) -> Result<Vec<Vec<usize>>, Error> {
		Ok(self
			.connection_table()?
			.rows()
			.map(<[usize]>::to_vec)
			.collect())
	}

	/// Replaces the whole wiring. The rows are validated before anything changes.
	fn set_connection_list(&mut self, rows: &[Vec<usize>]) -> Result<(), Error> {
		let table = self.connection_table()?;
		ensure!(
			rows.len() == table.output_node_count(),
			Error::InvalidPayload {
				class: self.class_name(),
				what: "connection list",
			}
		);
		let replacement = ConnectionTable::from_rows(
			table.input_node_count(),
			table.fan_in(),
			rows.iter().cloned(),
		)?;
		*self.connection_table_mut()? = replacement;
		Ok(())
	}

	/// Entries in the binarized table of every node.
	fn lut_table_size(&self) -> Result<usize, Error> {
		Ok(1 << self.connection_table()?.fan_in())
	}

	/// Entry `bitpos` of the binarized table of `node`. Bit `i` of `bitpos` is the value of
	/// input slot `i`; the entry is set when its weight exceeds one half.
	fn lut_table(&self, node: usize, bitpos: usize) -> Result<bool, Error> {
		let size = self.lut_table_size()?;
		self.node_input_size(node)?;
		ensure!(
			bitpos < size,
			Error::TableEntryOutOfRange {
				class: self.class_name(),
				entry: bitpos,
				size,
			}
		);
		Ok(self.table_weights().read().as_slice()[node * size + bitpos] > 0.5)
	}

	/// Binarized tables of all nodes, for export to hardware descriptions.
	fn lut_table_list(&self) -> Result<Vec<Vec<bool>>, Error> {
		let size = self.lut_table_size()?;
		let weights = self.table_weights().read();
		Ok(weights
			.as_slice()
			.chunks_exact(size)
			.map(|table| table.iter().map(|&w| w > 0.5).collect())
			.collect())
	}
}

/// Double-precision evaluation of one output node over its own inputs.
pub trait ForwardNode {
	/// `x` holds the values the node reads, in connection-slot order for sparse layers and a
	/// single value for elementwise ones.
	fn forward_node(&self, node: usize, x: &[f64]) -> Result<Vec<f64>, Error>;
}

/// Layers whose training activations can be dropped after forward and rebuilt on demand.
pub trait Checkpoint {
	/// Drops cached activations.
	fn forget(&mut self);

	/// Whether the activations of the last training forward are still held.
	fn retains_activations(&self) -> bool;

	/// Rebuilds the activations of the last training forward from `x`.
	///
	/// Uses the statistics and parameters of that forward; running statistics and random state
	/// are left untouched, so the result equals the original output.
	fn recompute(&mut self, ctx: &ExecContext, x: FrameBuffer) -> Result<FrameBuffer, Error>;
}

/// Checks that `x` matches the node count fixed by `set_input_shape`.
pub(crate) fn check_input(
	class: &str,
	shape: &Option<Shape>,
	x: &FrameBuffer,
) -> Result<(), Error> {
	let shape = shape.as_ref().ok_or_else(|| Error::ShapeNotSet {
		class: class.to_string(),
	})?;
	check_nodes(class, shape.node_count(), x)
}

/// Fails unless every frame of `x` has `expected` nodes.
pub(crate) fn check_nodes(class: &str, expected: usize, x: &FrameBuffer) -> Result<(), Error> {
	ensure!(
		x.node_count() == expected,
		Error::NodeCountMismatch {
			class: class.to_string(),
			expected,
			actual: x.node_count(),
		}
	);
	Ok(())
}

pub(crate) fn shape_or_unset(class: &str, shape: &Option<Shape>) -> Result<Shape, Error> {
	shape.clone().ok_or_else(|| Error::ShapeNotSet {
		class: class.to_string(),
	})
}

/// Parses a JSON payload into `T`.
pub(crate) fn from_payload<T: serde::de::DeserializeOwned>(payload: &Value) -> Result<T, Error> {
	Ok(<T as serde::Deserialize>::deserialize(payload)?)
}

pub(crate) fn backward_without_forward(class: &str) -> Error {
	Error::BackwardWithoutForward {
		class: class.to_string(),
	}
}
