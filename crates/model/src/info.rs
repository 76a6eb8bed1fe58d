// Copyright 2025 Irreducible Inc.

use lutnet_compute::Shape;

use crate::{Error, Layer};

/// Default width of the separator lines in [`info`].
pub const INFO_COLUMNS: usize = 70;

/// Text report of a layer tree: class name, shapes and parameter count per node.
///
/// `depth` counts levels with `layer` itself as the first; a depth of 0 lists the whole tree.
pub fn info(layer: &dyn Layer, depth: usize, columns: usize) -> String {
	let mut lines = Vec::new();
	write_node(layer, depth, columns, 0, &mut lines);
	lines.push("-".repeat(columns));
	lines.join("\n") + "\n"
}

fn write_node(
	layer: &dyn Layer,
	depth: usize,
	columns: usize,
	nest: usize,
	lines: &mut Vec<String>,
) {
	let indent = "  ".repeat(nest);
	let describe = |shape: Result<Shape, Error>| match shape {
		Ok(shape) => shape.to_string(),
		Err(_) => "(unset)".to_string(),
	};
	lines.push(format!("{indent}{}", "-".repeat(columns.saturating_sub(indent.len()))));
	lines.push(format!("{indent} {}", layer.class_name()));
	lines.push(format!("{indent}  input  shape : {}", describe(layer.input_shape())));
	lines.push(format!("{indent}  output shape : {}", describe(layer.output_shape())));
	lines.push(format!("{indent}  parameters   : {}", layer.parameters().total_len()));
	if depth == 0 || nest + 1 < depth {
		for child in layer.children() {
			write_node(child, depth, columns, nest + 1, lines);
		}
	}
}
