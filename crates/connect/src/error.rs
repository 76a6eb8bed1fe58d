// Copyright 2025 Irreducible Inc.

use lutnet_compute::Shape;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("unknown connection rule {0:?}")]
	UnknownRule(String),
	#[error("{rule} connection cannot map {input} to {output}: {reason}")]
	IncompatibleShapes {
		rule: &'static str,
		input: Shape,
		output: Shape,
		reason: &'static str,
	},
	#[error("fan-in {fan_in} needs at least as many distinct inputs, only {available} available")]
	FanInTooLarge { fan_in: usize, available: usize },
	#[error("fan-in must be at least 1")]
	ZeroFanIn,
	#[error(
		"gauss sampling gave up on output node {node} after {attempts} attempts without a new input"
	)]
	GaussSamplingExhausted { node: usize, attempts: usize },
	#[error("input node {input} is out of range for {input_node_count} inputs")]
	InputOutOfRange { input: usize, input_node_count: usize },
	#[error("output node {node} is out of range for {output_node_count} outputs")]
	NodeOutOfRange { node: usize, output_node_count: usize },
	#[error("slot {slot} is out of range for fan-in {fan_in}")]
	SlotOutOfRange { slot: usize, fan_in: usize },
	#[error("output node {node} lists input {input} more than once")]
	DuplicateInput { node: usize, input: usize },
	#[error("output node {node} has {actual} inputs, fan-in is {fan_in}")]
	RowLength {
		node: usize,
		fan_in: usize,
		actual: usize,
	},
	#[error("compute error: {0}")]
	Compute(#[from] lutnet_compute::Error),
}
