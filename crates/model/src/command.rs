// Copyright 2025 Irreducible Inc.

use lutnet_utils::env::parse_bool;

use crate::Layer;

/// Runtime reconfiguration message broadcast through a layer tree.
///
/// Receivers act on the variants they know and ignore the rest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
	/// Replace activations by their binarized approximation.
	Binary(bool),
	/// Keep the layer on the host path even when a device is available.
	HostOnly(bool),
	/// Drop intermediate activations after forward and recompute them in backward.
	MemorySaving(bool),
	/// Enable the normalization stage of stochastic LUT blocks.
	BatchNormalization(bool),
}

impl Command {
	/// Parses the `"<key> <bool>"` text form, e.g. `"binary true"`.
	pub fn parse(text: &str) -> Option<Self> {
		let mut words = text.split_whitespace();
		let key = words.next()?;
		let value = parse_bool(words.next()?)?;
		match key {
			"binary" => Some(Self::Binary(value)),
			"host_only" => Some(Self::HostOnly(value)),
			"memory_saving" => Some(Self::MemorySaving(value)),
			"batch_normalization" => Some(Self::BatchNormalization(value)),
			_ => None,
		}
	}
}

/// Which nodes of the tree act on a command. Class names must match exactly.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Target {
	#[default]
	All,
	ClassName(String),
}

impl Target {
	pub fn matches(&self, class_name: &str) -> bool {
		match self {
			Self::All => true,
			Self::ClassName(name) => name == class_name,
		}
	}
}

impl From<&str> for Target {
	fn from(target: &str) -> Self {
		match target {
			"" | "all" => Self::All,
			name => Self::ClassName(name.to_string()),
		}
	}
}

/// Sends a textual command. Returns `false`, leaving the tree untouched, when the text is not a
/// known command.
pub fn send_command_str(layer: &mut dyn Layer, command: &str, target: &str) -> bool {
	match Command::parse(command) {
		Some(command) => {
			layer.send_command(&command, &Target::from(target));
			true
		}
		None => false,
	}
}
