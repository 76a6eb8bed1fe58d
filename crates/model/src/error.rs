// Copyright 2025 Irreducible Inc.

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("{class}: input shape has not been set")]
	ShapeNotSet { class: String },
	#[error("{class}: backward called without a preceding training forward")]
	BackwardWithoutForward { class: String },
	#[error("{class}: expected {expected} nodes per frame, buffer has {actual}")]
	NodeCountMismatch {
		class: String,
		expected: usize,
		actual: usize,
	},
	#[error("{class}: expected {expected} frames, buffer has {actual}")]
	FrameCountMismatch {
		class: String,
		expected: usize,
		actual: usize,
	},
	#[error("{class}: table entry {entry} is out of range for {size} entries")]
	TableEntryOutOfRange {
		class: String,
		entry: usize,
		size: usize,
	},
	#[error("{class}: invalid configuration: {reason}")]
	InvalidConfig { class: String, reason: String },
	#[error("stream holds a {found} node where {expected} was expected")]
	TagMismatch { expected: String, found: String },
	#[error("{class}: stored {what} does not fit the layer")]
	InvalidPayload { class: String, what: &'static str },
	#[error("{class}: document has {found} children, layer has {expected}")]
	ChildCountMismatch {
		class: String,
		expected: usize,
		found: usize,
	},
	#[error("{parameters} parameters but {gradients} gradients")]
	VariablesMismatch { parameters: usize, gradients: usize },
	#[error("compute error: {0}")]
	Compute(#[from] lutnet_compute::Error),
	#[error("connection error: {0}")]
	Connect(#[from] lutnet_connect::Error),
	#[error("serialization error: {0}")]
	Serialization(#[from] lutnet_utils::serialization::Error),
	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}
