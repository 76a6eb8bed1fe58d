// Copyright 2025 Irreducible Inc.

use std::{any::Any, fmt::Debug, sync::Arc};

use crate::{Error, Kernel};

/// Opaque allocation owned by a [`ComputeDevice`].
///
/// Sizes are counted in 64-bit words, the unit frame buffer rows are padded to.
pub trait DeviceMemory: Any + Debug + Send + Sync {
	fn len_words(&self) -> usize;

	fn as_any(&self) -> &dyn Any;

	fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Row layout shared by every operand of a kernel launch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
	pub node_count: usize,
	pub frames: usize,
	/// Words between the starts of consecutive node rows.
	pub row_words: usize,
}

/// An accelerator the elementwise kernels can be launched on.
///
/// Every operation is synchronous: it returns once the device has finished.
pub trait ComputeDevice: Debug + Send + Sync {
	fn name(&self) -> &str;

	/// Allocates `words` zeroed words of device memory.
	fn alloc(&self, words: usize) -> Result<Box<dyn DeviceMemory>, Error>;

	/// Copy data from the host to the device.
	///
	/// ## Preconditions
	///
	/// * `src` and `dst` must have the same length.
	fn copy_h2d(&self, src: &[u64], dst: &mut dyn DeviceMemory) -> Result<(), Error>;

	/// Copy data from the device to the host.
	///
	/// ## Preconditions
	///
	/// * `src` and `dst` must have the same length.
	fn copy_d2h(&self, src: &dyn DeviceMemory, dst: &mut [u64]) -> Result<(), Error>;

	/// Copy data between disjoint device buffers.
	fn copy_d2d(&self, src: &dyn DeviceMemory, dst: &mut dyn DeviceMemory) -> Result<(), Error>;

	/// Runs `kernel` over every node row of `inputs`, writing `output`.
	fn launch(
		&self,
		kernel: Kernel,
		layout: KernelLayout,
		inputs: &[&dyn DeviceMemory],
		output: &mut dyn DeviceMemory,
	) -> Result<(), Error>;
}

pub(crate) fn same_device(a: &Arc<dyn ComputeDevice>, b: &Arc<dyn ComputeDevice>) -> bool {
	std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
