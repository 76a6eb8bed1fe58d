// Copyright 2025 Irreducible Inc.

use lutnet_utils::ensure;
use rayon::prelude::*;
use tracing::instrument;

use crate::{
	kernels::{Kernel, MAX_KERNEL_INPUTS},
	DataType, Error, ExecContext, FrameBuffer, KernelLayout,
};

/// Runs an elementwise kernel on the device chosen by `ctx`, or node-parallel on the host.
///
/// All inputs must be `Fp32` buffers with identical frame and node counts; the output takes
/// the shape of the first input.
#[instrument(skip_all, level = "trace", fields(kernel = ?kernel))]
pub fn elementwise(
	ctx: &ExecContext,
	kernel: Kernel,
	inputs: &[&FrameBuffer],
	host_only: bool,
) -> Result<FrameBuffer, Error> {
	ensure!(
		inputs.len() == kernel.arity(),
		Error::KernelArity {
			kernel,
			expected: kernel.arity(),
			actual: inputs.len(),
		}
	);
	let first = inputs[0];
	for input in inputs {
		ensure!(
			input.dtype() == DataType::Fp32,
			Error::DataTypeMismatch {
				expected: DataType::Fp32,
				actual: input.dtype(),
			}
		);
		ensure!(
			input.frames() == first.frames() && input.node_count() == first.node_count(),
			Error::LayoutMismatch(format!(
				"{} frames of {} against {} frames of {}",
				input.frames(),
				input.shape(),
				first.frames(),
				first.shape()
			))
		);
	}

	// Each operand is locked separately, so aliasing operands need their own storage.
	let mut operands: Vec<FrameBuffer> = inputs.iter().map(|&input| input.clone()).collect();
	for i in 1..operands.len() {
		if operands[..i]
			.iter()
			.any(|other| other.shares_storage(&operands[i]))
		{
			operands[i].make_unique()?;
		}
	}

	let mut output = FrameBuffer::new(DataType::Fp32, first.frames(), first.shape().clone());
	match ctx.select_device(host_only)? {
		Some(device) => {
			let views = operands
				.iter()
				.map(|operand| operand.lock_device(device))
				.collect::<Result<Vec<_>, _>>()?;
			let memories = views
				.iter()
				.map(|view| view.memory())
				.collect::<Result<Vec<_>, _>>()?;
			let layout = KernelLayout {
				node_count: output.node_count(),
				frames: output.frames(),
				row_words: output.row_words(),
			};
			let mut out = output.lock_device_mut(device, true)?;
			device.launch(kernel, layout, &memories, out.memory_mut()?)?;
		}
		None => {
			let views = operands
				.iter()
				.map(|operand| operand.lock::<f32>())
				.collect::<Result<Vec<_>, _>>()?;
			let mut out = output.lock_mut::<f32>()?;
			out.par_nodes_mut().enumerate().for_each(|(node, row)| {
				let mut rows: [&[f32]; MAX_KERNEL_INPUTS] = [&[]; MAX_KERNEL_INPUTS];
				for (slot, view) in rows.iter_mut().zip(&views) {
					*slot = view.node(node);
				}
				kernel.apply_row(&rows[..views.len()], row);
			});
		}
	}
	Ok(output)
}
