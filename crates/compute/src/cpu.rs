// Copyright 2025 Irreducible Inc.

//! Reference [`ComputeDevice`] backed by a separate allocation in host RAM.

use std::any::Any;

use bytemuck::zeroed_vec;
use lutnet_utils::ensure;

use crate::{
	kernels::{Kernel, MAX_KERNEL_INPUTS},
	ComputeDevice, DeviceMemory, Error, KernelLayout,
};

#[derive(Debug, Clone)]
pub struct CpuMemory {
	words: Vec<u64>,
}

impl CpuMemory {
	pub fn words(&self) -> &[u64] {
		&self.words
	}
}

impl DeviceMemory for CpuMemory {
	fn len_words(&self) -> usize {
		self.words.len()
	}

	fn as_any(&self) -> &dyn Any {
		self
	}

	fn as_any_mut(&mut self) -> &mut dyn Any {
		self
	}
}

/// Executes kernels sequentially on memory it owns, so host/device coherence bugs surface
/// in tests without an accelerator.
#[derive(Debug, Default)]
pub struct CpuDevice;

fn downcast(memory: &dyn DeviceMemory) -> Result<&CpuMemory, Error> {
	memory
		.as_any()
		.downcast_ref::<CpuMemory>()
		.ok_or(Error::ForeignMemory)
}

fn downcast_mut(memory: &mut dyn DeviceMemory) -> Result<&mut CpuMemory, Error> {
	memory
		.as_any_mut()
		.downcast_mut::<CpuMemory>()
		.ok_or(Error::ForeignMemory)
}

fn check_len(expected: usize, actual: usize) -> Result<(), Error> {
	ensure!(expected == actual, Error::LengthMismatch { expected, actual });
	Ok(())
}

impl ComputeDevice for CpuDevice {
	fn name(&self) -> &str {
		"cpu"
	}

	fn alloc(&self, words: usize) -> Result<Box<dyn DeviceMemory>, Error> {
		Ok(Box::new(CpuMemory {
			words: zeroed_vec(words),
		}))
	}

	fn copy_h2d(&self, src: &[u64], dst: &mut dyn DeviceMemory) -> Result<(), Error> {
		let dst = downcast_mut(dst)?;
		check_len(dst.words.len(), src.len())?;
		dst.words.copy_from_slice(src);
		Ok(())
	}

	fn copy_d2h(&self, src: &dyn DeviceMemory, dst: &mut [u64]) -> Result<(), Error> {
		let src = downcast(src)?;
		check_len(dst.len(), src.words.len())?;
		dst.copy_from_slice(&src.words);
		Ok(())
	}

	fn copy_d2d(&self, src: &dyn DeviceMemory, dst: &mut dyn DeviceMemory) -> Result<(), Error> {
		let src = downcast(src)?;
		let dst = downcast_mut(dst)?;
		check_len(dst.words.len(), src.words.len())?;
		dst.words.copy_from_slice(&src.words);
		Ok(())
	}

	fn launch(
		&self,
		kernel: Kernel,
		layout: KernelLayout,
		inputs: &[&dyn DeviceMemory],
		output: &mut dyn DeviceMemory,
	) -> Result<(), Error> {
		ensure!(
			inputs.len() == kernel.arity(),
			Error::KernelArity {
				kernel,
				expected: kernel.arity(),
				actual: inputs.len(),
			}
		);
		let total_words = layout.node_count * layout.row_words;
		let inputs = inputs
			.iter()
			.map(|&memory| {
				let memory = downcast(memory)?;
				check_len(total_words, memory.words.len())?;
				Ok(memory.words.as_slice())
			})
			.collect::<Result<Vec<_>, Error>>()?;
		let output = downcast_mut(output)?;
		check_len(total_words, output.words.len())?;

		for node in 0..layout.node_count {
			let range = node * layout.row_words..(node + 1) * layout.row_words;
			let mut rows: [&[f32]; MAX_KERNEL_INPUTS] = [&[]; MAX_KERNEL_INPUTS];
			for (row, words) in rows.iter_mut().zip(&inputs) {
				*row = &bytemuck::cast_slice::<u64, f32>(&words[range.clone()])[..layout.frames];
			}
			let out = bytemuck::cast_slice_mut::<u64, f32>(&mut output.words[range]);
			kernel.apply_row(&rows[..inputs.len()], &mut out[..layout.frames]);
		}
		Ok(())
	}
}
