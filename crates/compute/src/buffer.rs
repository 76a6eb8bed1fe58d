// Copyright 2025 Irreducible Inc.

use std::{
	marker::PhantomData,
	sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytemuck::zeroed_vec;
use lutnet_utils::{checked_arithmetics::align_up, ensure, rayon::min_nodes_per_task};
use rayon::prelude::*;
use tracing::trace;

use crate::{device::same_device, ComputeDevice, DataType, DeviceMemory, Element, Error, Shape};

/// Node rows are padded to this many bytes so vectorised kernels never straddle two nodes.
pub const ROW_ALIGN_BYTES: usize = 32;

const ROW_ALIGN_WORDS: usize = ROW_ALIGN_BYTES / 8;

fn row_words(dtype: DataType, frames: usize) -> usize {
	let words = (frames * dtype.bit_width()).div_ceil(64).max(1);
	align_up(words, ROW_ALIGN_WORDS)
}

/// Where the authoritative copy of a buffer currently lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
	Host,
	Device,
	Synced,
}

#[derive(Debug)]
struct DeviceCopy {
	device: Arc<dyn ComputeDevice>,
	memory: Box<dyn DeviceMemory>,
}

/// A missing host vector stands for all-zero contents.
#[derive(Debug)]
struct Storage {
	words: usize,
	host: Option<Vec<u64>>,
	device: Option<DeviceCopy>,
	residency: Residency,
}

impl Storage {
	fn new(words: usize) -> Self {
		Self {
			words,
			host: None,
			device: None,
			residency: Residency::Host,
		}
	}

	fn sync_host(&mut self) -> Result<&mut Vec<u64>, Error> {
		let words = self.words;
		let host = self.host.get_or_insert_with(|| zeroed_vec(words));
		if self.residency == Residency::Device {
			if let Some(copy) = &self.device {
				copy.device.copy_d2h(&*copy.memory, host)?;
				trace!(device = copy.device.name(), words, "synced frame buffer to host");
			}
			self.residency = Residency::Synced;
		}
		Ok(host)
	}

	fn sync_device(&mut self, device: &Arc<dyn ComputeDevice>) -> Result<(), Error> {
		let on_device = matches!(&self.device, Some(copy) if same_device(&copy.device, device));
		if !on_device {
			if self.residency == Residency::Device {
				// Newest data lives on some other device.
				self.sync_host()?;
			}
			let mut memory = device.alloc(self.words)?;
			if let Some(host) = &self.host {
				device.copy_h2d(host, &mut *memory)?;
			}
			trace!(device = device.name(), words = self.words, "moved frame buffer to device");
			self.device = Some(DeviceCopy {
				device: device.clone(),
				memory,
			});
			self.residency = Residency::Synced;
		} else if self.residency == Residency::Host {
			if let (Some(host), Some(copy)) = (&self.host, &mut self.device) {
				copy.device.copy_h2d(host, &mut *copy.memory)?;
			}
			self.residency = Residency::Synced;
		}
		Ok(())
	}

	fn snapshot(&mut self) -> Result<Self, Error> {
		let words = self.words;
		let host = self.sync_host()?.clone();
		Ok(Self {
			words,
			host: Some(host),
			device: None,
			residency: Residency::Host,
		})
	}
}

fn lock_storage(storage: &Mutex<Storage>) -> MutexGuard<'_, Storage> {
	storage.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Batch of frames flowing between layers.
///
/// Data is stored node-major: each node owns one row holding its value for every frame, padded
/// to [`ROW_ALIGN_BYTES`]. Cloning is cheap and shares the storage; the first write through a
/// shared clone copies it, so a layer that keeps a clone for its backward pass never sees the
/// next layer's writes.
#[derive(Clone, Debug)]
pub struct FrameBuffer {
	dtype: DataType,
	frames: usize,
	shape: Shape,
	row_words: usize,
	storage: Arc<Mutex<Storage>>,
}

impl FrameBuffer {
	/// Allocates a zeroed buffer. Host and device memory are only materialised on first access.
	pub fn new(dtype: DataType, frames: usize, shape: impl Into<Shape>) -> Self {
		let shape = shape.into();
		let row_words = row_words(dtype, frames);
		let storage = Storage::new(row_words * shape.node_count());
		Self {
			dtype,
			frames,
			shape,
			row_words,
			storage: Arc::new(Mutex::new(storage)),
		}
	}

	/// Builds a buffer from frame-major data (`data[frame * node_count + node]`).
	pub fn from_frames<T: Element>(
		data: &[T],
		frames: usize,
		shape: impl Into<Shape>,
	) -> Result<Self, Error> {
		let mut buffer = Self::new(T::DATA_TYPE, frames, shape);
		let node_count = buffer.node_count();
		ensure!(
			data.len() == frames * node_count,
			Error::LengthMismatch {
				expected: frames * node_count,
				actual: data.len(),
			}
		);
		{
			let mut view = buffer.lock_mut::<T>()?;
			for (frame, values) in data.chunks_exact(node_count.max(1)).enumerate() {
				for (node, &value) in values.iter().enumerate() {
					view.set(frame, node, value);
				}
			}
		}
		Ok(buffer)
	}

	/// Copies the contents out in frame-major order.
	pub fn to_frames<T: Element>(&self) -> Result<Vec<T>, Error> {
		let view = self.lock::<T>()?;
		let node_count = self.node_count();
		let mut data = vec![T::from_f64(0.0); self.frames * node_count];
		for node in 0..node_count {
			for (frame, &value) in view.node(node).iter().enumerate() {
				data[frame * node_count + node] = value;
			}
		}
		Ok(data)
	}

	pub fn dtype(&self) -> DataType {
		self.dtype
	}

	pub fn frames(&self) -> usize {
		self.frames
	}

	pub fn shape(&self) -> &Shape {
		&self.shape
	}

	pub fn node_count(&self) -> usize {
		self.shape.node_count()
	}

	/// Bytes between the starts of two consecutive node rows.
	pub fn frame_stride(&self) -> usize {
		self.row_words * 8
	}

	pub fn row_words(&self) -> usize {
		self.row_words
	}

	pub fn residency(&self) -> Residency {
		lock_storage(&self.storage).residency
	}

	pub fn shares_storage(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.storage, &other.storage)
	}

	/// Gives this handle its own copy of the storage if any other handle shares it.
	pub fn make_unique(&mut self) -> Result<(), Error> {
		self.unique_storage().map(|_| ())
	}

	/// Same data under a different shape with an equal node count.
	pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self, Error> {
		let shape = shape.into();
		ensure!(
			shape.node_count() == self.node_count(),
			Error::NodeCountMismatch {
				from: self.shape.clone(),
				to: shape,
			}
		);
		Ok(Self {
			shape,
			..self.clone()
		})
	}

	/// Converts element types. Reals become bits by thresholding at 0.5; bits become 0.0/1.0.
	pub fn convert(&self, dtype: DataType) -> Result<Self, Error> {
		if dtype == self.dtype {
			return Ok(self.clone());
		}
		let values = self.node_major_f64()?;
		let mut out = Self::new(dtype, self.frames, self.shape.clone());
		let frames = self.frames;
		match dtype {
			DataType::Fp32 => write_node_major::<f32>(&mut out, &values)?,
			DataType::Fp64 => write_node_major::<f64>(&mut out, &values)?,
			DataType::Bit => {
				let mut bits = out.lock_bits_mut()?;
				for (index, &value) in values.iter().enumerate() {
					bits.set(index % frames.max(1), index / frames.max(1), value > 0.5);
				}
			}
		}
		Ok(out)
	}

	fn node_major_f64(&self) -> Result<Vec<f64>, Error> {
		let mut values = Vec::with_capacity(self.frames * self.node_count());
		match self.dtype {
			DataType::Fp32 => {
				let view = self.lock::<f32>()?;
				for node in 0..self.node_count() {
					values.extend(view.node(node).iter().map(|&x| x as f64));
				}
			}
			DataType::Fp64 => {
				let view = self.lock::<f64>()?;
				for node in 0..self.node_count() {
					values.extend_from_slice(view.node(node));
				}
			}
			DataType::Bit => {
				let view = self.lock_bits()?;
				for node in 0..self.node_count() {
					values.extend((0..self.frames).map(|frame| view.get(frame, node) as u8 as f64));
				}
			}
		}
		Ok(values)
	}

	fn check_dtype(&self, expected: DataType) -> Result<(), Error> {
		ensure!(
			self.dtype == expected,
			Error::DataTypeMismatch {
				expected,
				actual: self.dtype,
			}
		);
		Ok(())
	}

	fn unique_storage(&mut self) -> Result<&mut Storage, Error> {
		if Arc::strong_count(&self.storage) > 1 {
			let snapshot = lock_storage(&self.storage).snapshot()?;
			self.storage = Arc::new(Mutex::new(snapshot));
			trace!("copied shared frame buffer storage before write");
		}
		let storage = Arc::get_mut(&mut self.storage).ok_or(Error::SharedStorage)?;
		Ok(storage.get_mut().unwrap_or_else(PoisonError::into_inner))
	}

	/// Read access on the host, copying back from the device if it holds newer data.
	pub fn lock<T: Element>(&self) -> Result<HostView<'_, T>, Error> {
		self.check_dtype(T::DATA_TYPE)?;
		let mut guard = lock_storage(&self.storage);
		guard.sync_host()?;
		Ok(HostView {
			guard,
			frames: self.frames,
			row_words: self.row_words,
			_marker: PhantomData,
		})
	}

	/// Write access on the host; any device copy becomes stale.
	pub fn lock_mut<T: Element>(&mut self) -> Result<HostViewMut<'_, T>, Error> {
		self.check_dtype(T::DATA_TYPE)?;
		let (frames, row_words) = (self.frames, self.row_words);
		let storage = self.unique_storage()?;
		storage.sync_host()?;
		storage.residency = Residency::Host;
		Ok(HostViewMut {
			words: storage.host.as_deref_mut().unwrap_or_default(),
			frames,
			row_words,
			_marker: PhantomData,
		})
	}

	pub fn lock_bits(&self) -> Result<BitView<'_>, Error> {
		self.check_dtype(DataType::Bit)?;
		let mut guard = lock_storage(&self.storage);
		guard.sync_host()?;
		Ok(BitView {
			guard,
			row_words: self.row_words,
		})
	}

	pub fn lock_bits_mut(&mut self) -> Result<BitViewMut<'_>, Error> {
		self.check_dtype(DataType::Bit)?;
		let row_words = self.row_words;
		let storage = self.unique_storage()?;
		storage.sync_host()?;
		storage.residency = Residency::Host;
		Ok(BitViewMut {
			words: storage.host.as_deref_mut().unwrap_or_default(),
			row_words,
		})
	}

	/// Read access on `device`, uploading host data first when it is newer.
	pub fn lock_device(&self, device: &Arc<dyn ComputeDevice>) -> Result<DeviceView<'_>, Error> {
		let mut guard = lock_storage(&self.storage);
		guard.sync_device(device)?;
		Ok(DeviceView { guard })
	}

	/// Write access on `device`. With `overwrite` the current contents are not uploaded.
	pub fn lock_device_mut(
		&mut self,
		device: &Arc<dyn ComputeDevice>,
		overwrite: bool,
	) -> Result<DeviceViewMut<'_>, Error> {
		let storage = self.unique_storage()?;
		let on_device =
			matches!(&storage.device, Some(copy) if same_device(&copy.device, device));
		if overwrite && !on_device {
			storage.device = Some(DeviceCopy {
				device: device.clone(),
				memory: device.alloc(storage.words)?,
			});
		} else {
			storage.sync_device(device)?;
		}
		storage.residency = Residency::Device;
		Ok(DeviceViewMut { storage })
	}
}

fn write_node_major<T: Element>(out: &mut FrameBuffer, values: &[f64]) -> Result<(), Error> {
	let frames = out.frames();
	let mut view = out.lock_mut::<T>()?;
	for (row, chunk) in view.nodes_mut().zip(values.chunks(frames.max(1))) {
		for (dst, &src) in row.iter_mut().zip(chunk) {
			*dst = T::from_f64(src);
		}
	}
	Ok(())
}

fn node_row<T: Element>(words: &[u64], row_words: usize, frames: usize, node: usize) -> &[T] {
	let row: &[T] = bytemuck::cast_slice(&words[node * row_words..(node + 1) * row_words]);
	&row[..frames]
}

fn node_row_mut<T: Element>(
	words: &mut [u64],
	row_words: usize,
	frames: usize,
	node: usize,
) -> &mut [T] {
	let row: &mut [T] =
		bytemuck::cast_slice_mut(&mut words[node * row_words..(node + 1) * row_words]);
	&mut row[..frames]
}

/// Shared host view; holds the buffer lock until dropped.
#[derive(Debug)]
pub struct HostView<'a, T> {
	guard: MutexGuard<'a, Storage>,
	frames: usize,
	row_words: usize,
	_marker: PhantomData<T>,
}

impl<T: Element> HostView<'_, T> {
	fn words(&self) -> &[u64] {
		self.guard.host.as_deref().unwrap_or_default()
	}

	pub fn frames(&self) -> usize {
		self.frames
	}

	/// Values of `node` for every frame.
	pub fn node(&self, node: usize) -> &[T] {
		node_row(self.words(), self.row_words, self.frames, node)
	}

	pub fn get(&self, frame: usize, node: usize) -> T {
		self.node(node)[frame]
	}
}

pub struct HostViewMut<'a, T> {
	words: &'a mut [u64],
	frames: usize,
	row_words: usize,
	_marker: PhantomData<T>,
}

impl<T: Element> HostViewMut<'_, T> {
	pub fn frames(&self) -> usize {
		self.frames
	}

	pub fn node(&self, node: usize) -> &[T] {
		node_row(self.words, self.row_words, self.frames, node)
	}

	pub fn node_mut(&mut self, node: usize) -> &mut [T] {
		node_row_mut(self.words, self.row_words, self.frames, node)
	}

	pub fn get(&self, frame: usize, node: usize) -> T {
		self.node(node)[frame]
	}

	pub fn set(&mut self, frame: usize, node: usize, value: T) {
		self.node_mut(node)[frame] = value;
	}

	pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut [T]> + '_ {
		let frames = self.frames;
		self.words.chunks_exact_mut(self.row_words).map(move |row| {
			let row: &mut [T] = bytemuck::cast_slice_mut(row);
			&mut row[..frames]
		})
	}

	pub fn par_nodes_mut(&mut self) -> impl IndexedParallelIterator<Item = &mut [T]> + '_ {
		let frames = self.frames;
		let min_len = min_nodes_per_task(self.words.len() / self.row_words);
		self.words
			.par_chunks_exact_mut(self.row_words)
			.map(move |row| {
				let row: &mut [T] = bytemuck::cast_slice_mut(row);
				&mut row[..frames]
			})
			.with_min_len(min_len)
	}
}

#[derive(Debug)]
pub struct BitView<'a> {
	guard: MutexGuard<'a, Storage>,
	row_words: usize,
}

impl BitView<'_> {
	pub fn get(&self, frame: usize, node: usize) -> bool {
		let words = self.guard.host.as_deref().unwrap_or_default();
		(words[node * self.row_words + frame / 64] >> (frame % 64)) & 1 == 1
	}
}

pub struct BitViewMut<'a> {
	words: &'a mut [u64],
	row_words: usize,
}

impl BitViewMut<'_> {
	pub fn get(&self, frame: usize, node: usize) -> bool {
		(self.words[node * self.row_words + frame / 64] >> (frame % 64)) & 1 == 1
	}

	pub fn set(&mut self, frame: usize, node: usize, value: bool) {
		let word = &mut self.words[node * self.row_words + frame / 64];
		let mask = 1u64 << (frame % 64);
		if value {
			*word |= mask;
		} else {
			*word &= !mask;
		}
	}
}

pub struct DeviceView<'a> {
	guard: MutexGuard<'a, Storage>,
}

impl DeviceView<'_> {
	pub fn memory(&self) -> Result<&(dyn DeviceMemory + 'static), Error> {
		self.guard
			.device
			.as_ref()
			.map(|copy| &*copy.memory)
			.ok_or(Error::NotResident)
	}
}

pub struct DeviceViewMut<'a> {
	storage: &'a mut Storage,
}

impl DeviceViewMut<'_> {
	pub fn memory_mut(&mut self) -> Result<&mut (dyn DeviceMemory + 'static), Error> {
		self.storage
			.device
			.as_mut()
			.map(|copy| &mut *copy.memory)
			.ok_or(Error::NotResident)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;
	use crate::cpu::CpuDevice;

	fn cpu() -> Arc<dyn ComputeDevice> {
		Arc::new(CpuDevice)
	}

	#[test]
	fn test_rows_are_padded() {
		let buffer = FrameBuffer::new(DataType::Fp32, 3, [2, 2]);
		assert_eq!(buffer.frame_stride(), ROW_ALIGN_BYTES);
		let buffer = FrameBuffer::new(DataType::Fp32, 9, [5]);
		assert_eq!(buffer.frame_stride(), 2 * ROW_ALIGN_BYTES);
		let buffer = FrameBuffer::new(DataType::Bit, 300, [5]);
		assert_eq!(buffer.frame_stride(), 64);
	}

	#[test]
	fn test_frame_major_round_trip() {
		let data: Vec<f32> = (0..12).map(|i| i as f32).collect();
		let buffer = FrameBuffer::from_frames(&data, 3, [4]).unwrap();
		assert_eq!(buffer.lock::<f32>().unwrap().get(1, 2), 6.0);
		assert_eq!(buffer.lock::<f32>().unwrap().node(0), &[0.0, 4.0, 8.0]);
		assert_eq!(buffer.to_frames::<f32>().unwrap(), data);
	}

	#[test]
	fn test_dtype_checked_on_lock() {
		let buffer = FrameBuffer::new(DataType::Fp32, 1, [1]);
		assert_matches!(
			buffer.lock::<f64>(),
			Err(Error::DataTypeMismatch {
				expected: DataType::Fp64,
				actual: DataType::Fp32
			})
		);
		assert_matches!(buffer.lock_bits(), Err(Error::DataTypeMismatch { .. }));
	}

	#[test]
	fn test_copy_on_write() {
		let mut a = FrameBuffer::from_frames(&[1.0f32, 2.0], 1, [2]).unwrap();
		let b = a.clone();
		assert!(a.shares_storage(&b));

		a.lock_mut::<f32>().unwrap().set(0, 0, 10.0);
		assert!(!a.shares_storage(&b));
		assert_eq!(a.to_frames::<f32>().unwrap(), vec![10.0, 2.0]);
		assert_eq!(b.to_frames::<f32>().unwrap(), vec![1.0, 2.0]);
	}

	#[test]
	fn test_residency_follows_last_writer() {
		let device = cpu();
		let mut buffer = FrameBuffer::from_frames(&[1.0f32, 2.0, 3.0], 3, [1]).unwrap();
		assert_eq!(buffer.residency(), Residency::Host);

		drop(buffer.lock_device(&device).unwrap());
		assert_eq!(buffer.residency(), Residency::Synced);

		{
			let mut view = buffer.lock_device_mut(&device, false).unwrap();
			let memory = view
				.memory_mut()
				.unwrap()
				.as_any_mut()
				.downcast_mut::<crate::cpu::CpuMemory>()
				.unwrap();
			assert_eq!(memory.words().len(), buffer_words(3));
		}
		assert_eq!(buffer.residency(), Residency::Device);

		assert_eq!(buffer.to_frames::<f32>().unwrap(), vec![1.0, 2.0, 3.0]);
		assert_eq!(buffer.residency(), Residency::Synced);

		buffer.lock_mut::<f32>().unwrap().set(0, 0, 7.0);
		assert_eq!(buffer.residency(), Residency::Host);
	}

	fn buffer_words(frames: usize) -> usize {
		row_words(DataType::Fp32, frames)
	}

	#[test]
	fn test_bits_and_conversion() {
		let real = FrameBuffer::from_frames(&[0.9f32, 0.1, 0.2, 0.7], 2, [2]).unwrap();
		let bits = real.convert(DataType::Bit).unwrap();
		{
			let view = bits.lock_bits().unwrap();
			assert!(view.get(0, 0));
			assert!(!view.get(0, 1));
			assert!(!view.get(1, 0));
			assert!(view.get(1, 1));
		}
		let back = bits.convert(DataType::Fp64).unwrap();
		assert_eq!(back.to_frames::<f64>().unwrap(), vec![1.0, 0.0, 0.0, 1.0]);
	}

	#[test]
	fn test_reshape_requires_equal_node_count() {
		let buffer = FrameBuffer::new(DataType::Fp32, 2, [2, 3]);
		assert_eq!(buffer.reshape([6]).unwrap().shape(), &Shape::from([6]));
		assert_matches!(buffer.reshape([5]), Err(Error::NodeCountMismatch { .. }));
	}
}
