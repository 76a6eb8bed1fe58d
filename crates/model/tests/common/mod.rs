// Copyright 2025 Irreducible Inc.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_model::{Error, Layer};
use lutnet_utils::{rayon::adjust_thread_pool, tracing::init_tracing};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Installs the log subscriber and honours `RAYON_NUM_THREADS=1`.
pub fn setup() {
	init_tracing();
	let _ = adjust_thread_pool();
}

/// Frame-major values in `[0, 1)`.
pub fn random_frames(frames: usize, shape: impl Into<Shape>, seed: u64) -> FrameBuffer {
	setup();
	let shape = shape.into();
	let mut rng = StdRng::seed_from_u64(seed);
	let data: Vec<f32> = (0..frames * shape.node_count()).map(|_| rng.gen()).collect();
	FrameBuffer::from_frames(&data, frames, shape).unwrap()
}

pub fn assert_close(a: &[f32], b: &[f32], tolerance: f32) {
	assert_eq!(a.len(), b.len());
	for (i, (&a, &b)) in a.iter().zip(b).enumerate() {
		assert!((a - b).abs() <= tolerance, "index {i}: {a} vs {b}");
	}
}

/// Identity layer that records the frame count of every forward.
pub struct FrameProbe {
	shape: Option<Shape>,
	seen: Arc<Mutex<Vec<usize>>>,
}

impl FrameProbe {
	pub fn new() -> (Self, Arc<Mutex<Vec<usize>>>) {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let probe = Self {
			shape: None,
			seen: seen.clone(),
		};
		(probe, seen)
	}
}

impl Layer for FrameProbe {
	fn class_name(&self) -> String {
		"FrameProbe".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		self.shape.clone().ok_or(Error::ShapeNotSet {
			class: self.class_name(),
		})
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		self.input_shape()
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		self.shape = Some(shape.clone());
		Ok(shape.clone())
	}

	fn forward(
		&mut self,
		_ctx: &ExecContext,
		x: FrameBuffer,
		_train: bool,
	) -> Result<FrameBuffer, Error> {
		self.seen.lock().unwrap().push(x.frames());
		Ok(x)
	}

	fn backward(&mut self, _ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		Ok(dy)
	}
}
