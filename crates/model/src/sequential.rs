// Copyright 2025 Irreducible Inc.

use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use tracing::instrument;

use crate::{layer::shape_or_unset, Error, Layer};

/// Layers applied one after another.
#[derive(Default)]
pub struct Sequential {
	layers: Vec<Box<dyn Layer>>,
	input_shape: Option<Shape>,
	output_shape: Option<Shape>,
}

impl Sequential {
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a layer; shapes must be set again afterwards.
	pub fn push(&mut self, layer: Box<dyn Layer>) {
		self.layers.push(layer);
		self.input_shape = None;
		self.output_shape = None;
	}

	pub fn with(mut self, layer: impl Layer + 'static) -> Self {
		self.push(Box::new(layer));
		self
	}

	pub fn len(&self) -> usize {
		self.layers.len()
	}

	pub fn is_empty(&self) -> bool {
		self.layers.is_empty()
	}

	pub fn get(&self, index: usize) -> Option<&dyn Layer> {
		self.layers.get(index).map(|layer| layer.as_ref())
	}

	pub fn get_mut(&mut self, index: usize) -> Option<&mut (dyn Layer + 'static)> {
		self.layers.get_mut(index).map(|layer| layer.as_mut())
	}
}

impl Layer for Sequential {
	fn class_name(&self) -> String {
		"Sequential".into()
	}

	fn input_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.input_shape)
	}

	fn output_shape(&self) -> Result<Shape, Error> {
		shape_or_unset(&self.class_name(), &self.output_shape)
	}

	fn set_input_shape(&mut self, shape: &Shape) -> Result<Shape, Error> {
		let mut current = shape.clone();
		for layer in &mut self.layers {
			current = layer.set_input_shape(&current)?;
		}
		self.input_shape = Some(shape.clone());
		self.output_shape = Some(current.clone());
		Ok(current)
	}

	#[instrument(skip_all, fields(layers = self.layers.len(), frames = x.frames(), train))]
	fn forward(
		&mut self,
		ctx: &ExecContext,
		x: FrameBuffer,
		train: bool,
	) -> Result<FrameBuffer, Error> {
		self.input_shape()?;
		self.layers
			.iter_mut()
			.try_fold(x, |x, layer| layer.forward(ctx, x, train))
	}

	#[instrument(skip_all, fields(layers = self.layers.len(), frames = dy.frames()))]
	fn backward(&mut self, ctx: &ExecContext, dy: FrameBuffer) -> Result<FrameBuffer, Error> {
		self.layers
			.iter_mut()
			.rev()
			.try_fold(dy, |dy, layer| layer.backward(ctx, dy))
	}

	fn children(&self) -> Vec<&dyn Layer> {
		self.layers.iter().map(|layer| layer.as_ref()).collect()
	}

	fn children_mut(&mut self) -> Vec<&mut dyn Layer> {
		let mut children: Vec<&mut dyn Layer> = Vec::with_capacity(self.layers.len());
		for layer in &mut self.layers {
			children.push(layer.as_mut());
		}
		children
	}
}
