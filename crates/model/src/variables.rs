// Copyright 2025 Irreducible Inc.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lutnet_compute::{Shape, Tensor};

/// Shared handle to a parameter or gradient tensor.
///
/// The owning layer and an external optimizer hold clones of the same handle.
#[derive(Clone, Debug, Default)]
pub struct Variable(Arc<RwLock<Tensor>>);

impl Variable {
	pub fn new(tensor: Tensor) -> Self {
		Self(Arc::new(RwLock::new(tensor)))
	}

	pub fn zeros(shape: impl Into<Shape>) -> Self {
		Self::new(Tensor::zeros(shape))
	}

	pub fn read(&self) -> RwLockReadGuard<'_, Tensor> {
		self.0.read().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn write(&self) -> RwLockWriteGuard<'_, Tensor> {
		self.0.write().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn len(&self) -> usize {
		self.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Whether both handles refer to the same tensor.
	pub fn ptr_eq(&self, other: &Self) -> bool {
		Arc::ptr_eq(&self.0, &other.0)
	}
}

/// Ordered list of variables collected depth-first from a layer tree.
///
/// Parameters and gradients of a tree come out in the same order, so they can be zipped
/// positionally.
#[derive(Clone, Debug, Default)]
pub struct Variables(Vec<Variable>);

impl Variables {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn push(&mut self, variable: Variable) {
		self.0.push(variable);
	}

	pub fn extend(&mut self, other: Variables) {
		self.0.extend(other.0);
	}

	pub fn len(&self) -> usize {
		self.0.len()
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn get(&self, index: usize) -> Option<&Variable> {
		self.0.get(index)
	}

	pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
		self.0.iter()
	}

	/// Total number of scalars over all variables.
	pub fn total_len(&self) -> usize {
		self.0.iter().map(Variable::len).sum()
	}

	pub fn fill(&self, value: f32) {
		for variable in &self.0 {
			variable.write().fill(value);
		}
	}
}

impl FromIterator<Variable> for Variables {
	fn from_iter<I: IntoIterator<Item = Variable>>(iter: I) -> Self {
		Self(iter.into_iter().collect())
	}
}

impl<'a> IntoIterator for &'a Variables {
	type Item = &'a Variable;
	type IntoIter = std::slice::Iter<'a, Variable>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.iter()
	}
}

impl IntoIterator for Variables {
	type Item = Variable;
	type IntoIter = std::vec::IntoIter<Variable>;

	fn into_iter(self) -> Self::IntoIter {
		self.0.into_iter()
	}
}
