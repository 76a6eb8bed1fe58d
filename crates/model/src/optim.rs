// Copyright 2025 Irreducible Inc.

use lutnet_utils::ensure;

use crate::{Error, Variables};

/// Plain gradient descent over the positional parameter/gradient lists of a layer tree.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
	pub learning_rate: f32,
}

impl Sgd {
	pub fn new(learning_rate: f32) -> Self {
		Self { learning_rate }
	}

	/// `param -= learning_rate * grad`, then clears the gradients for the next batch.
	pub fn step(&self, parameters: &Variables, gradients: &Variables) -> Result<(), Error> {
		ensure!(
			parameters.len() == gradients.len()
				&& parameters
					.iter()
					.zip(gradients)
					.all(|(param, grad)| param.len() == grad.len()),
			Error::VariablesMismatch {
				parameters: parameters.len(),
				gradients: gradients.len(),
			}
		);
		for (param, grad) in parameters.iter().zip(gradients) {
			let mut grad = grad.write();
			for (p, g) in param.write().as_mut_slice().iter_mut().zip(grad.as_slice()) {
				*p -= self.learning_rate * g;
			}
			grad.fill(0.0);
		}
		Ok(())
	}
}
