// Copyright 2025 Irreducible Inc.

use lutnet_utils::ensure;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::Error;

/// Deals distinct values from a shuffled pool of `0..size`, reshuffling once the pool runs dry.
///
/// Consecutive draws walk through the whole population before any value repeats, which spreads
/// fan-out evenly over the inputs.
#[derive(Debug, Clone)]
pub struct ShuffleSet {
	pool: Vec<usize>,
	cursor: usize,
	rng: StdRng,
}

impl ShuffleSet {
	pub fn new(size: usize, seed: u64) -> Self {
		let mut rng = StdRng::seed_from_u64(seed);
		let mut pool: Vec<usize> = (0..size).collect();
		pool.shuffle(&mut rng);
		Self {
			pool,
			cursor: 0,
			rng,
		}
	}

	pub fn len(&self) -> usize {
		self.pool.len()
	}

	pub fn is_empty(&self) -> bool {
		self.pool.is_empty()
	}

	/// Draws `n` mutually distinct values.
	pub fn random_set(&mut self, n: usize) -> Result<Vec<usize>, Error> {
		ensure!(
			n <= self.pool.len(),
			Error::FanInTooLarge {
				fan_in: n,
				available: self.pool.len(),
			}
		);
		let mut set = Vec::with_capacity(n);
		while set.len() < n {
			if self.cursor == self.pool.len() {
				self.pool.shuffle(&mut self.rng);
				self.cursor = 0;
			}
			let value = self.pool[self.cursor];
			self.cursor += 1;
			if !set.contains(&value) {
				set.push(value);
			}
		}
		Ok(set)
	}
}
