// Copyright 2025 Irreducible Inc.

use std::{fmt, str::FromStr};

use lutnet_compute::Shape;
use lutnet_utils::ensure;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use tracing::{debug, instrument};

use crate::{ConnectionTable, Error, ShuffleSet};

/// Consecutive duplicate draws the gauss rule tolerates before giving up on a slot.
pub const GAUSS_MAX_ATTEMPTS_PER_SLOT: usize = 10_000;

/// Duplicate draws after which the gauss spread doubles, capped at the input extent.
pub const GAUSS_WIDEN_INTERVAL: usize = 32;

/// Strategy used to wire the inputs of a sparse layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionRule {
	/// Distinct inputs dealt from one reshuffled pool.
	#[default]
	Random,
	/// Inputs assigned cyclically in row-major order.
	Serial,
	/// Same `(x, y)` column, random channels. Shapes are `[w, h, c]`.
	Pointwise,
	/// Same channel, random spatial positions of the input plane.
	Depthwise,
	/// Normally distributed around the output's position scaled into input coordinates.
	Gauss,
}

impl ConnectionRule {
	pub const fn name(self) -> &'static str {
		match self {
			Self::Random => "random",
			Self::Serial => "serial",
			Self::Pointwise => "pointwise",
			Self::Depthwise => "depthwise",
			Self::Gauss => "gauss",
		}
	}
}

impl fmt::Display for ConnectionRule {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.name())
	}
}

impl FromStr for ConnectionRule {
	type Err = Error;

	/// Only the first whitespace-separated word names the rule; an empty string means random.
	fn from_str(s: &str) -> Result<Self, Error> {
		match s.split_whitespace().next() {
			None | Some("random") => Ok(Self::Random),
			Some("serial") => Ok(Self::Serial),
			Some("pointwise") => Ok(Self::Pointwise),
			Some("depthwise") => Ok(Self::Depthwise),
			Some("gauss") => Ok(Self::Gauss),
			Some(other) => Err(Error::UnknownRule(other.to_string())),
		}
	}
}

/// Builds the connection table of a layer mapping `input_shape` to `output_shape`.
///
/// The result depends only on the arguments; equal seeds give equal tables.
#[instrument(skip_all, fields(rule = %rule, input = %input_shape, output = %output_shape, fan_in))]
pub fn generate(
	rule: ConnectionRule,
	input_shape: &Shape,
	output_shape: &Shape,
	fan_in: usize,
	seed: u64,
) -> Result<ConnectionTable, Error> {
	ensure!(fan_in > 0, Error::ZeroFanIn);
	let input_node_count = input_shape.node_count();
	ensure!(
		fan_in <= input_node_count,
		Error::FanInTooLarge {
			fan_in,
			available: input_node_count,
		}
	);

	let rows = match rule {
		ConnectionRule::Random => random_rows(input_node_count, output_shape, fan_in, seed)?,
		ConnectionRule::Serial => serial_rows(input_node_count, output_shape, fan_in),
		ConnectionRule::Pointwise => pointwise_rows(input_shape, output_shape, fan_in, seed)?,
		ConnectionRule::Depthwise => depthwise_rows(input_shape, output_shape, fan_in, seed)?,
		ConnectionRule::Gauss => gauss_rows(input_shape, output_shape, fan_in, seed)?,
	};
	let table = ConnectionTable::from_rows(input_node_count, fan_in, rows)?;
	debug!(output_nodes = table.output_node_count(), "generated connection table");
	Ok(table)
}

fn random_rows(
	input_node_count: usize,
	output_shape: &Shape,
	fan_in: usize,
	seed: u64,
) -> Result<Vec<Vec<usize>>, Error> {
	let mut inputs = ShuffleSet::new(input_node_count, seed);
	(0..output_shape.node_count())
		.map(|_| inputs.random_set(fan_in))
		.collect()
}

fn serial_rows(input_node_count: usize, output_shape: &Shape, fan_in: usize) -> Vec<Vec<usize>> {
	(0..output_shape.node_count())
		.map(|node| {
			(0..fan_in)
				.map(|slot| (node * fan_in + slot) % input_node_count)
				.collect()
		})
		.collect()
}

fn incompatible(
	rule: ConnectionRule,
	input: &Shape,
	output: &Shape,
	reason: &'static str,
) -> Error {
	Error::IncompatibleShapes {
		rule: rule.name(),
		input: input.clone(),
		output: output.clone(),
		reason,
	}
}

/// Extents `[w, h, c]` of both shapes, which must be 3-D.
fn planar_extents(
	rule: ConnectionRule,
	input: &Shape,
	output: &Shape,
) -> Result<([usize; 3], [usize; 3]), Error> {
	match (input.as_slice(), output.as_slice()) {
		(&[iw, ih, ic], &[ow, oh, oc]) => Ok(([iw, ih, ic], [ow, oh, oc])),
		_ => Err(incompatible(rule, input, output, "both shapes must be 3-D (x, y, channel)")),
	}
}

fn pointwise_rows(
	input: &Shape,
	output: &Shape,
	fan_in: usize,
	seed: u64,
) -> Result<Vec<Vec<usize>>, Error> {
	let rule = ConnectionRule::Pointwise;
	let ([width, height, in_channels], [out_width, out_height, out_channels]) =
		planar_extents(rule, input, output)?;
	ensure!(
		width == out_width && height == out_height,
		incompatible(rule, input, output, "x/y extents differ")
	);
	ensure!(
		fan_in <= in_channels,
		Error::FanInTooLarge {
			fan_in,
			available: in_channels,
		}
	);

	let mut rng = StdRng::seed_from_u64(seed);
	let mut rows = vec![Vec::new(); output.node_count()];
	for y in 0..height {
		for x in 0..width {
			let mut channels = ShuffleSet::new(in_channels, rng.gen());
			for c in 0..out_channels {
				rows[output.index_of(&[x, y, c])?] = channels
					.random_set(fan_in)?
					.into_iter()
					.map(|ic| input.index_of(&[x, y, ic]))
					.collect::<Result<_, _>>()?;
			}
		}
	}
	Ok(rows)
}

fn depthwise_rows(
	input: &Shape,
	output: &Shape,
	fan_in: usize,
	seed: u64,
) -> Result<Vec<Vec<usize>>, Error> {
	let rule = ConnectionRule::Depthwise;
	let ([in_width, in_height, channels], [out_width, out_height, out_channels]) =
		planar_extents(rule, input, output)?;
	ensure!(channels == out_channels, incompatible(rule, input, output, "channel counts differ"));
	let plane = in_width * in_height;
	ensure!(
		fan_in <= plane,
		Error::FanInTooLarge {
			fan_in,
			available: plane,
		}
	);

	let mut rng = StdRng::seed_from_u64(seed);
	let mut rows = vec![Vec::new(); output.node_count()];
	for c in 0..channels {
		let mut positions = ShuffleSet::new(plane, rng.gen());
		for y in 0..out_height {
			for x in 0..out_width {
				rows[output.index_of(&[x, y, c])?] = positions
					.random_set(fan_in)?
					.into_iter()
					.map(|position| input.index_of(&[position % in_width, position / in_width, c]))
					.collect::<Result<_, _>>()?;
			}
		}
	}
	Ok(rows)
}

struct GaussAxis {
	center: f64,
	sigma: f64,
	max_sigma: f64,
}

fn gauss_rows(
	input: &Shape,
	output: &Shape,
	fan_in: usize,
	seed: u64,
) -> Result<Vec<Vec<usize>>, Error> {
	let rule = ConnectionRule::Gauss;
	ensure!(input.rank() == output.rank(), incompatible(rule, input, output, "ranks differ"));

	let mut rng = StdRng::seed_from_u64(seed);
	let mut rows = Vec::with_capacity(output.node_count());
	for node in 0..output.node_count() {
		let axes = output
			.indices_of(node)?
			.into_iter()
			.zip(input.as_slice().iter().zip(output.as_slice()))
			.map(|(index, (&in_extent, &out_extent))| {
				let (in_extent, out_extent) = (in_extent as f64, out_extent as f64);
				let center = if out_extent > 1.0 {
					index as f64 * (in_extent - 1.0) / (out_extent - 1.0)
				} else {
					(in_extent - 1.0) / 2.0
				};
				let sigma = in_extent / out_extent;
				GaussAxis {
					center,
					sigma,
					max_sigma: in_extent.max(sigma),
				}
			})
			.collect::<Vec<_>>();

		let mut row = Vec::with_capacity(fan_in);
		let mut misses = 0;
		let mut spread = 1.0;
		while row.len() < fan_in {
			let sample = axes
				.iter()
				.enumerate()
				.map(|(axis, gauss)| {
					let z: f64 = rng.sample(StandardNormal);
					let sigma = (gauss.sigma * spread).min(gauss.max_sigma);
					input.regularize(axis, gauss.center + z * sigma)
				})
				.collect::<Vec<_>>();
			let candidate = input.index_of(&sample)?;
			if row.contains(&candidate) {
				misses += 1;
				ensure!(
					misses < GAUSS_MAX_ATTEMPTS_PER_SLOT,
					Error::GaussSamplingExhausted {
						node,
						attempts: misses,
					}
				);
				// Narrow spreads cannot reach the remaining inputs when fan-in nears the
				// population, so widen the search after a run of duplicates.
				if misses % GAUSS_WIDEN_INTERVAL == 0 {
					spread *= 2.0;
				}
			} else {
				row.push(candidate);
				misses = 0;
				spread = 1.0;
			}
		}
		rows.push(row);
	}
	Ok(rows)
}
