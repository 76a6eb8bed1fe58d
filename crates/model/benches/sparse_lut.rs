// Copyright 2025 Irreducible Inc.

use criterion::{
	criterion_group, criterion_main, measurement::WallTime, BenchmarkGroup, Criterion, Throughput,
};
use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_connect::{generate, ConnectionRule};
use lutnet_model::{Layer, SparseLutConfig, SparseLutN};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn random_frames(frames: usize, nodes: usize) -> FrameBuffer {
	let mut rng = StdRng::seed_from_u64(0);
	let data: Vec<f32> = (0..frames * nodes).map(|_| rng.gen()).collect();
	FrameBuffer::from_frames(&data, frames, [nodes]).expect("frame data matches the shape")
}

fn bench_connection_rules(c: &mut Criterion) {
	let mut group = c.benchmark_group("connect");
	let input = Shape::from([32, 32, 16]);
	let output = Shape::from([32, 32, 32]);
	group.throughput(Throughput::Elements(output.node_count() as u64));
	for rule in [
		ConnectionRule::Random,
		ConnectionRule::Serial,
		ConnectionRule::Pointwise,
		ConnectionRule::Depthwise,
		ConnectionRule::Gauss,
	] {
		let output = match rule {
			ConnectionRule::Depthwise => Shape::from([32, 32, 16]),
			_ => output.clone(),
		};
		group.bench_function(rule.name(), |bench| {
			bench.iter(|| generate(rule, &input, &output, 6, 1));
		});
	}
}

fn bench_sparse_lut<const N: usize>(
	group: &mut BenchmarkGroup<WallTime>,
	frames: usize,
	memory_saving: bool,
) {
	let ctx = ExecContext::host();
	let config = SparseLutConfig::new([1024]).with_memory_saving(memory_saving);
	let mut layer = SparseLutN::<N>::new(config).expect("valid configuration");
	layer
		.set_input_shape(&Shape::from([4096]))
		.expect("fan-in fits the input");
	let x = random_frames(frames, 4096);
	let dy = random_frames(frames, 1024);

	group.throughput(Throughput::Elements((frames * 1024) as u64));
	group.bench_function(format!("forward/N={N}/frames={frames}"), |bench| {
		bench.iter(|| layer.forward(&ctx, x.clone(), false));
	});
	group.bench_function(
		format!("train/N={N}/frames={frames}/memory_saving={memory_saving}"),
		|bench| {
			bench.iter(|| {
				layer.forward(&ctx, x.clone(), true)?;
				layer.backward(&ctx, dy.clone())
			});
		},
	);
}

fn sparse_lut(c: &mut Criterion) {
	let mut group = c.benchmark_group("sparse_lut");
	bench_sparse_lut::<6>(&mut group, 256, true);
	bench_sparse_lut::<6>(&mut group, 256, false);
	bench_sparse_lut::<4>(&mut group, 256, true);
}

criterion_group!(benches, bench_connection_rules, sparse_lut);
criterion_main!(benches);
