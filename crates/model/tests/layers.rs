// Copyright 2025 Irreducible Inc.

mod common;

use assert_matches::assert_matches;
use common::{assert_close, random_frames, FrameProbe};
use lutnet_compute::{ExecContext, FrameBuffer, Shape};
use lutnet_model::{
	BatchNormalization, BinaryModulation, BinaryModulationConfig, Binarize, Checkpoint, Error,
	ForwardNode, HardTanh, Layer, LutConfig, ModulationConfig, NormalValueGenerator, Relu,
	Sequential, Sgd, SparseConnectable, SparseLutConfig, SparseLutN, StochasticLut,
	StochasticLutConfig, StochasticLutN, UniformValueGenerator,
};

fn flat(buffer: &FrameBuffer) -> Vec<f32> {
	buffer.to_frames::<f32>().unwrap()
}

fn shape_contract(mut layer: Box<dyn Layer>, input: Shape) {
	let ctx = ExecContext::host();
	let output = layer.set_input_shape(&input).unwrap();
	assert_eq!(layer.output_shape().unwrap(), output);
	let x = random_frames(5, input.clone(), 3);
	let y = layer.forward(&ctx, x, true).unwrap();
	assert_eq!(y.shape(), &output, "{}", layer.class_name());
	assert_eq!(y.frames(), 5);
	let dy = random_frames(5, output, 4);
	let dx = layer.backward(&ctx, dy).unwrap();
	assert_eq!(dx.shape(), &input, "{}", layer.class_name());
	assert_eq!(dx.frames(), 5);
}

#[test]
fn test_forward_backward_shape_contract() {
	shape_contract(Box::new(Relu::new()), Shape::from([3, 2]));
	shape_contract(Box::new(Binarize::default()), Shape::from([4]));
	shape_contract(Box::new(HardTanh::new(0.0, 1.0)), Shape::from([4]));
	shape_contract(Box::new(BatchNormalization::default()), Shape::from([2, 2]));
	shape_contract(
		Box::new(StochasticLutN::<2>::new(LutConfig::new([3])).unwrap()),
		Shape::from([8]),
	);
	shape_contract(
		Box::new(SparseLutN::<6>::new(SparseLutConfig::new([2, 2])).unwrap()),
		Shape::from([4, 4]),
	);
	shape_contract(
		Box::new(StochasticLut::<4>::new(StochasticLutConfig::new([3])).unwrap()),
		Shape::from([6]),
	);
	let inner = Sequential::new()
		.with(SparseLutN::<4>::new(SparseLutConfig::new([12])).unwrap())
		.with(SparseLutN::<2>::new(SparseLutConfig::new([6])).unwrap());
	let config = BinaryModulationConfig {
		output_shape: Some(Shape::from([3])),
		training: ModulationConfig::default().with_modulation_size(4),
		..Default::default()
	};
	shape_contract(
		Box::new(BinaryModulation::new(Box::new(inner), config).unwrap()),
		Shape::from([10]),
	);
}

#[test]
fn test_sequential_collects_children_in_order() {
	let mut model = Sequential::new()
		.with(BatchNormalization::default())
		.with(BatchNormalization::default());
	model.set_input_shape(&Shape::from([3])).unwrap();

	let parameters = model.parameters();
	let gradients = model.gradients();
	let first = model.get(0).unwrap();
	let second = model.get(1).unwrap();
	let expected: Vec<_> = first
		.parameters()
		.into_iter()
		.chain(second.parameters())
		.collect();
	assert_eq!(parameters.len(), 4);
	for (got, want) in parameters.iter().zip(&expected) {
		assert!(got.ptr_eq(want));
	}
	let expected: Vec<_> = first
		.gradients()
		.into_iter()
		.chain(second.gradients())
		.collect();
	for (got, want) in gradients.iter().zip(&expected) {
		assert!(got.ptr_eq(want));
	}
}

#[test]
fn test_set_input_shape_resets_state() {
	let ctx = ExecContext::host();
	let mut layer = SparseLutN::<4>::new(SparseLutConfig::new([6]).with_seed(7)).unwrap();
	let shape = Shape::from([12]);
	let output = layer.set_input_shape(&shape).unwrap();
	let initial: Vec<_> = layer
		.parameters()
		.iter()
		.map(|param| param.read().clone())
		.collect();
	let wiring = layer.connection_list().unwrap();

	layer.forward(&ctx, random_frames(8, [12], 1), true).unwrap();
	layer.backward(&ctx, random_frames(8, [6], 2)).unwrap();
	Sgd::new(0.5)
		.step(&layer.parameters(), &layer.gradients())
		.unwrap();
	assert_ne!(*layer.parameters().get(0).unwrap().read(), initial[0]);

	assert_eq!(layer.set_input_shape(&shape).unwrap(), output);
	for (param, initial) in layer.parameters().iter().zip(&initial) {
		assert_eq!(&*param.read(), initial);
	}
	for grad in layer.gradients().iter() {
		assert!(grad.read().as_slice().iter().all(|&g| g == 0.0));
	}
	assert_eq!(layer.connection_list().unwrap(), wiring);
	assert!(layer.batch_norm().running_mean().as_slice().iter().all(|&m| m == 0.0));
}

fn sparse_lut(memory_saving: bool) -> SparseLutN<6> {
	let config = SparseLutConfig::new([16])
		.with_connection("random")
		.with_seed(21)
		.with_memory_saving(memory_saving);
	let mut layer = SparseLutN::<6>::new(config).unwrap();
	layer.set_input_shape(&Shape::from([32])).unwrap();
	layer
}

#[test]
fn test_memory_saving_gradients_match_retained_gradients() {
	let ctx = ExecContext::host();
	let mut saving = sparse_lut(true);
	let mut retaining = sparse_lut(false);
	let x = random_frames(16, [32], 5);
	let dy = random_frames(16, [16], 6);

	let y_saving = saving.forward(&ctx, x.clone(), true).unwrap();
	let y_retaining = retaining.forward(&ctx, x, true).unwrap();
	assert_eq!(flat(&y_saving), flat(&y_retaining));

	let dx_saving = saving.backward(&ctx, dy.clone()).unwrap();
	let dx_retaining = retaining.backward(&ctx, dy).unwrap();
	assert_close(&flat(&dx_saving), &flat(&dx_retaining), 1e-6);
	for (a, b) in saving.gradients().iter().zip(retaining.gradients().iter()) {
		assert_close(a.read().as_slice(), b.read().as_slice(), 1e-6);
	}
	assert_eq!(
		saving.batch_norm().running_mean(),
		retaining.batch_norm().running_mean()
	);
	assert_eq!(
		saving.batch_norm().running_var(),
		retaining.batch_norm().running_var()
	);
}

#[test]
fn test_recompute_is_pure() {
	let ctx = ExecContext::host();
	let mut bn = BatchNormalization::default();
	bn.set_input_shape(&Shape::from([4])).unwrap();
	let x = random_frames(6, [4], 8);
	let y = bn.forward(&ctx, x.clone(), true).unwrap();
	let running = (bn.running_mean().clone(), bn.running_var().clone());
	bn.forget();
	assert!(!bn.retains_activations());
	for _ in 0..2 {
		let again = bn.recompute(&ctx, x.clone()).unwrap();
		assert_eq!(flat(&again), flat(&y));
	}
	assert_eq!((bn.running_mean().clone(), bn.running_var().clone()), running);
}

#[test]
fn test_backward_without_forward_fails_loudly() {
	let ctx = ExecContext::host();
	let mut layer = sparse_lut(true);
	assert_matches!(
		layer.backward(&ctx, random_frames(2, [16], 1)),
		Err(Error::BackwardWithoutForward { .. })
	);
	let mut model = Sequential::new().with(Relu::new());
	assert_matches!(
		model.forward(&ctx, random_frames(1, [1], 1), false),
		Err(Error::ShapeNotSet { .. })
	);
}

#[test]
fn test_modulation_mode_switch_frame_counts() {
	let ctx = ExecContext::host();
	let (probe, seen) = FrameProbe::new();
	let config = BinaryModulationConfig {
		training: ModulationConfig::default()
			.with_modulation_size(5)
			.with_value_generator(UniformValueGenerator::new(3)),
		inference: ModulationConfig::default()
			.with_modulation_size(2)
			.with_value_generator(NormalValueGenerator::new(0.5, 0.2, 4))
			.with_framewise(false),
		..Default::default()
	};
	let mut layer = BinaryModulation::new(Box::new(probe), config).unwrap();
	layer.set_input_shape(&Shape::from([3])).unwrap();

	let frames = 4;
	for (step, train) in [true, false, false, true, false].into_iter().enumerate() {
		let y = layer
			.forward(&ctx, random_frames(frames, [3], step as u64), train)
			.unwrap();
		assert_eq!(y.frames(), frames);
		let expected = if train { 5 } else { 2 };
		assert_eq!(layer.active_modulation().modulation_size, expected);
		assert_eq!(*seen.lock().unwrap().last().unwrap(), frames * expected);
		if train {
			let dx = layer.backward(&ctx, random_frames(frames, [3], 9)).unwrap();
			assert_eq!(dx.frames(), frames);
		}
	}
	assert_eq!(*seen.lock().unwrap(), vec![20, 8, 8, 20, 8]);
}

#[test]
fn test_forward_node_agrees_with_bulk_inference() {
	let ctx = ExecContext::host();
	let mut layer = sparse_lut(false);
	// A training pass gives the running statistics non-trivial values.
	layer.forward(&ctx, random_frames(32, [32], 10), true).unwrap();

	let x = random_frames(4, [32], 11);
	let y = layer.forward(&ctx, x.clone(), false).unwrap();
	let (xv, yv) = (x.lock::<f32>().unwrap(), y.lock::<f32>().unwrap());
	for node in 0..16 {
		assert_eq!(layer.node_input_size(node).unwrap(), 6);
		for frame in 0..4 {
			let inputs: Vec<f64> = (0..6)
				.map(|slot| xv.get(frame, layer.node_input(node, slot).unwrap()) as f64)
				.collect();
			let expected = layer.forward_node(node, &inputs).unwrap();
			assert!((expected[0] - yv.get(frame, node) as f64).abs() < 1e-4);
		}
	}
}

#[test]
fn test_stochastic_lut_forward_node_follows_bn_switch() {
	let ctx = ExecContext::host();
	let mut layer = StochasticLut::<2>::new(StochasticLutConfig::new([2])).unwrap();
	layer.set_input_shape(&Shape::from([4])).unwrap();
	let x = [0.3, 0.6];
	let with_bn = layer.forward_node(1, &x).unwrap();
	layer.send_command(&lutnet_model::Command::BatchNormalization(false), &Default::default());
	let without_bn = layer.forward_node(1, &x).unwrap();
	assert_ne!(with_bn, without_bn);

	let buffer = random_frames(3, [4], 2);
	let y = layer.forward(&ctx, buffer.clone(), false).unwrap();
	let xv = buffer.lock::<f32>().unwrap();
	let inputs: Vec<f64> = (0..2)
		.map(|slot| xv.get(0, layer.node_input(1, slot).unwrap()) as f64)
		.collect();
	let expected = layer.forward_node(1, &inputs).unwrap()[0];
	assert!((expected - y.lock::<f32>().unwrap().get(0, 1) as f64).abs() < 1e-5);
}

#[test]
fn test_composites_export_binarized_tables() {
	let mut model = Sequential::new()
		.with(SparseLutN::<4>::new(SparseLutConfig::new([5]).with_seed(3)).unwrap())
		.with(StochasticLut::<2>::new(StochasticLutConfig::new([2])).unwrap());
	model.set_input_shape(&Shape::from([8])).unwrap();

	let first = model.get(0).and_then(|layer| layer.as_sparse()).unwrap();
	let tables = first.lut_table_list().unwrap();
	assert_eq!(first.lut_table_size().unwrap(), 16);
	assert_eq!(tables.len(), 5);
	let weights = first.table_weights().read().as_slice().to_vec();
	for (node, table) in tables.iter().enumerate() {
		for (bitpos, &bit) in table.iter().enumerate() {
			assert_eq!(bit, weights[node * 16 + bitpos] > 0.5);
			assert_eq!(first.lut_table(node, bitpos).unwrap(), bit);
		}
	}

	let second = model.get(1).and_then(|layer| layer.as_sparse()).unwrap();
	assert_eq!(second.lut_table_list().unwrap().len(), 2);
	assert_matches!(second.lut_table(0, 4), Err(Error::TableEntryOutOfRange { .. }));
}
