// Copyright 2025 Irreducible Inc.

mod common;

use assert_matches::assert_matches;
use common::random_frames;
use lutnet_compute::{ExecContext, Shape, Tensor};
use lutnet_model::{
	load_json_str, save_json_string, BinaryModulation, BinaryModulationConfig, Error, HardTanh,
	Layer, ModulationConfig, Relu, Sequential, Sgd, SparseConnectable, SparseLutConfig,
	SparseLutN, StochasticLut, StochasticLutConfig,
};

fn model(seed: u64) -> Sequential {
	let inner = Sequential::new()
		.with(SparseLutN::<2>::new(SparseLutConfig::new([8]).with_seed(seed)).unwrap())
		.with(Relu::new());
	let config = BinaryModulationConfig {
		output_shape: Some(Shape::from([4])),
		training: ModulationConfig::default().with_modulation_size(3),
		..Default::default()
	};
	let first = SparseLutConfig::new([4, 3])
		.with_connection("gauss")
		.with_seed(seed);
	let mut model = Sequential::new()
		.with(SparseLutN::<4>::new(first).unwrap())
		.with(StochasticLut::<2>::new(StochasticLutConfig::new([6])).unwrap())
		.with(BinaryModulation::new(Box::new(inner), config).unwrap())
		.with(HardTanh::new(0.0, 1.0));
	model.set_input_shape(&Shape::from([4, 4])).unwrap();
	model
}

/// One training step so that every parameter and running statistic leaves its initial value.
fn train(model: &mut Sequential) {
	let ctx = ExecContext::host();
	model.forward(&ctx, random_frames(8, [4, 4], 1), true).unwrap();
	model.backward(&ctx, random_frames(8, [4], 2)).unwrap();
	Sgd::new(0.1)
		.step(&model.parameters(), &model.gradients())
		.unwrap();
}

fn parameters(layer: &dyn Layer) -> Vec<Tensor> {
	layer
		.parameters()
		.iter()
		.map(|param| param.read().clone())
		.collect()
}

fn wiring(model: &Sequential) -> Vec<Vec<usize>> {
	model
		.get(0)
		.and_then(|layer| layer.as_sparse())
		.unwrap()
		.connection_list()
		.unwrap()
}

fn inference(model: &mut Sequential) -> Vec<f32> {
	let y = model
		.forward(&ExecContext::host(), random_frames(4, [4, 4], 3), false)
		.unwrap();
	y.to_frames::<f32>().unwrap()
}

#[test]
fn test_raw_round_trip() {
	let mut source = model(1);
	train(&mut source);
	let mut bytes = Vec::new();
	source.save(&mut bytes).unwrap();

	let mut target = model(2);
	assert_ne!(wiring(&source), wiring(&target));
	let mut reader = bytes.as_slice();
	target.load(&mut reader).unwrap();
	assert!(reader.is_empty());

	assert_eq!(parameters(&source), parameters(&target));
	assert_eq!(wiring(&source), wiring(&target));
	assert_eq!(inference(&mut source), inference(&mut target));
}

#[test]
fn test_json_round_trip() {
	let mut source = model(1);
	train(&mut source);
	let json = save_json_string(&source).unwrap();

	let document: serde_json::Value = serde_json::from_str(&json).unwrap();
	assert_eq!(document["class"], "Sequential");
	assert_eq!(document["children"][0]["class"], "SparseLut4");
	assert_eq!(document["children"][0]["children"][0]["class"], "StochasticLut4");
	assert_eq!(document["children"][2]["children"][1]["class"], "Sequential");

	let mut target = model(2);
	load_json_str(&mut target, &json).unwrap();
	assert_eq!(parameters(&source), parameters(&target));
	assert_eq!(wiring(&source), wiring(&target));
	assert_eq!(inference(&mut source), inference(&mut target));
}

#[test]
fn test_tag_mismatch_is_reported() {
	let mut source = Sequential::new().with(Relu::new());
	source.set_input_shape(&Shape::from([2])).unwrap();
	let mut bytes = Vec::new();
	source.save(&mut bytes).unwrap();

	let mut target = Sequential::new().with(HardTanh::default());
	target.set_input_shape(&Shape::from([2])).unwrap();
	assert_matches!(
		target.load(&mut bytes.as_slice()),
		Err(Error::TagMismatch { expected, found }) if expected == "HardTanh" && found == "ReLU"
	);

	let json = save_json_string(&source).unwrap();
	assert_matches!(
		load_json_str(&mut target, &json),
		Err(Error::TagMismatch { .. })
	);
}

#[test]
fn test_failed_load_leaves_node_untouched() {
	let mut source = SparseLutN::<2>::new(SparseLutConfig::new([4]).with_seed(3)).unwrap();
	source.set_input_shape(&Shape::from([8])).unwrap();
	let mut bytes = Vec::new();
	source.save(&mut bytes).unwrap();

	let mut target = SparseLutN::<2>::new(SparseLutConfig::new([4]).with_seed(4)).unwrap();
	target.set_input_shape(&Shape::from([8])).unwrap();
	let before_params = parameters(&target);
	let before_wiring = target.connection_list().unwrap();

	// Both class tags survive; the stream ends inside the connection table.
	let tags_len = 8 + "SparseLut2".len() + 8 + "StochasticLut2".len();
	let truncated = &bytes[..tags_len + 18];
	assert!(target.load(&mut &truncated[..]).is_err());
	assert_eq!(parameters(&target), before_params);
	assert_eq!(target.connection_list().unwrap(), before_wiring);
}

#[test]
fn test_load_rejects_mismatched_geometry() {
	let mut source = SparseLutN::<2>::new(SparseLutConfig::new([4])).unwrap();
	source.set_input_shape(&Shape::from([8])).unwrap();
	let json = save_json_string(&source).unwrap();

	let mut target = SparseLutN::<2>::new(SparseLutConfig::new([4])).unwrap();
	target.set_input_shape(&Shape::from([6])).unwrap();
	assert_matches!(
		load_json_str(&mut target, &json),
		Err(Error::InvalidPayload { .. })
	);
}
