// Copyright 2025 Irreducible Inc.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use common::random_frames;
use lutnet_compute::{cpu::CpuDevice, DevicePolicy, ExecContext, FrameBuffer, Shape};
use lutnet_model::{
	info, send_command_str, Command, Error, HardTanh, Layer, Relu, Sequential, SparseLutConfig,
	SparseLutN, Target, INFO_COLUMNS,
};

fn activations() -> Sequential {
	let mut model = Sequential::new()
		.with(Relu::new())
		.with(HardTanh::new(-0.5, 0.5));
	model.set_input_shape(&Shape::from([3])).unwrap();
	model
}

fn input() -> FrameBuffer {
	FrameBuffer::from_frames(&[-1.0f32, 0.25, 2.0, 0.1, -0.2, 0.4], 2, [3]).unwrap()
}

fn run(model: &mut Sequential, ctx: &ExecContext) -> Vec<f32> {
	model
		.forward(ctx, input(), false)
		.unwrap()
		.to_frames::<f32>()
		.unwrap()
}

#[test]
fn test_targeted_command_reaches_only_matching_class() {
	let ctx = ExecContext::host();
	let mut model = activations();
	assert_eq!(run(&mut model, &ctx), vec![0.0, 0.25, 0.5, 0.1, 0.0, 0.4]);

	model.send_command(&Command::Binary(true), &Target::from("HardTanh"));
	// Binarized at the midpoint of [-0.5, 0.5].
	assert_eq!(run(&mut model, &ctx), vec![-0.5, 0.5, 0.5, 0.5, -0.5, 0.5]);

	model.send_command(&Command::Binary(true), &Target::from("Relu"));
	assert_eq!(run(&mut model, &ctx), vec![-0.5, 0.5, 0.5, 0.5, -0.5, 0.5]);

	assert!(send_command_str(&mut model, "binary false", "all"));
	assert_eq!(run(&mut model, &ctx), vec![0.0, 0.25, 0.5, 0.1, 0.0, 0.4]);

	assert!(send_command_str(&mut model, "binary true", "ReLU"));
	assert_eq!(run(&mut model, &ctx), vec![0.0, 0.5, 0.5, 0.5, 0.0, 0.5]);
}

#[test]
fn test_unknown_commands_are_ignored() {
	let ctx = ExecContext::host();
	let mut model = activations();
	let before = run(&mut model, &ctx);
	assert!(!send_command_str(&mut model, "lut_binarize true", "all"));
	assert!(!send_command_str(&mut model, "binary maybe", "all"));
	model.send_command(&Command::BatchNormalization(false), &Target::All);
	assert_eq!(run(&mut model, &ctx), before);
}

#[test]
fn test_device_and_host_paths_agree() {
	let host = ExecContext::host();
	let device =
		ExecContext::with_device(Arc::new(CpuDevice)).with_policy(DevicePolicy::DeviceOnly);

	for binary in [false, true] {
		let mut on_host = activations();
		let mut on_device = activations();
		on_host.send_command(&Command::Binary(binary), &Target::All);
		on_device.send_command(&Command::Binary(binary), &Target::All);

		let x = random_frames(6, [3], 12);
		let y_host = on_host.forward(&host, x.clone(), true).unwrap();
		let y_device = on_device.forward(&device, x, true).unwrap();
		assert_eq!(
			y_host.to_frames::<f32>().unwrap(),
			y_device.to_frames::<f32>().unwrap()
		);

		let dy = random_frames(6, [3], 13);
		let dx_host = on_host.backward(&host, dy.clone()).unwrap();
		let dx_device = on_device.backward(&device, dy).unwrap();
		assert_eq!(
			dx_host.to_frames::<f32>().unwrap(),
			dx_device.to_frames::<f32>().unwrap()
		);
	}
}

#[test]
fn test_host_only_layers_fall_back_or_fail() {
	let mut model = activations();
	model.send_command(&Command::HostOnly(true), &Target::from("ReLU"));

	let auto = ExecContext::with_device(Arc::new(CpuDevice));
	assert!(model.forward(&auto, input(), false).is_ok());

	let forced = auto.with_policy(DevicePolicy::DeviceOnly);
	assert_matches!(
		model.forward(&forced, input(), false),
		Err(Error::Compute(lutnet_compute::Error::DeviceRequired(_)))
	);

	let no_device = ExecContext::host().with_policy(DevicePolicy::DeviceOnly);
	let mut model = activations();
	assert_matches!(
		model.forward(&no_device, input(), false),
		Err(Error::Compute(lutnet_compute::Error::DeviceRequired(_)))
	);
}

#[test]
fn test_info_lists_tree_to_depth() {
	let mut model = Sequential::new()
		.with(SparseLutN::<2>::new(SparseLutConfig::new([4])).unwrap())
		.with(Relu::new());
	model.set_input_shape(&Shape::from([8])).unwrap();

	let full = info(&model, 0, INFO_COLUMNS);
	for class in [
		"Sequential",
		"SparseLut2",
		"StochasticLut2",
		"BatchNormalization",
		"HardTanh",
		"ReLU",
	] {
		assert!(full.contains(class), "missing {class}");
	}
	assert!(full.contains(&format!("parameters   : {}", 4 * 4 + 4 + 4)));

	let shallow = info(&model, 2, INFO_COLUMNS);
	assert!(shallow.contains("SparseLut2"));
	assert!(!shallow.contains("StochasticLut2"));

	let top = info(&model, 1, 40);
	assert!(!top.contains("ReLU"));
	assert!(top.lines().all(|line| line.len() <= 40));
}
