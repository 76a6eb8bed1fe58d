// Copyright 2025 Irreducible Inc.

use std::sync::Arc;

use lutnet_utils::env::{boolean_env_flag_set, HOST_ONLY_ENV};
use tracing::debug;

use crate::{ComputeDevice, Error};

/// How operations choose between the host path and the device path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePolicy {
	/// Use the device when there is one and the layer allows it, otherwise run on the host.
	#[default]
	Auto,
	HostOnly,
	/// Fail instead of falling back to the host.
	DeviceOnly,
}

/// Execution settings handed to every forward and backward call.
#[derive(Clone, Debug, Default)]
pub struct ExecContext {
	device: Option<Arc<dyn ComputeDevice>>,
	policy: DevicePolicy,
}

impl ExecContext {
	/// A context without any device.
	pub fn host() -> Self {
		Self::default()
	}

	pub fn with_device(device: Arc<dyn ComputeDevice>) -> Self {
		Self {
			device: Some(device),
			policy: DevicePolicy::Auto,
		}
	}

	/// Like [`Self::with_device`], but `LUTNET_HOST_ONLY` pins everything to the host.
	pub fn from_env(device: Option<Arc<dyn ComputeDevice>>) -> Self {
		let policy = if boolean_env_flag_set(HOST_ONLY_ENV) {
			DevicePolicy::HostOnly
		} else {
			DevicePolicy::Auto
		};
		Self { device, policy }
	}

	pub fn with_policy(self, policy: DevicePolicy) -> Self {
		Self { policy, ..self }
	}

	pub fn policy(&self) -> DevicePolicy {
		self.policy
	}

	pub fn device(&self) -> Option<&Arc<dyn ComputeDevice>> {
		self.device.as_ref()
	}

	/// Picks the device for an operation of a layer, `None` meaning the host path.
	pub fn select_device(
		&self,
		layer_host_only: bool,
	) -> Result<Option<&Arc<dyn ComputeDevice>>, Error> {
		match (self.policy, &self.device) {
			(DevicePolicy::HostOnly, _) => Ok(None),
			(DevicePolicy::DeviceOnly, None) => {
				Err(Error::DeviceRequired("no device is available"))
			}
			(DevicePolicy::DeviceOnly, Some(_)) if layer_host_only => {
				Err(Error::DeviceRequired("the layer is pinned to the host"))
			}
			(DevicePolicy::DeviceOnly, Some(device)) => Ok(Some(device)),
			(DevicePolicy::Auto, Some(device)) if !layer_host_only => Ok(Some(device)),
			(DevicePolicy::Auto, device) => {
				debug!(
					device_available = device.is_some(),
					layer_host_only,
					"falling back to the host path"
				);
				Ok(None)
			}
		}
	}
}
