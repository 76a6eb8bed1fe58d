// Copyright 2025 Irreducible Inc.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a formatting subscriber filtered by `RUST_LOG` (default `warn`).
///
/// Safe to call repeatedly; only the first call installs the subscriber.
pub fn init_tracing() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer().with_target(true))
		.try_init();
}
