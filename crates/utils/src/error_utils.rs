// Copyright 2025 Irreducible Inc.

/// Returns early from a layer or buffer operation with one of the workspace error enums
/// (`lutnet_model::Error`, `lutnet_compute::Error`, `lutnet_connect::Error`), converted into
/// the caller's error type with `Into` so a connection error can surface from a model call.
///
/// With the `bail_panic` feature enabled the error panics instead, so a shape or frame count
/// mismatch deep inside a training step stops at the failing check.
#[cfg(feature = "bail_panic")]
#[macro_export]
macro_rules! bail {
	($err:expr) => {
		panic!("{}", $err);
	};
}

#[cfg(not(feature = "bail_panic"))]
#[macro_export]
macro_rules! bail {
	($err:expr) => {
		return Err($err.into());
	};
}

/// Bails with `$err` unless `$cond` holds, e.g. a node count or fan-in precondition.
#[macro_export]
macro_rules! ensure {
	($cond:expr, $err:expr) => {
		if !$cond {
			$crate::bail!($err);
		}
	};
}
