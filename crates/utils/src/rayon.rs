// Copyright 2025 Irreducible Inc.

use std::{env, sync::OnceLock};

/// With `RAYON_NUM_THREADS=1` the global pool is built with `use_current_thread`, so single
/// threaded runs execute node loops inline and traces stay readable.
///
/// Rayon only lets the global pool be configured once; call this at the start of `main`.
/// The result is returned by reference because `ThreadPoolBuildError` is not `Clone`.
pub fn adjust_thread_pool() -> &'static Result<(), rayon::ThreadPoolBuildError> {
	static ONCE_GUARD: OnceLock<Result<(), rayon::ThreadPoolBuildError>> = OnceLock::new();

	ONCE_GUARD.get_or_init(|| match env::var("RAYON_NUM_THREADS") {
		Ok(v) if v == "1" => rayon::ThreadPoolBuilder::new()
			.num_threads(1)
			.use_current_thread()
			.build_global(),
		_ => Ok(()),
	})
}

/// Minimum number of nodes handed to one worker in node-parallel loops.
pub fn min_nodes_per_task(node_count: usize) -> usize {
	(node_count / (4 * rayon::current_num_threads())).max(1)
}
