//! Shared worker pool for partition scans and solver recomputation.
//!
//! One pool per process, sized to available parallelism and shared by every
//! model instance via `Arc`. The pool is injected into the structures that
//! need it rather than reached through a global, so tests can build their
//! own. Rayon worker threads are detached and never block process exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};

/// Build a fixed-size pool with one thread per available core.
pub fn build_worker_pool() -> Result<Arc<ThreadPool>> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("serving-model-{i}"))
        .build()
        .context("failed to build worker pool")?;
    Ok(Arc::new(pool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_runs_work() {
        let pool = build_worker_pool().unwrap();
        assert!(pool.current_num_threads() >= 1);
        let sum: i64 = pool.install(|| (1..=100).sum());
        assert_eq!(sum, 5050);
    }
}
