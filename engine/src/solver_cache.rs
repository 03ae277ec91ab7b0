//! Lazily recomputed, write-invalidated cache of the YᵀY solver.
//!
//! Recomputing the Gram-matrix solver on every single item-vector write
//! would be correct but wasteful; instead writers flip a dirty flag and the
//! next blocking reader (or the periodic warm-up task) pays for one
//! recomputation covering the whole dirty window.
//!
//! # Concurrency
//! Writers only touch the atomic dirty flag, so invalidation never blocks.
//! Validity is tracked separately under the mutex: the first reader to see
//! the flag marks the held solver invalid, and the solver is only served
//! again once a recomputation completes. During an in-flight recomputation
//! a non-blocking `get` returns `None` and a blocking `get` parks on a
//! condvar and adopts the winner's result instead of recomputing — never
//! the pre-invalidation solver. The dirty flag is cleared *before* the
//! reduction starts, so a write landing during the computation re-dirties
//! the cache and the next reader recomputes again. A failed computation
//! (singular Gram matrix) leaves the cache invalid and surfaces the error
//! to every caller blocked on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::partitioned::PartitionedFeatureVectors;
use crate::solver::Solver;

pub struct SolverCache {
    features: usize,
    item_vectors: Arc<PartitionedFeatureVectors>,
    inner: Mutex<Inner>,
    available: Condvar,
    dirty: AtomicBool,
    /// Completed full recomputations; observable so tests can assert the
    /// single-flight guarantee.
    computations: AtomicU64,
}

struct Inner {
    /// Most recently computed solver; only served while `valid`.
    solver: Option<Arc<Solver>>,
    /// Whether `solver` reflects the item vectors as of the last completed
    /// computation with no invalidation since.
    valid: bool,
    computing: bool,
    /// Error from the computation that most recently finished; cleared
    /// when the next computation starts.
    compute_error: Option<String>,
}

impl SolverCache {
    /// An empty cache starts absent and dirty; the first blocking `get`
    /// computes.
    pub fn new(features: usize, item_vectors: Arc<PartitionedFeatureVectors>) -> Self {
        Self {
            features,
            item_vectors,
            inner: Mutex::new(Inner {
                solver: None,
                valid: false,
                computing: false,
                compute_error: None,
            }),
            available: Condvar::new(),
            dirty: AtomicBool::new(true),
            computations: AtomicU64::new(0),
        }
    }

    /// Mark the cached solver stale. Called on every item-vector write;
    /// never blocks.
    pub fn set_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Number of completed full recomputations so far.
    pub fn computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    /// Current solver.
    ///
    /// Returns `Ok(Some)` when the cache is valid. When it is dirty,
    /// absent, or mid-recomputation: with `block_if_dirty` the caller
    /// either recomputes or waits for the in-flight recomputation (`Err`
    /// if that computation fails); without it the caller gets `Ok(None)`
    /// immediately, never a stale solver.
    pub fn get(&self, block_if_dirty: bool) -> Result<Option<Arc<Solver>>> {
        loop {
            {
                let mut inner = self.inner.lock();
                // Propagate a pending invalidation under the lock so no
                // path below can serve the pre-invalidation solver.
                if self.dirty.load(Ordering::Acquire) {
                    inner.valid = false;
                }
                if inner.valid {
                    if let Some(solver) = &inner.solver {
                        return Ok(Some(Arc::clone(solver)));
                    }
                }
                if !block_if_dirty {
                    return Ok(None);
                }
                if inner.computing {
                    self.available.wait(&mut inner);
                    if let Some(msg) = &inner.compute_error {
                        bail!("YtY solver unavailable: {msg}");
                    }
                    continue;
                }
                inner.computing = true;
                inner.compute_error = None;
            }

            // Clear before computing so writes that land mid-computation
            // re-dirty the cache. Item writes bump the store before the
            // flag, so a cleared flag never hides a write the reduction
            // below cannot see.
            self.dirty.store(false, Ordering::Release);
            let started = Instant::now();
            let result = self.build_solver();

            let mut inner = self.inner.lock();
            inner.computing = false;
            match result {
                Ok(solver) => {
                    self.computations.fetch_add(1, Ordering::Relaxed);
                    debug!(elapsed = ?started.elapsed(), "recomputed YtY solver");
                    let solver = Arc::new(solver);
                    inner.solver = Some(Arc::clone(&solver));
                    inner.valid = true;
                    self.available.notify_all();
                    return Ok(Some(solver));
                }
                Err(e) => {
                    error!("YtY solver computation failed: {e:#}");
                    self.dirty.store(true, Ordering::Release);
                    inner.valid = false;
                    inner.compute_error = Some(format!("{e:#}"));
                    self.available.notify_all();
                    return Err(e);
                }
            }
        }
    }

    /// Fire-and-forget warm-up on the worker pool; used by a periodic
    /// background task so queries rarely pay the recomputation themselves.
    pub fn compute(self: &Arc<Self>) {
        if !self.dirty.load(Ordering::Acquire) && self.inner.lock().valid {
            return;
        }
        let cache = Arc::clone(self);
        self.item_vectors.pool().spawn(move || {
            if let Err(e) = cache.get(true) {
                warn!("background YtY solver warm-up failed: {e:#}");
            }
        });
    }

    /// Gram-matrix reduction over every item partition, then the Cholesky
    /// factorization.
    fn build_solver(&self) -> Result<Solver> {
        let f = self.features;
        let partials = self.item_vectors.map_all_partitions(true, |partition| {
            let mut gram = vec![0.0f64; f * f];
            partition.for_each(|_, vector| {
                for i in 0..f {
                    let vi = vector[i] as f64;
                    for j in 0..=i {
                        gram[i * f + j] += vi * vector[j] as f64;
                    }
                }
            });
            gram
        });

        let mut gram = vec![0.0f64; f * f];
        for partial in partials {
            for (acc, value) in gram.iter_mut().zip(partial) {
                *acc += value;
            }
        }
        // Only the lower triangle was accumulated; mirror it.
        for i in 0..f {
            for j in 0..i {
                gram[j * f + i] = gram[i * f + j];
            }
        }
        Solver::cholesky(&gram, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsh::Partitioner;
    use crate::pool::build_worker_pool;

    struct SinglePartition;

    impl Partitioner for SinglePartition {
        fn partition_for(&self, _vector: &[f32]) -> usize {
            0
        }
    }

    fn item_store(features: usize) -> Arc<PartitionedFeatureVectors> {
        Arc::new(PartitionedFeatureVectors::new(
            1,
            features,
            Arc::new(SinglePartition),
            build_worker_pool().unwrap(),
        ))
    }

    #[test]
    fn test_absent_then_valid() {
        let items = item_store(2);
        items.set_vector("a", vec![1.0, 0.0]).unwrap();
        items.set_vector("b", vec![0.0, 2.0]).unwrap();
        let cache = SolverCache::new(2, Arc::clone(&items));

        assert!(cache.get(false).unwrap().is_none(), "absent without blocking");
        let solver = cache.get(true).unwrap().unwrap();
        assert_eq!(solver.dimension(), 2);
        assert_eq!(cache.computations(), 1);

        // Valid state serves without recomputing.
        assert!(cache.get(false).unwrap().is_some());
        cache.get(true).unwrap();
        assert_eq!(cache.computations(), 1);
    }

    #[test]
    fn test_dirty_forces_recomputation() {
        let items = item_store(2);
        items.set_vector("a", vec![1.0, 0.0]).unwrap();
        items.set_vector("b", vec![0.0, 2.0]).unwrap();
        let cache = SolverCache::new(2, Arc::clone(&items));
        cache.get(true).unwrap();

        cache.set_dirty();
        assert!(cache.get(false).unwrap().is_none());
        cache.get(true).unwrap();
        assert_eq!(cache.computations(), 2);
    }

    #[test]
    fn test_invalidated_solver_never_served() {
        // Enough items that a recomputation takes real time, widening the
        // window in which concurrent callers could observe stale state.
        let features = 8;
        let items = item_store(features);
        for i in 0..20_000usize {
            let v: Vec<f32> = (0..features)
                .map(|j| {
                    let base = ((i * (j + 1)) % 17) as f32 / 17.0;
                    if j == i % features {
                        base + 1.0
                    } else {
                        base
                    }
                })
                .collect();
            items.set_vector(&format!("i{i}"), v).unwrap();
        }
        let cache = Arc::new(SolverCache::new(features, Arc::clone(&items)));
        let before = cache.get(true).unwrap().unwrap();

        cache.set_dirty();
        // No recomputation has started yet: nothing to serve.
        assert!(cache.get(false).unwrap().is_none());

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || cache.get(true).unwrap().unwrap())
            })
            .collect();
        // Poll without blocking while the workers race the recomputation;
        // every observed solver must postdate the invalidation.
        for _ in 0..10_000 {
            if let Some(seen) = cache.get(false).unwrap() {
                assert!(
                    !Arc::ptr_eq(&seen, &before),
                    "pre-invalidation solver served during recomputation"
                );
            }
        }
        for worker in workers {
            let got = worker.join().unwrap();
            assert!(
                !Arc::ptr_eq(&got, &before),
                "blocking get returned the pre-invalidation solver"
            );
        }
        assert!(cache.computations() >= 2);
    }

    #[test]
    fn test_gram_matrix_reflects_items() {
        // Items (1,0) and (0,2): YtY = diag(1, 4), so solving YtY x = b
        // gives x = (b0, b1/4).
        let items = item_store(2);
        items.set_vector("a", vec![1.0, 0.0]).unwrap();
        items.set_vector("b", vec![0.0, 2.0]).unwrap();
        let cache = SolverCache::new(2, items);
        let solver = cache.get(true).unwrap().unwrap();
        let x = solver.solve(&[3.0, 8.0]).unwrap();
        assert!((x[0] - 3.0).abs() < 1e-9);
        assert!((x[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_store_is_solver_unavailable() {
        let cache = SolverCache::new(2, item_store(2));
        assert!(cache.get(true).is_err());
        // Cache stays invalid and usable; items arriving later fix it.
        assert!(cache.get(false).unwrap().is_none());
    }

    #[test]
    fn test_failure_then_recovery() {
        let items = item_store(2);
        let cache = SolverCache::new(2, Arc::clone(&items));
        assert!(cache.get(true).is_err());

        items.set_vector("a", vec![1.0, 0.0]).unwrap();
        items.set_vector("b", vec![0.0, 1.0]).unwrap();
        cache.set_dirty();
        // The fresh computation succeeds; the old failure message must not
        // leak into its result.
        assert!(cache.get(true).unwrap().is_some());
        assert!(cache.get(false).unwrap().is_some());
    }
}
