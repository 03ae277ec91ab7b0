//! The serving model: everything needed to answer real-time requests for an
//! ALS-based recommender.
//!
//! Owns the user matrix `X`, the LSH-partitioned item matrix `Y`, the
//! known-items tracker, the cached YᵀY solver and the expected-identifier
//! bookkeeping that reports load progress during incremental model swaps.
//! All substructures are exclusively owned; callers only ever receive
//! copies, `Arc` handles or plain values.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use rayon::ThreadPool;
use tracing::debug;

use crate::config::ModelConfig;
use crate::feature_vectors::FeatureVectorsPartition;
use crate::known_items::KnownItems;
use crate::lsh::{LocalitySensitiveHash, Partitioner};
use crate::partitioned::PartitionedFeatureVectors;
use crate::rescorer::RescorerProvider;
use crate::solver::Solver;
use crate::solver_cache::SolverCache;
use crate::topn::{merge_top_n, AllowFn, RescoreFn, ScoreFn, TopNAccumulator};

pub struct ServingModel {
    lsh: Arc<LocalitySensitiveHash>,
    /// User-feature matrix.
    user_vectors: FeatureVectorsPartition,
    /// Item-feature matrix, partitioned by LSH for narrowed parallel scans.
    item_vectors: Arc<PartitionedFeatureVectors>,
    known_items: KnownItems,
    /// Identifiers promised by the upcoming model update but not yet seen.
    expected_user_ids: RwLock<HashSet<String>>,
    expected_item_ids: RwLock<HashSet<String>>,
    yty_solver_cache: Arc<SolverCache>,
    features: usize,
    implicit: bool,
    rescorer_provider: Option<Arc<dyn RescorerProvider>>,
}

impl ServingModel {
    /// Create an empty model. `pool` is the process-wide worker pool shared
    /// by partition scans and solver recomputation.
    pub fn new(
        config: &ModelConfig,
        rescorer_provider: Option<Arc<dyn RescorerProvider>>,
        pool: Arc<ThreadPool>,
    ) -> Result<Self> {
        config.validate()?;

        let lsh = Arc::new(LocalitySensitiveHash::new(
            config.sample_rate,
            config.features,
            pool.current_num_threads(),
        )?);
        let item_vectors = Arc::new(PartitionedFeatureVectors::new(
            lsh.num_partitions(),
            config.features,
            Arc::clone(&lsh) as Arc<dyn Partitioner>,
            pool,
        ));
        let yty_solver_cache = Arc::new(SolverCache::new(config.features, Arc::clone(&item_vectors)));

        Ok(Self {
            lsh,
            user_vectors: FeatureVectorsPartition::new(config.features),
            item_vectors,
            known_items: KnownItems::new(),
            expected_user_ids: RwLock::new(HashSet::new()),
            expected_item_ids: RwLock::new(HashSet::new()),
            yty_solver_cache,
            features: config.features,
            implicit: config.implicit,
            rescorer_provider,
        })
    }

    pub fn features(&self) -> usize {
        self.features
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn rescorer_provider(&self) -> Option<&Arc<dyn RescorerProvider>> {
        self.rescorer_provider.as_ref()
    }

    pub fn get_user_vector(&self, user: &str) -> Option<Arc<[f32]>> {
        self.user_vectors.get_vector(user)
    }

    pub fn get_item_vector(&self, item: &str) -> Option<Arc<[f32]>> {
        self.item_vectors.get_vector(item)
    }

    /// Insert or overwrite a user vector, resolving the user if it was
    /// expected by the current model swap.
    pub fn set_user_vector(&self, user: &str, vector: Vec<f32>) -> Result<()> {
        self.user_vectors.set_vector(user, vector)?;
        self.expected_user_ids.write().remove(user);
        Ok(())
    }

    /// Insert or overwrite an item vector. Invalidates the cached YᵀY
    /// solver; recomputing on every write would be most correct but the
    /// dirty flag coalesces a burst of updates into one recomputation.
    pub fn set_item_vector(&self, item: &str, vector: Vec<f32>) -> Result<()> {
        self.item_vectors.set_vector(item, vector)?;
        self.expected_item_ids.write().remove(item);
        self.yty_solver_cache.set_dirty();
        Ok(())
    }

    /// Known items for a user, as an owned copy. Empty when the user is
    /// unknown or has none; callers cannot tell those apart and do not need
    /// to.
    pub fn get_known_items(&self, user: &str) -> HashSet<String> {
        self.known_items.get(user)
    }

    pub fn add_known_items(&self, user: &str, items: &[String]) {
        self.known_items.add(user, items);
    }

    /// `(item, vector)` pairs for the user's known items whose vectors are
    /// present. `None` when the user itself is unknown or nothing resolves.
    pub fn get_known_item_vectors_for_user(
        &self,
        user: &str,
    ) -> Option<Vec<(String, Arc<[f32]>)>> {
        self.user_vectors.get_vector(user)?;
        let known = self.known_items.get(user);
        if known.is_empty() {
            return None;
        }
        let pairs: Vec<(String, Arc<[f32]>)> = known
            .into_iter()
            .filter_map(|item| {
                let vector = self.item_vectors.get_vector(&item)?;
                Some((item, vector))
            })
            .collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs)
        }
    }

    /// Count of known items per user.
    pub fn user_counts(&self) -> std::collections::HashMap<String, usize> {
        self.known_items.user_counts()
    }

    /// Count of users that know each item.
    pub fn item_counts(&self) -> std::collections::HashMap<String, usize> {
        self.known_items.item_counts()
    }

    /// Top `how_many` items for the query vector, ranked by
    /// `rescore(id, score(vector))` descending.
    ///
    /// Only partitions the LSH nominates for the query are scanned, so the
    /// result is the exact top N within that sampled candidate set, not
    /// necessarily over all items. That approximation is the latency
    /// trade-off the sample rate buys.
    pub fn top_n(
        &self,
        query: &[f32],
        how_many: usize,
        score_fn: ScoreFn<'_>,
        rescore_fn: Option<RescoreFn<'_>>,
        allowed_fn: AllowFn<'_>,
    ) -> Result<Vec<(String, f64)>> {
        if how_many == 0 {
            bail!("how_many must be > 0");
        }
        if query.len() != self.features {
            bail!(
                "query vector has length {}, model has {} features",
                query.len(),
                self.features
            );
        }

        let candidates = self.lsh.candidate_partitions(query);
        let per_partition = self.item_vectors.map_partitions(&candidates, true, |partition| {
            let mut acc = TopNAccumulator::new(how_many, score_fn, rescore_fn, allowed_fn);
            partition.for_each(|id, vector| acc.offer(id, vector));
            acc.into_sorted_vec()
        });
        Ok(merge_top_n(per_partition, how_many))
    }

    pub fn all_user_ids(&self) -> Vec<String> {
        self.user_vectors.all_ids()
    }

    pub fn all_item_ids(&self) -> Vec<String> {
        self.item_vectors.all_ids()
    }

    /// Solver for systems involving YᵀY, recomputing synchronously if item
    /// vectors changed since the last computation.
    pub fn yty_solver(&self) -> Result<Arc<Solver>> {
        self.yty_solver_cache
            .get(true)?
            .context("YtY solver unavailable")
    }

    /// Warm the YᵀY solver cache in the background.
    pub fn precompute_solvers(&self) {
        self.yty_solver_cache.compute();
    }

    /// Completed solver recomputations; exposed for observability.
    pub fn solver_computations(&self) -> u64 {
        self.yty_solver_cache.computations()
    }

    /// Model-swap hook: keep only users promised by the new model or added
    /// since the last pass, and reset the expected-user set to the promised
    /// identifiers that have not arrived yet.
    pub fn retain_recent_and_user_ids(&self, users: &HashSet<String>) {
        self.user_vectors.retain_recent_and_ids(users);
        let mut still_expected = users.clone();
        self.user_vectors.remove_all_ids_from(&mut still_expected);
        debug!(
            promised = users.len(),
            pending = still_expected.len(),
            "reset expected users for model swap"
        );
        *self.expected_user_ids.write() = still_expected;
    }

    /// [`retain_recent_and_user_ids`](Self::retain_recent_and_user_ids) for
    /// the item side.
    pub fn retain_recent_and_item_ids(&self, items: &HashSet<String>) {
        self.item_vectors.retain_recent_and_ids(items);
        let mut still_expected = items.clone();
        self.item_vectors.remove_all_ids_from(&mut still_expected);
        debug!(
            promised = items.len(),
            pending = still_expected.len(),
            "reset expected items for model swap"
        );
        *self.expected_item_ids.write() = still_expected;
    }

    /// Model-swap hook for the known-items tracker: keep users and items
    /// that the new model promises or that arrived since the last vector
    /// retention pass. "Recent" deliberately means exactly "touched since
    /// that pass", not a time window, so this must run before the vector
    /// retention hooks clear the recent sets.
    pub fn retain_recent_and_known_items(
        &self,
        users: &HashSet<String>,
        items: &HashSet<String>,
    ) {
        let mut recent_users = HashSet::new();
        self.user_vectors.add_all_recent_to(&mut recent_users);
        let mut recent_items = HashSet::new();
        self.item_vectors.add_all_recent_to(&mut recent_items);
        self.known_items.retain(users, items, &recent_users, &recent_items);
    }

    pub fn num_users(&self) -> usize {
        self.user_vectors.size()
    }

    pub fn num_items(&self) -> usize {
        self.item_vectors.size()
    }

    /// Fraction of promised identifiers already loaded; 1.0 when nothing is
    /// pending.
    pub fn fraction_loaded(&self) -> f64 {
        let expected = self.expected_user_ids.read().len() + self.expected_item_ids.read().len();
        if expected == 0 {
            return 1.0;
        }
        let loaded = (self.num_users() + self.num_items()) as f64;
        loaded / (loaded + expected as f64)
    }
}

impl fmt::Display for ServingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServingModel[features:{}, implicit:{}, X:({} users), Y:({} items, {} partitions), fractionLoaded:{}]",
            self.features,
            self.implicit,
            self.num_users(),
            self.num_items(),
            self.lsh.num_partitions(),
            self.fraction_loaded()
        )
    }
}
