//! One shard of feature vectors keyed by string identifier.
//!
//! The store remembers which identifiers were touched since the last
//! retention pass, so incremental model swaps can keep both the vectors
//! promised by the new model and anything that arrived in between.
//!
//! # Thread Safety
//! A single `RwLock` protects the vector map and a second one the
//! recently-touched set. Readers take read locks for lookups and scans;
//! writers hold the write lock only for the map mutation itself. No lock is
//! held across a call into another component.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;

/// In-memory map from identifier to feature vector, with recent-touch
/// tracking for retention passes.
pub struct FeatureVectorsPartition {
    features: usize,
    vectors: RwLock<HashMap<String, Arc<[f32]>>>,
    recent_ids: RwLock<HashSet<String>>,
}

impl FeatureVectorsPartition {
    /// Create an empty store whose vectors must all have length `features`.
    pub fn new(features: usize) -> Self {
        Self {
            features,
            vectors: RwLock::new(HashMap::new()),
            recent_ids: RwLock::new(HashSet::new()),
        }
    }

    /// Vector for `id`, if present. The returned `Arc` is a cheap handle to
    /// the stored vector; a concurrent overwrite replaces the map entry but
    /// never mutates a vector a reader already holds.
    pub fn get_vector(&self, id: &str) -> Option<Arc<[f32]>> {
        self.vectors.read().get(id).cloned()
    }

    /// Insert or overwrite the vector for `id`, marking it recently touched.
    ///
    /// Rejects vectors whose length differs from the configured feature
    /// count; prior state for `id` is left unchanged in that case.
    pub fn set_vector(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.features {
            bail!(
                "vector for '{}' has length {}, model has {} features",
                id,
                vector.len(),
                self.features
            );
        }
        self.vectors.write().insert(id.to_owned(), Arc::from(vector));
        self.recent_ids.write().insert(id.to_owned());
        Ok(())
    }

    /// Remove the vector for `id`, if present. Recent-touch state for the
    /// identifier is left alone.
    pub fn remove_vector(&self, id: &str) {
        self.vectors.write().remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.vectors.read().contains_key(id)
    }

    pub fn size(&self) -> usize {
        self.vectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.read().is_empty()
    }

    /// All identifiers currently stored.
    pub fn all_ids(&self) -> Vec<String> {
        self.vectors.read().keys().cloned().collect()
    }

    /// Union all stored identifiers into `out`.
    pub fn add_all_ids_to(&self, out: &mut HashSet<String>) {
        for id in self.vectors.read().keys() {
            out.insert(id.clone());
        }
    }

    /// Remove every stored identifier from `out`. Used to subtract
    /// already-present identifiers from an expected-ID set.
    pub fn remove_all_ids_from(&self, out: &mut HashSet<String>) {
        for id in self.vectors.read().keys() {
            out.remove(id);
        }
    }

    /// Union identifiers touched since the last retention pass into `out`.
    pub fn add_all_recent_to(&self, out: &mut HashSet<String>) {
        for id in self.recent_ids.read().iter() {
            out.insert(id.clone());
        }
    }

    /// Drop every entry whose identifier is neither in `ids` nor touched
    /// since the previous retention pass, then clear the recent set.
    pub fn retain_recent_and_ids(&self, ids: &HashSet<String>) {
        let mut vectors = self.vectors.write();
        let mut recent = self.recent_ids.write();
        vectors.retain(|id, _| ids.contains(id) || recent.contains(id));
        recent.clear();
    }

    /// Apply `f` to every (identifier, vector) entry under the read lock.
    ///
    /// Entries inserted or removed concurrently may or may not be observed;
    /// callers only get best-effort scan semantics.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &[f32]),
    {
        for (id, vector) in self.vectors.read().iter() {
            f(id, vector);
        }
    }
}
