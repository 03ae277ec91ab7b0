//! Item vectors split across fixed partitions for narrowed, parallel scans.
//!
//! The partition count is fixed at construction (one per LSH bucket) and an
//! item's partition is a pure function of its current vector, so an updated
//! vector may migrate between partitions. An id-to-partition map makes point
//! lookups O(1) and lets `set_vector` evict the stale copy from the old
//! partition.
//!
//! Scans run against per-partition read locks rather than a global snapshot:
//! a scan concurrent with writers sees each partition at some point during
//! the pass, which is all best-effort ranking needs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::RwLock;
use rayon::prelude::*;
use rayon::ThreadPool;

use crate::feature_vectors::FeatureVectorsPartition;
use crate::lsh::Partitioner;

pub struct PartitionedFeatureVectors {
    features: usize,
    partitions: Box<[FeatureVectorsPartition]>,
    /// Which partition currently holds each identifier.
    partition_map: RwLock<HashMap<String, usize>>,
    /// Bumped before an update evicts an entry from its previous
    /// partition, so readers can tell a concurrent relocation apart from a
    /// genuine absence.
    moves: AtomicU64,
    partitioner: Arc<dyn Partitioner>,
    pool: Arc<ThreadPool>,
}

impl PartitionedFeatureVectors {
    pub fn new(
        num_partitions: usize,
        features: usize,
        partitioner: Arc<dyn Partitioner>,
        pool: Arc<ThreadPool>,
    ) -> Self {
        let partitions = (0..num_partitions)
            .map(|_| FeatureVectorsPartition::new(features))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            features,
            partitions,
            partition_map: RwLock::new(HashMap::new()),
            moves: AtomicU64::new(0),
            partitioner,
            pool,
        }
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// The worker pool partition scans fan out on.
    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn get_vector(&self, id: &str) -> Option<Arc<[f32]>> {
        loop {
            let moves = self.moves.load(Ordering::Acquire);
            let partition = *self.partition_map.read().get(id)?;
            if let Some(vector) = self.partitions[partition].get_vector(id) {
                return Some(vector);
            }
            // An entry can only be missing from its mapped partition if a
            // concurrent update relocated it between the two reads, and
            // every relocation bumps the move counter before evicting.
            // No bump means the entry is genuinely gone.
            if self.moves.load(Ordering::Acquire) == moves {
                return None;
            }
        }
    }

    /// Insert or overwrite `id`, storing it in the partition its new vector
    /// hashes to and evicting any stale copy from the partition it moved
    /// away from.
    ///
    /// Ordering matters for readers: the vector is stored in the new
    /// partition first, then the map is repointed, then the old copy is
    /// evicted, so an entry that is continuously present is found in at
    /// least one partition at every instant.
    pub fn set_vector(&self, id: &str, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.features {
            bail!(
                "vector for '{}' has length {}, model has {} features",
                id,
                vector.len(),
                self.features
            );
        }
        let new_partition = self.partitioner.partition_for(&vector);
        self.partitions[new_partition].set_vector(id, vector)?;
        let old_partition = {
            let mut map = self.partition_map.write();
            map.insert(id.to_owned(), new_partition)
        };
        if let Some(old) = old_partition {
            if old != new_partition {
                self.moves.fetch_add(1, Ordering::Release);
                self.partitions[old].remove_vector(id);
            }
        }
        Ok(())
    }

    /// Remove `id` from whichever partition holds it, if any.
    pub fn remove_vector(&self, id: &str) {
        let old = self.partition_map.write().remove(id);
        if let Some(partition) = old {
            self.partitions[partition].remove_vector(id);
        }
    }

    pub fn size(&self) -> usize {
        self.partitions.iter().map(|p| p.size()).sum()
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.partition_map.read().keys().cloned().collect()
    }

    pub fn add_all_ids_to(&self, out: &mut HashSet<String>) {
        for partition in self.partitions.iter() {
            partition.add_all_ids_to(out);
        }
    }

    pub fn remove_all_ids_from(&self, out: &mut HashSet<String>) {
        for partition in self.partitions.iter() {
            partition.remove_all_ids_from(out);
        }
    }

    pub fn add_all_recent_to(&self, out: &mut HashSet<String>) {
        for partition in self.partitions.iter() {
            partition.add_all_recent_to(out);
        }
    }

    /// Retention pass over every partition, then prune the id-to-partition
    /// map of identifiers that no longer survive anywhere.
    pub fn retain_recent_and_ids(&self, ids: &HashSet<String>) {
        for partition in self.partitions.iter() {
            partition.retain_recent_and_ids(ids);
        }
        self.partition_map
            .write()
            .retain(|id, partition| self.partitions[*partition].contains(id));
    }

    /// Apply `f` to each selected partition and collect the per-partition
    /// results, fanning out across the worker pool when `parallel` is set.
    pub fn map_partitions<R, F>(&self, indices: &[usize], parallel: bool, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(&FeatureVectorsPartition) -> R + Send + Sync,
    {
        if parallel && indices.len() > 1 {
            self.pool
                .install(|| indices.par_iter().map(|&i| f(&self.partitions[i])).collect())
        } else {
            indices.iter().map(|&i| f(&self.partitions[i])).collect()
        }
    }

    /// [`map_partitions`](Self::map_partitions) over every partition.
    pub fn map_all_partitions<R, F>(&self, parallel: bool, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(&FeatureVectorsPartition) -> R + Send + Sync,
    {
        let indices: Vec<usize> = (0..self.partitions.len()).collect();
        self.map_partitions(&indices, parallel, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::build_worker_pool;

    /// Routes each vector by the sign of its first component.
    struct FirstComponentSign;

    impl Partitioner for FirstComponentSign {
        fn partition_for(&self, vector: &[f32]) -> usize {
            usize::from(vector[0] > 0.0)
        }
    }

    fn store() -> PartitionedFeatureVectors {
        PartitionedFeatureVectors::new(
            2,
            2,
            Arc::new(FirstComponentSign),
            build_worker_pool().unwrap(),
        )
    }

    #[test]
    fn test_set_routes_to_partition() {
        let store = store();
        store.set_vector("pos", vec![1.0, 0.0]).unwrap();
        store.set_vector("neg", vec![-1.0, 0.0]).unwrap();
        assert_eq!(store.size(), 2);
        assert_eq!(&store.get_vector("pos").unwrap()[..], &[1.0, 0.0]);
        assert_eq!(&store.get_vector("neg").unwrap()[..], &[-1.0, 0.0]);
    }

    #[test]
    fn test_update_moves_between_partitions() {
        let store = store();
        store.set_vector("x", vec![1.0, 0.0]).unwrap();
        store.set_vector("x", vec![-1.0, 5.0]).unwrap();
        assert_eq!(store.size(), 1, "stale copy must leave the old partition");
        assert_eq!(&store.get_vector("x").unwrap()[..], &[-1.0, 5.0]);
    }

    #[test]
    fn test_remove_vector() {
        let store = store();
        store.set_vector("x", vec![1.0, 0.0]).unwrap();
        store.remove_vector("x");
        store.remove_vector("never-there");
        assert_eq!(store.size(), 0);
        assert!(store.get_vector("x").is_none());
    }

    #[test]
    fn test_wrong_length_rejected_before_any_mutation() {
        let store = store();
        store.set_vector("x", vec![1.0, 0.0]).unwrap();
        assert!(store.set_vector("x", vec![1.0]).is_err());
        assert_eq!(&store.get_vector("x").unwrap()[..], &[1.0, 0.0]);
    }

    #[test]
    fn test_map_partitions_selected_only() {
        let store = store();
        store.set_vector("pos", vec![1.0, 0.0]).unwrap();
        store.set_vector("neg", vec![-1.0, 0.0]).unwrap();

        let sizes = store.map_partitions(&[1], false, |p| p.size());
        assert_eq!(sizes, vec![1]);

        let mut all: Vec<usize> = store.map_all_partitions(true, |p| p.size());
        all.sort_unstable();
        assert_eq!(all, vec![1, 1]);
    }

    #[test]
    fn test_reads_never_miss_during_partition_moves() {
        let store = Arc::new(PartitionedFeatureVectors::new(
            2,
            2,
            Arc::new(FirstComponentSign),
            build_worker_pool().unwrap(),
        ));
        store.set_vector("x", vec![1.0, 0.0]).unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Acquire) {
                        assert!(
                            store.get_vector("x").is_some(),
                            "entry vanished while relocating between partitions"
                        );
                    }
                })
            })
            .collect();

        // Every write flips the owning partition.
        for i in 0..5_000 {
            let sign = if i % 2 == 0 { -1.0 } else { 1.0 };
            store.set_vector("x", vec![sign, i as f32]).unwrap();
        }
        stop.store(true, Ordering::Release);
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.size(), 1);
    }

    #[test]
    fn test_retain_prunes_partition_map() {
        let store = store();
        store.set_vector("a", vec![1.0, 0.0]).unwrap();
        store.set_vector("b", vec![-1.0, 0.0]).unwrap();
        store.retain_recent_and_ids(&HashSet::new()); // everything is recent
        let keep: HashSet<String> = ["a".to_owned()].into();
        store.retain_recent_and_ids(&keep);
        assert_eq!(store.size(), 1);
        assert!(store.get_vector("b").is_none());
        assert_eq!(store.all_ids(), vec!["a".to_owned()]);
    }
}
