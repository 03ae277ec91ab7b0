//! Locality-sensitive hashing over signed random projections.
//!
//! Items are spread across `2^h` partitions by the sign pattern of `h`
//! Gaussian hyperplane projections. Vectors with high cosine similarity
//! agree on more signs and therefore land in the same or nearby partitions
//! with higher probability, so a query only has to scan the partitions
//! within a small Hamming radius of its own.
//!
//! The pair `(h, max_bits_differing)` is chosen at construction so that the
//! expected fraction of partitions probed per query is as close as possible
//! to the configured sample rate, while keeping at least as many partitions
//! as worker threads so full scans still parallelize.

use anyhow::{bail, Result};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

/// Maps a vector to the index of the partition that owns it.
///
/// Implemented by [`LocalitySensitiveHash`]; the partitioned store takes it
/// as a seam so tests can pin assignments.
pub trait Partitioner: Send + Sync {
    fn partition_for(&self, vector: &[f32]) -> usize;
}

/// Upper bound on hash bits; 2^16 partitions is already far beyond any
/// useful parallelism for an in-memory scan.
const MAX_HASHES: u32 = 16;

/// Fixed RNG seed so partition assignment is a pure function of the vector
/// for every model built with the same feature count.
const HYPERPLANE_SEED: u64 = 0x414c_535f_4c53_48;

pub struct LocalitySensitiveHash {
    /// `num_hashes` hyperplanes, each of `features` components.
    hyperplanes: Vec<Vec<f32>>,
    num_hashes: u32,
    max_bits_differing: u32,
}

impl LocalitySensitiveHash {
    /// Build a hash for `features`-dimensional vectors targeting
    /// `sample_rate` of items probed per query, with enough partitions to
    /// keep `num_cores` workers busy.
    pub fn new(sample_rate: f64, features: usize, num_cores: usize) -> Result<Self> {
        if features == 0 {
            bail!("features must be > 0");
        }
        if !sample_rate.is_finite() || sample_rate <= 0.0 || sample_rate > 1.0 {
            bail!("sample_rate must be in (0, 1], got {sample_rate}");
        }

        let min_hashes = bits_for_cores(num_cores);
        let mut num_hashes = min_hashes;
        let mut max_bits_differing = min_hashes;
        let mut best_diff = f64::INFINITY;
        for n in min_hashes..=MAX_HASHES {
            let m = max_bits_within_rate(n, sample_rate);
            let diff = (probed_fraction(n, m) - sample_rate).abs();
            if diff < best_diff {
                best_diff = diff;
                num_hashes = n;
                max_bits_differing = m;
            }
        }

        let mut rng = ChaCha8Rng::seed_from_u64(HYPERPLANE_SEED);
        let hyperplanes = (0..num_hashes)
            .map(|_| {
                (0..features)
                    .map(|_| StandardNormal.sample(&mut rng))
                    .collect()
            })
            .collect();

        Ok(Self {
            hyperplanes,
            num_hashes,
            max_bits_differing,
        })
    }

    pub fn num_partitions(&self) -> usize {
        1 << self.num_hashes
    }

    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    pub fn max_bits_differing(&self) -> u32 {
        self.max_bits_differing
    }

    /// Partition indices worth scanning for `query`: every partition whose
    /// bit pattern is within `max_bits_differing` of the query's own.
    /// Always non-empty, always contains the query's own partition, and
    /// deterministic (ascending) for a fixed query.
    pub fn candidate_partitions(&self, query: &[f32]) -> Vec<usize> {
        let own = self.partition_for(query);
        (0..self.num_partitions())
            .filter(|&p| ((p ^ own) as u32).count_ones() <= self.max_bits_differing)
            .collect()
    }
}

impl Partitioner for LocalitySensitiveHash {
    /// Bit `i` of the partition index is the sign of the projection onto
    /// hyperplane `i`. Pure and deterministic for a given vector.
    fn partition_for(&self, vector: &[f32]) -> usize {
        let mut index = 0usize;
        for (bit, hyperplane) in self.hyperplanes.iter().enumerate() {
            if dot(vector, hyperplane) > 0.0 {
                index |= 1 << bit;
            }
        }
        index
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Smallest hash count giving at least one partition per core.
fn bits_for_cores(num_cores: usize) -> u32 {
    let cores = num_cores.max(1) as f64;
    (cores.log2().ceil() as u32).clamp(1, MAX_HASHES)
}

/// Largest Hamming radius `m` such that probing all partitions within `m`
/// bits of the query's partition covers at most `sample_rate` of them.
/// Returns 0 when even the single own partition exceeds the rate.
fn max_bits_within_rate(num_hashes: u32, sample_rate: f64) -> u32 {
    let mut m = 0;
    while m < num_hashes && probed_fraction(num_hashes, m + 1) <= sample_rate {
        m += 1;
    }
    m
}

/// Fraction of the `2^n` partitions within Hamming distance `m`.
fn probed_fraction(num_hashes: u32, max_bits_differing: u32) -> f64 {
    let total = (1u64 << num_hashes) as f64;
    (0..=max_bits_differing)
        .map(|i| binomial(num_hashes, i) as f64)
        .sum::<f64>()
        / total
}

fn binomial(n: u32, k: u32) -> u64 {
    let k = k.min(n - k);
    let mut result = 1u64;
    for i in 0..k {
        result = result * (n - i) as u64 / (i + 1) as u64;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binomial() {
        assert_eq!(binomial(4, 0), 1);
        assert_eq!(binomial(4, 2), 6);
        assert_eq!(binomial(16, 8), 12870);
    }

    #[test]
    fn test_full_sample_rate_probes_everything() {
        let lsh = LocalitySensitiveHash::new(1.0, 4, 8).unwrap();
        let candidates = lsh.candidate_partitions(&[0.3, -0.1, 0.9, 0.2]);
        assert_eq!(candidates.len(), lsh.num_partitions());
    }

    #[test]
    fn test_partition_for_is_deterministic_and_in_range() {
        let lsh = LocalitySensitiveHash::new(0.1, 8, 8).unwrap();
        let v = vec![0.5, -1.2, 0.0, 3.3, -0.7, 0.1, 2.0, -2.0];
        let p = lsh.partition_for(&v);
        assert!(p < lsh.num_partitions());
        for _ in 0..10 {
            assert_eq!(lsh.partition_for(&v), p);
        }
    }

    #[test]
    fn test_candidates_include_own_partition() {
        let lsh = LocalitySensitiveHash::new(0.05, 6, 4).unwrap();
        let v = vec![1.0, -0.4, 0.2, 0.8, -1.5, 0.6];
        let own = lsh.partition_for(&v);
        let candidates = lsh.candidate_partitions(&v);
        assert!(!candidates.is_empty());
        assert!(candidates.contains(&own));
        // Deterministic across calls.
        assert_eq!(lsh.candidate_partitions(&v), candidates);
    }

    #[test]
    fn test_candidate_fraction_tracks_sample_rate() {
        for &rate in &[0.01, 0.1, 0.33, 0.75, 1.0] {
            let lsh = LocalitySensitiveHash::new(rate, 5, 8).unwrap();
            let candidates = lsh.candidate_partitions(&[0.1, 0.2, -0.3, 0.4, 0.5]);
            let fraction = candidates.len() as f64 / lsh.num_partitions() as f64;
            // The achievable fractions are quantized by the Hamming-ball
            // sizes, so only require the right ballpark.
            assert!(
                fraction <= (rate * 4.0).min(1.0) && fraction * 8.0 >= rate,
                "rate {rate}: probed fraction {fraction}"
            );
        }
    }

    #[test]
    fn test_similar_vectors_collide_more_than_dissimilar() {
        let lsh = LocalitySensitiveHash::new(0.25, 16, 8).unwrap();
        let base: Vec<f32> = (0..16).map(|i| ((i * 7 + 3) % 11) as f32 - 5.0).collect();
        let near: Vec<f32> = base.iter().map(|x| x + 0.01).collect();
        let far: Vec<f32> = base.iter().map(|x| -x).collect();

        assert_eq!(lsh.partition_for(&base), lsh.partition_for(&near));
        // The opposite vector flips every projection sign, landing in the
        // complementary partition.
        let opposite = lsh.partition_for(&far);
        assert_ne!(lsh.partition_for(&base), opposite);
        assert!(!lsh.candidate_partitions(&base).contains(&opposite) || lsh.max_bits_differing() >= lsh.num_hashes());
    }

    #[test]
    fn test_rejects_bad_construction() {
        assert!(LocalitySensitiveHash::new(0.5, 0, 4).is_err());
        assert!(LocalitySensitiveHash::new(0.0, 4, 4).is_err());
        assert!(LocalitySensitiveHash::new(1.5, 4, 4).is_err());
    }
}
