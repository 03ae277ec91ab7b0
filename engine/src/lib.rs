//! In-memory serving core for an ALS matrix-factorization recommender.
//!
//! Holds the learned user and item latent-feature vectors and answers
//! low-latency top-N and lookup queries while an ingestion collaborator
//! pushes incremental model updates. Item vectors are partitioned by
//! locality-sensitive hashing so recommendation queries only scan the
//! partitions likely to contain the query's nearest neighbors, and the
//! YᵀY solver needed for fold-in is cached and lazily recomputed.
//!
//! This crate is a library with no wire protocol of its own; request
//! parsing and update deserialization live in the embedding serving layer.

pub mod config;
pub mod feature_vectors;
pub mod known_items;
pub mod lsh;
pub mod model;
pub mod partitioned;
pub mod pool;
pub mod rescorer;
pub mod solver;
pub mod solver_cache;
pub mod topn;

pub use config::ModelConfig;
pub use feature_vectors::FeatureVectorsPartition;
pub use known_items::KnownItems;
pub use lsh::{LocalitySensitiveHash, Partitioner};
pub use model::ServingModel;
pub use partitioned::PartitionedFeatureVectors;
pub use pool::build_worker_pool;
pub use rescorer::{Rescorer, RescorerProvider};
pub use solver::Solver;
pub use solver_cache::SolverCache;
pub use topn::{AllowFn, RescoreFn, ScoreFn};
