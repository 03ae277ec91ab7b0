// engine/src/config.rs
//
// Model configuration for the serving core.
//
// Kept deliberately small: the serving core is a library, so anything about
// transport, ingestion or persistence is configured by the embedding layer.
// Priority of configuration sources (file vs environment vs CLI) is likewise
// the embedding layer's concern; this module only defines the typed shape
// and its validation.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Configuration for one [`crate::ServingModel`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    /// Number of latent features in user/item vectors.
    pub features: usize,

    /// Whether the model was trained on implicit feedback. Stored for the
    /// caller's scoring choice; not interpreted by the core.
    pub implicit: bool,

    /// Approximate fraction of all items considered per recommendation
    /// query. Candidates are chosen with locality-sensitive hashing; 1.0
    /// degenerates to scanning every partition.
    pub sample_rate: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            features: 10,
            implicit: true,
            sample_rate: 1.0,
        }
    }
}

impl ModelConfig {
    /// Validate all parameters, returning a clear error for the first
    /// violation found.
    pub fn validate(&self) -> Result<()> {
        if self.features == 0 {
            bail!("features must be > 0");
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 || self.sample_rate > 1.0 {
            bail!("sample_rate must be in (0, 1], got {}", self.sample_rate);
        }
        Ok(())
    }
}
