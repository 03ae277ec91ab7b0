//! Caller-supplied score adjustment capability.
//!
//! The serving layer can attach business rules (boosting, filtering) to
//! recommendation queries without the core knowing anything about them. The
//! model stores the provider and hands it back to the request handler; the
//! core itself only ever sees the plain rescore closures in
//! [`crate::topn`].

/// Adjusts a candidate's raw similarity score, or excludes it.
pub trait Rescorer: Send + Sync {
    /// New score for the item, or `None` to drop it from the results.
    fn rescore(&self, item_id: &str, score: f64) -> Option<f64>;
}

/// Builds a [`Rescorer`] for one request from its query arguments.
pub trait RescorerProvider: Send + Sync {
    /// `None` means no rescoring applies to this request.
    fn rescorer(&self, args: &[&str]) -> Option<Box<dyn Rescorer>>;
}
