//! Health store abstraction.
//!
//! The platform health store is an external collaborator: it owns the samples,
//! answers queries, and pushes "new data available" notifications. This module
//! defines the contract the pipeline consumes, plus an in-process
//! implementation used by the CLI's simulated feed and by tests.

pub mod memory;
pub mod types;

use async_trait::async_trait;
use std::collections::BTreeSet;

// Re-export commonly used types
pub use memory::{AuthorizationPolicy, InMemorySampleStore};
pub use types::{
    Acknowledgement, Anchor, AnchoredBatch, AnchoredQuery, AuthorizationStatus,
    ChangeNotification, ChangeSubscription, QuantitySample, SamplePredicate, SampleQuery,
    SampleType, SampleUnit, SortOrder, Statistic, StoreError, UpdateFrequency,
};

/// Query and observation capabilities of a health data store.
#[async_trait]
pub trait SampleStore: Send + Sync + 'static {
    /// Prompt for read access to `types` as a single request.
    ///
    /// Returns `Ok(true)` only if every type in the set was granted.
    async fn request_authorization(&self, types: &BTreeSet<SampleType>) -> Result<bool, StoreError>;

    /// Current read access for one type.
    fn authorization_status(&self, sample_type: SampleType) -> AuthorizationStatus;

    /// Reduce all matching samples to a scalar. `None` if nothing matched.
    async fn statistic(
        &self,
        sample_type: SampleType,
        statistic: Statistic,
        predicate: &SamplePredicate,
    ) -> Result<Option<f64>, StoreError>;

    /// Sorted bulk query.
    async fn samples(&self, query: &SampleQuery) -> Result<Vec<QuantitySample>, StoreError>;

    /// Samples added and deleted since `query.anchor`.
    async fn anchored_samples(&self, query: &AnchoredQuery) -> Result<AnchoredBatch, StoreError>;

    /// Register a persistent change observer for one type.
    fn subscribe(&self, sample_type: SampleType) -> Result<ChangeSubscription, StoreError>;

    /// Ask the store to keep delivering notifications while the agent is backgrounded.
    async fn enable_background_delivery(
        &self,
        sample_type: SampleType,
        frequency: UpdateFrequency,
    ) -> Result<(), StoreError>;
}
