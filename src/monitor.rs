//! Per-type monitors.
//!
//! A monitor composes the authorization gate and the observation controller
//! for the sample types it owns: authorizing starts observation, and
//! background delivery can be re-requested at any time.

use crate::auth::{AuthError, AuthorizationGate, Grant};
use crate::observe::{FetchStrategy, ObservationController, ObserveError, Registration};
use crate::store::{SampleStore, SampleType};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Errors from a monitor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Authorization(#[from] AuthError),

    #[error(transparent)]
    Observation(#[from] ObserveError),
}

/// Capabilities every monitor provides.
#[async_trait]
pub trait HealthMonitor: Send + Sync {
    /// Name used in logs and CLI output.
    fn name(&self) -> &'static str;

    /// Types this monitor reads.
    fn sample_types(&self) -> BTreeSet<SampleType>;

    /// Request read access and, once granted, start observing.
    async fn request_authorization(&self) -> Result<Grant, MonitorError>;

    /// Re-request background delivery for every owned type.
    async fn enable_background_delivery(&self) -> Result<(), MonitorError>;
}

/// Shared implementation: one gate, one controller, a strategy per type.
struct Monitor<S> {
    gate: Arc<AuthorizationGate<S>>,
    controller: Arc<ObservationController<S>>,
    strategies: Vec<(SampleType, FetchStrategy)>,
}

impl<S: SampleStore> Monitor<S> {
    fn sample_types(&self) -> BTreeSet<SampleType> {
        self.strategies.iter().map(|(t, _)| *t).collect()
    }

    async fn request_authorization(&self) -> Result<Grant, MonitorError> {
        let grant = self.gate.request(&self.sample_types()).await?;

        for (sample_type, strategy) in &self.strategies {
            if self.controller.observe(*sample_type, *strategy).await? == Registration::Started {
                tracing::debug!(%sample_type, "observer registered after authorization");
            }
        }
        Ok(grant)
    }

    async fn enable_background_delivery(&self) -> Result<(), MonitorError> {
        for (sample_type, _) in &self.strategies {
            self.controller.enable_background_delivery(*sample_type).await?;
        }
        Ok(())
    }
}

/// Step count monitor. Steps are always re-read in full so the total
/// corrects itself when samples are deleted.
pub struct ActivityMonitor<S> {
    inner: Monitor<S>,
}

impl<S: SampleStore> ActivityMonitor<S> {
    pub fn new(gate: Arc<AuthorizationGate<S>>, controller: Arc<ObservationController<S>>) -> Self {
        Self {
            inner: Monitor {
                gate,
                controller,
                strategies: vec![(SampleType::StepCount, FetchStrategy::bulk_all())],
            },
        }
    }
}

#[async_trait]
impl<S: SampleStore> HealthMonitor for ActivityMonitor<S> {
    fn name(&self) -> &'static str {
        "activity"
    }

    fn sample_types(&self) -> BTreeSet<SampleType> {
        self.inner.sample_types()
    }

    async fn request_authorization(&self) -> Result<Grant, MonitorError> {
        self.inner.request_authorization().await
    }

    async fn enable_background_delivery(&self) -> Result<(), MonitorError> {
        self.inner.enable_background_delivery().await
    }
}

/// Heart rate monitor.
pub struct HeartMonitor<S> {
    inner: Monitor<S>,
}

impl<S: SampleStore> HeartMonitor<S> {
    /// `strategy` is the single path heart rate is read through.
    pub fn new(
        gate: Arc<AuthorizationGate<S>>,
        controller: Arc<ObservationController<S>>,
        strategy: FetchStrategy,
    ) -> Self {
        Self {
            inner: Monitor {
                gate,
                controller,
                strategies: vec![(SampleType::HeartRate, strategy)],
            },
        }
    }
}

#[async_trait]
impl<S: SampleStore> HealthMonitor for HeartMonitor<S> {
    fn name(&self) -> &'static str {
        "heart"
    }

    fn sample_types(&self) -> BTreeSet<SampleType> {
        self.inner.sample_types()
    }

    async fn request_authorization(&self) -> Result<Grant, MonitorError> {
        self.inner.request_authorization().await
    }

    async fn enable_background_delivery(&self) -> Result<(), MonitorError> {
        self.inner.enable_background_delivery().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::AnchorLedger;
    use crate::observe::ObserverState;
    use crate::state::StateSink;
    use crate::store::{AuthorizationPolicy, InMemorySampleStore, StoreError, UpdateFrequency};
    use crate::transparency::create_shared_log;

    fn parts(
        policy: AuthorizationPolicy,
    ) -> (
        Arc<InMemorySampleStore>,
        Arc<AuthorizationGate<InMemorySampleStore>>,
        Arc<ObservationController<InMemorySampleStore>>,
        StateSink,
    ) {
        let store = Arc::new(InMemorySampleStore::new(policy));
        let (sink, _handle) = StateSink::spawn();
        let gate = Arc::new(AuthorizationGate::new(store.clone()));
        let controller = Arc::new(
            ObservationController::new(
                store.clone(),
                sink.publisher(),
                Arc::new(AnchorLedger::new()),
                create_shared_log(),
            )
            .with_frequency(UpdateFrequency::Hourly),
        );
        (store, gate, controller, sink)
    }

    #[tokio::test]
    async fn test_authorization_starts_observation_once() {
        let (store, gate, controller, _sink) = parts(AuthorizationPolicy::GrantAll);
        let monitor = ActivityMonitor::new(gate, controller.clone());

        monitor.request_authorization().await.unwrap();
        let again = monitor.request_authorization().await.unwrap();

        assert!(!again.prompted);
        assert_eq!(store.authorization_prompts(), 1);
        assert_eq!(store.subscription_count(SampleType::StepCount), 1);
        assert_eq!(
            store.background_delivery(SampleType::StepCount),
            Some(UpdateFrequency::Hourly)
        );
        assert_ne!(controller.state(SampleType::StepCount), ObserverState::Unregistered);
    }

    #[tokio::test]
    async fn test_monitors_share_a_controller() {
        let (store, gate, controller, _sink) = parts(AuthorizationPolicy::GrantAll);
        let activity = ActivityMonitor::new(gate.clone(), controller.clone());
        let heart = HeartMonitor::new(gate, controller.clone(), FetchStrategy::anchored());

        activity.request_authorization().await.unwrap();
        heart.request_authorization().await.unwrap();

        assert_eq!(store.authorization_prompts(), 2);
        assert_eq!(
            controller.observed(),
            vec![SampleType::StepCount, SampleType::HeartRate]
        );
        assert_eq!(heart.name(), "heart");
        assert_eq!(heart.sample_types(), [SampleType::HeartRate].into_iter().collect());
    }

    #[tokio::test]
    async fn test_denied_authorization_never_observes() {
        let (store, gate, controller, sink) = parts(AuthorizationPolicy::DenyAll);
        let monitor = HeartMonitor::new(gate, controller.clone(), FetchStrategy::anchored());

        let err = monitor.request_authorization().await.unwrap_err();
        assert!(matches!(err, MonitorError::Authorization(AuthError::Denied(_))));
        assert_eq!(store.subscription_count(SampleType::HeartRate), 0);
        assert_eq!(controller.state(SampleType::HeartRate), ObserverState::Unregistered);
        assert!(sink.current().heart_rate_samples.is_empty());
    }

    #[tokio::test]
    async fn test_background_delivery_requires_access() {
        let (_store, gate, controller, _sink) = parts(AuthorizationPolicy::GrantAll);
        let monitor = ActivityMonitor::new(gate, controller);

        let err = monitor.enable_background_delivery().await.unwrap_err();
        assert!(matches!(
            err,
            MonitorError::Observation(ObserveError::Store(StoreError::BackgroundDelivery { .. }))
        ));

        monitor.request_authorization().await.unwrap();
        monitor.enable_background_delivery().await.unwrap();
    }
}
