//! Composition root.
//!
//! [`SyncAgent`] wires the store, authorization, observation, forwarding and
//! published state together from a [`Config`].

use crate::anchor::AnchorLedger;
use crate::auth::AuthorizationGate;
use crate::config::Config;
use crate::error::SyncError;
use crate::forward::{ForwardError, ForwardReceipt, SyncForwarder};
use crate::monitor::{ActivityMonitor, HealthMonitor, HeartMonitor, MonitorError};
use crate::observe::ObservationController;
use crate::state::{HealthState, StateSink};
use crate::store::{SamplePredicate, SampleStore, SampleType, Statistic};
use crate::transparency::{create_shared_log_with_persistence, SharedTransparencyLog};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Outcome of [`SyncAgent::start`].
#[derive(Debug, Default)]
pub struct StartReport {
    /// Monitors that were granted access and are observing
    pub granted: Vec<&'static str>,
    /// Monitors that could not start, with the reason
    pub denied: Vec<(&'static str, MonitorError)>,
}

impl StartReport {
    pub fn all_granted(&self) -> bool {
        self.denied.is_empty()
    }
}

/// Health sync agent.
///
/// Must be created inside a tokio runtime.
pub struct SyncAgent<S: SampleStore> {
    store: Arc<S>,
    sink: StateSink,
    sink_task: JoinHandle<()>,
    anchors: Arc<AnchorLedger>,
    log: SharedTransparencyLog,
    forwarder: Option<Arc<SyncForwarder>>,
    controller: Arc<ObservationController<S>>,
    monitors: Vec<Box<dyn HealthMonitor>>,
}

impl<S: SampleStore> SyncAgent<S> {
    /// Build an agent over `store`.
    pub fn new(store: Arc<S>, config: &Config) -> Result<Self, SyncError> {
        config.validate()?;

        let (sink, sink_task) = StateSink::spawn();
        let anchors = Arc::new(if config.persist_anchors {
            AnchorLedger::with_persistence(config.anchors_path())
        } else {
            AnchorLedger::new()
        });
        let log = create_shared_log_with_persistence(config.transparency_path());

        let forwarder = if config.collector.enabled {
            let collector = config.collector.collector_config()?;
            Some(Arc::new(SyncForwarder::new(collector)?.with_log(Arc::clone(&log))))
        } else {
            None
        };

        let mut controller = ObservationController::new(
            Arc::clone(&store),
            sink.publisher(),
            Arc::clone(&anchors),
            Arc::clone(&log),
        )
        .with_frequency(config.background_frequency)
        .with_heart_rate_window(config.heart_rate_window);
        if let Some(ref forwarder) = forwarder {
            controller = controller.with_forwarder(Arc::clone(forwarder));
        }
        let controller = Arc::new(controller);

        let gate = Arc::new(AuthorizationGate::new(Arc::clone(&store)));
        let mut monitors: Vec<Box<dyn HealthMonitor>> = Vec::new();
        if config.sources.steps {
            monitors.push(Box::new(ActivityMonitor::new(
                Arc::clone(&gate),
                Arc::clone(&controller),
            )));
        }
        if config.sources.heart_rate {
            monitors.push(Box::new(HeartMonitor::new(
                Arc::clone(&gate),
                Arc::clone(&controller),
                config.heart_rate_fetch_strategy(),
            )));
        }

        Ok(Self {
            store,
            sink,
            sink_task,
            anchors,
            log,
            forwarder,
            controller,
            monitors,
        })
    }

    /// Authorize every monitor and start observing what was granted.
    ///
    /// A denied monitor does not stop the others; its state keeps its defaults.
    pub async fn start(&self) -> StartReport {
        let mut report = StartReport::default();

        for monitor in &self.monitors {
            match monitor.request_authorization().await {
                Ok(grant) => {
                    tracing::info!(
                        monitor = monitor.name(),
                        prompted = grant.prompted,
                        "monitor authorized"
                    );
                    report.granted.push(monitor.name());
                }
                Err(e) => {
                    tracing::warn!(monitor = monitor.name(), error = %e, "monitor not started");
                    report.denied.push((monitor.name(), e));
                }
            }
        }

        report
    }

    /// Re-request background delivery for every authorized monitor.
    pub async fn enable_background_delivery(&self) -> Result<(), SyncError> {
        for monitor in &self.monitors {
            monitor.enable_background_delivery().await?;
        }
        Ok(())
    }

    pub fn monitor_names(&self) -> Vec<&'static str> {
        self.monitors.iter().map(|m| m.name()).collect()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.sink.subscribe()
    }

    /// Copy of the current state.
    pub fn state(&self) -> HealthState {
        self.sink.current()
    }

    /// Store-computed sum of every step sample.
    pub async fn step_total_statistic(&self) -> Result<f64, SyncError> {
        let total = self
            .store
            .statistic(
                SampleType::StepCount,
                Statistic::CumulativeSum,
                &SamplePredicate::all(),
            )
            .await?;
        Ok(total.unwrap_or(0.0))
    }

    /// Send the current step total to the collector as a single number.
    pub async fn send_step_total(&self) -> Result<ForwardReceipt, SyncError> {
        let forwarder = self
            .forwarder
            .as_ref()
            .ok_or_else(|| ForwardError::Config("collector forwarding is disabled".to_string()))?;
        let total = self.step_total_statistic().await?;
        Ok(forwarder.send_total(total).await?)
    }

    pub fn log(&self) -> &SharedTransparencyLog {
        &self.log
    }

    pub fn anchors(&self) -> &Arc<AnchorLedger> {
        &self.anchors
    }

    pub fn controller(&self) -> &Arc<ObservationController<S>> {
        &self.controller
    }

    /// Stop observing and persist anchors and stats.
    pub fn shutdown(&self) {
        self.controller.shutdown();

        if let Err(e) = self.anchors.save() {
            tracing::warn!(error = %e, "could not save anchors");
        }
        if let Err(e) = self.log.save() {
            tracing::warn!(error = %e, "could not save transparency stats");
        }
        tracing::info!("sync agent stopped");
    }
}

impl<S: SampleStore> Drop for SyncAgent<S> {
    fn drop(&mut self) {
        self.sink_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SourceConfig, StrategyKind};
    use crate::observe::ObserverState;
    use crate::store::{AuthorizationPolicy, InMemorySampleStore, QuantitySample};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn config(dir: &tempfile::TempDir) -> Config {
        Config {
            data_path: dir.path().to_path_buf(),
            ..Config::default()
        }
    }

    fn steps(value: f64, minutes_ago: i64) -> QuantitySample {
        let start = Utc::now() - ChronoDuration::minutes(minutes_ago + 1);
        QuantitySample::new(SampleType::StepCount, value, start, start + ChronoDuration::minutes(1))
    }

    #[tokio::test]
    async fn test_start_observes_configured_sources() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemorySampleStore::default());
        let agent = SyncAgent::new(store.clone(), &config(&dir)).unwrap();

        let report = agent.start().await;
        assert!(report.all_granted());
        assert_eq!(report.granted, vec!["activity", "heart"]);
        assert_eq!(
            agent.controller().observed(),
            vec![SampleType::StepCount, SampleType::HeartRate]
        );

        store.insert([steps(40.0, 3), steps(2.0, 1)]);
        let mut rx = agent.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|s| s.step_count == 42.0))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(agent.step_total_statistic().await.unwrap(), 42.0);
    }

    #[tokio::test]
    async fn test_step_statistic_counts_every_sample() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemorySampleStore::default());
        let agent = SyncAgent::new(store.clone(), &config(&dir)).unwrap();
        agent.start().await;
        assert_eq!(agent.step_total_statistic().await.unwrap(), 0.0);

        // A sample still in progress ends after now.
        let start = Utc::now() - ChronoDuration::minutes(1);
        store.insert([
            steps(15.0, 3),
            QuantitySample::new(SampleType::StepCount, 5.0, start, start + ChronoDuration::minutes(10)),
        ]);
        assert_eq!(agent.step_total_statistic().await.unwrap(), 20.0);
    }

    #[tokio::test]
    async fn test_only_selected_sources_get_monitors() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.sources = SourceConfig::from_csv("heart_rate");
        config.heart_rate_strategy = StrategyKind::Bulk;

        let agent = SyncAgent::new(Arc::new(InMemorySampleStore::default()), &config).unwrap();
        assert_eq!(agent.monitor_names(), vec!["heart"]);

        agent.start().await;
        assert_eq!(
            agent.controller().state(SampleType::StepCount),
            ObserverState::Unregistered
        );
    }

    #[tokio::test]
    async fn test_denied_start_keeps_default_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemorySampleStore::new(AuthorizationPolicy::DenyAll));
        let agent = SyncAgent::new(store.clone(), &config(&dir)).unwrap();

        let report = agent.start().await;
        assert!(report.granted.is_empty());
        assert_eq!(report.denied.len(), 2);
        assert_eq!(agent.state(), HealthState::default());
        assert_eq!(store.subscription_count(SampleType::StepCount), 0);
    }

    #[tokio::test]
    async fn test_send_total_requires_collector() {
        let dir = tempfile::tempdir().unwrap();
        let agent = SyncAgent::new(Arc::new(InMemorySampleStore::default()), &config(&dir)).unwrap();

        let err = agent.send_step_total().await.unwrap_err();
        assert!(matches!(err, SyncError::Forward(ForwardError::Config(_))));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.collector.timezone = "Nowhere/Special".to_string();

        let result = SyncAgent::new(Arc::new(InMemorySampleStore::default()), &config);
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_shutdown_persists_anchors() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(&dir);
        let store = Arc::new(InMemorySampleStore::default());
        let agent = SyncAgent::new(store, &config).unwrap();

        agent.start().await;
        for _ in 0..200 {
            if agent.anchors().get(SampleType::HeartRate).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        agent.shutdown();

        assert!(config.anchors_path().exists());
        assert!(config.transparency_path().exists());
        let reloaded = AnchorLedger::with_persistence(config.anchors_path());
        assert!(reloaded.get(SampleType::HeartRate).is_some());
    }
}
