//! Change observation and fetching per sample type.
//!
//! Each observed type gets one worker task that owns the type's aggregate.
//! The worker waits for change notifications, fetches, republishes, and
//! acknowledges the notification on every path. Notifications for a type are
//! handled one at a time, so fetches for the same type never overlap and the
//! anchor has a single writer.
//!
//! ```text
//! Unregistered ──observe()──▶ Observing ──notification──▶ Fetching
//!                                 ▲                          │
//!                                 └──────── ack ─────────────┘
//! ```

use crate::anchor::{AnchorError, AnchorLedger};
use crate::core::Aggregator;
use crate::forward::SyncForwarder;
use crate::state::{StatePublisher, StateUpdate};
use crate::store::{
    Anchor, AnchoredBatch, AnchoredQuery, ChangeSubscription, SamplePredicate, SampleQuery,
    SampleStore, SampleType, SortOrder, StoreError, UpdateFrequency,
};
use crate::transparency::SharedTransparencyLog;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// How a type is re-read after a change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStrategy {
    /// Re-query the whole sorted result set every time.
    BulkResync {
        sort: SortOrder,
        limit: Option<usize>,
    },
    /// Query only what changed since the stored anchor.
    Anchored { limit: Option<usize> },
}

impl FetchStrategy {
    /// Every sample, oldest first.
    pub fn bulk_all() -> Self {
        FetchStrategy::BulkResync {
            sort: SortOrder::Ascending,
            limit: None,
        }
    }

    /// The `limit` most recent samples, newest first.
    pub fn bulk_recent(limit: usize) -> Self {
        FetchStrategy::BulkResync {
            sort: SortOrder::Descending,
            limit: Some(limit),
        }
    }

    pub fn anchored() -> Self {
        FetchStrategy::Anchored { limit: None }
    }
}

/// Lifecycle of one observed type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Unregistered,
    Observing,
    Fetching,
}

/// Outcome of [`ObservationController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Started,
    AlreadyObserving,
}

/// Errors raised while registering or fetching.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ObserveError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Anchor(#[from] AnchorError),
}

struct Observer {
    state: Arc<Mutex<ObserverState>>,
    task: JoinHandle<()>,
}

/// Registers observers and runs one worker per observed type.
pub struct ObservationController<S> {
    store: Arc<S>,
    publisher: StatePublisher,
    anchors: Arc<AnchorLedger>,
    log: SharedTransparencyLog,
    forwarder: Option<Arc<SyncForwarder>>,
    frequency: UpdateFrequency,
    heart_rate_window: usize,
    observers: Mutex<HashMap<SampleType, Observer>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: SampleStore> ObservationController<S> {
    pub fn new(
        store: Arc<S>,
        publisher: StatePublisher,
        anchors: Arc<AnchorLedger>,
        log: SharedTransparencyLog,
    ) -> Self {
        Self {
            store,
            publisher,
            anchors,
            log,
            forwarder: None,
            frequency: UpdateFrequency::Immediate,
            heart_rate_window: crate::core::HEART_RATE_WINDOW,
            observers: Mutex::new(HashMap::new()),
        }
    }

    /// Forward step samples to a collector after each fetch.
    pub fn with_forwarder(mut self, forwarder: Arc<SyncForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    /// Background delivery frequency requested on registration.
    pub fn with_frequency(mut self, frequency: UpdateFrequency) -> Self {
        self.frequency = frequency;
        self
    }

    /// Number of heart rate samples kept.
    pub fn with_heart_rate_window(mut self, window: usize) -> Self {
        self.heart_rate_window = window;
        self
    }

    /// Start observing `sample_type`.
    ///
    /// Registers exactly one change subscription per type; later calls return
    /// [`Registration::AlreadyObserving`] without touching the store.
    pub async fn observe(
        &self,
        sample_type: SampleType,
        strategy: FetchStrategy,
    ) -> Result<Registration, ObserveError> {
        {
            let mut observers = lock(&self.observers);
            if observers.contains_key(&sample_type) {
                return Ok(Registration::AlreadyObserving);
            }

            let subscription = self.store.subscribe(sample_type)?;
            let state = Arc::new(Mutex::new(ObserverState::Observing));
            let worker = ObservationWorker {
                store: Arc::clone(&self.store),
                sample_type,
                strategy,
                aggregator: Aggregator::for_type(sample_type, self.heart_rate_window),
                publisher: self.publisher.clone(),
                anchors: Arc::clone(&self.anchors),
                log: Arc::clone(&self.log),
                forwarder: self.forwarder.clone(),
                state: Arc::clone(&state),
            };
            let task = tokio::spawn(worker.run(subscription));
            observers.insert(sample_type, Observer { state, task });
        }

        tracing::info!(%sample_type, ?strategy, "observing sample type");

        // Observation keeps working in the foreground without background delivery.
        let _ = self.enable_background_delivery(sample_type).await;
        Ok(Registration::Started)
    }

    /// Ask the store to keep waking us for `sample_type` while backgrounded.
    pub async fn enable_background_delivery(&self, sample_type: SampleType) -> Result<(), ObserveError> {
        self.store
            .enable_background_delivery(sample_type, self.frequency)
            .await
            .map_err(|e| {
                tracing::warn!(%sample_type, error = %e, "failed to enable background delivery");
                ObserveError::Store(e)
            })
    }

    pub fn state(&self, sample_type: SampleType) -> ObserverState {
        lock(&self.observers)
            .get(&sample_type)
            .map_or(ObserverState::Unregistered, |o| *lock(&o.state))
    }

    /// Types with a registered observer.
    pub fn observed(&self) -> Vec<SampleType> {
        let mut types: Vec<SampleType> = lock(&self.observers).keys().copied().collect();
        types.sort();
        types
    }

    /// Stop every worker. Used on process teardown.
    pub fn shutdown(&self) {
        for (sample_type, observer) in lock(&self.observers).drain() {
            observer.task.abort();
            tracing::debug!(%sample_type, "observer stopped");
        }
    }
}

/// Task state for one observed type.
struct ObservationWorker<S> {
    store: Arc<S>,
    sample_type: SampleType,
    strategy: FetchStrategy,
    aggregator: Aggregator,
    publisher: StatePublisher,
    anchors: Arc<AnchorLedger>,
    log: SharedTransparencyLog,
    forwarder: Option<Arc<SyncForwarder>>,
    state: Arc<Mutex<ObserverState>>,
}

impl<S: SampleStore> ObservationWorker<S> {
    async fn run(mut self, mut subscription: ChangeSubscription) {
        if matches!(self.strategy, FetchStrategy::Anchored { .. })
            && self.anchors.get(self.sample_type).is_some()
        {
            self.seed().await;
        }

        // The store reports current data once when an observer is registered.
        self.fetch().await;

        while let Some(event) = subscription.next().await {
            match event {
                Ok(notification) => {
                    self.log.record_notification();
                    self.fetch().await;
                    notification.complete();
                    self.log.record_acknowledgement();
                }
                Err(e) => {
                    tracing::warn!(sample_type = %self.sample_type, error = %e, "observer reported an error");
                }
            }
        }

        tracing::debug!(sample_type = %self.sample_type, "change subscription closed");
    }

    /// Fetch once, logging instead of propagating failures.
    async fn fetch(&mut self) {
        self.set_state(ObserverState::Fetching);
        match self.sync().await {
            Ok(read) => {
                tracing::debug!(sample_type = %self.sample_type, read, "fetch completed");
                self.log.record_fetch(self.sample_type, read);
            }
            Err(e) => {
                tracing::warn!(sample_type = %self.sample_type, error = %e, "fetch failed");
                self.log.record_fetch_failure();
            }
        }
        self.set_state(ObserverState::Observing);
    }

    fn set_state(&self, state: ObserverState) {
        *lock(&self.state) = state;
    }

    /// Fill a fresh aggregate with current data before resuming from a stored
    /// anchor, which only yields changes made after the previous run.
    async fn seed(&mut self) {
        let (sort, limit) = match &self.aggregator {
            Aggregator::Steps(_) => (SortOrder::Ascending, None),
            Aggregator::HeartRate(window) => (SortOrder::Descending, Some(window.capacity())),
        };
        let query = SampleQuery {
            sample_type: self.sample_type,
            predicate: SamplePredicate::all(),
            sort,
            limit,
        };

        match self.store.samples(&query).await {
            Ok(samples) => {
                tracing::debug!(sample_type = %self.sample_type, read = samples.len(), "seeded from current data");
                self.aggregator.replace(samples);
                self.publisher.publish(self.update());
            }
            Err(e) => {
                tracing::warn!(sample_type = %self.sample_type, error = %e, "could not seed before resuming");
            }
        }
    }

    async fn anchored_query(
        &self,
        anchor: Option<Anchor>,
        limit: Option<usize>,
    ) -> Result<AnchoredBatch, ObserveError> {
        let query = AnchoredQuery {
            sample_type: self.sample_type,
            predicate: SamplePredicate::all(),
            anchor,
            limit,
        };
        Ok(self.store.anchored_samples(&query).await?)
    }

    /// Returns the number of samples read.
    async fn sync(&mut self) -> Result<u64, ObserveError> {
        let (read, outgoing) = match self.strategy {
            FetchStrategy::BulkResync { sort, limit } => {
                let query = SampleQuery {
                    sample_type: self.sample_type,
                    predicate: SamplePredicate::all(),
                    sort,
                    limit,
                };
                let samples = self.store.samples(&query).await?;
                let read = samples.len();
                self.aggregator.replace(samples);
                (read, self.aggregator.samples().to_vec())
            }
            FetchStrategy::Anchored { limit } => {
                let prior = self.anchors.get(self.sample_type);
                let batch = self.anchored_query(prior, limit).await?;

                match self.anchors.advance(self.sample_type, prior, batch.anchor) {
                    Ok(()) => {
                        let read = batch.added.len();
                        let outgoing = batch.added.clone();
                        self.aggregator.apply_delta(batch.added, &batch.deleted);
                        (read, outgoing)
                    }
                    Err(AnchorError::Regression {
                        current, proposed, ..
                    }) => {
                        // The store's positions restarted behind the stored anchor.
                        tracing::warn!(
                            sample_type = %self.sample_type,
                            %current,
                            %proposed,
                            "store is behind the stored anchor; resyncing from the beginning"
                        );
                        self.anchors.reset(self.sample_type);
                        let batch = self.anchored_query(None, limit).await?;
                        self.anchors.advance(self.sample_type, None, batch.anchor)?;

                        let read = batch.added.len();
                        let outgoing = batch.added.clone();
                        self.aggregator.replace(batch.added);
                        (read, outgoing)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        self.publisher.publish(self.update());

        if self.sample_type == SampleType::StepCount && !outgoing.is_empty() {
            if let Some(ref forwarder) = self.forwarder {
                forwarder.forward(outgoing);
            }
        }

        Ok(read as u64)
    }

    fn update(&self) -> StateUpdate {
        match &self.aggregator {
            Aggregator::Steps(steps) => StateUpdate::Steps {
                total: steps.total(),
                samples: steps.samples().to_vec(),
            },
            Aggregator::HeartRate(window) => StateUpdate::HeartRate {
                samples: window.samples().to_vec(),
            },
        }
    }
}

impl<S> Drop for ObservationController<S> {
    fn drop(&mut self) {
        for observer in lock(&self.observers).values() {
            observer.task.abort();
        }
    }
}
