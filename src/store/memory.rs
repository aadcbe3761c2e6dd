//! In-process health store.
//!
//! Keeps samples in memory and assigns every insertion and deletion a
//! monotonically increasing position, which doubles as the anchor for
//! incremental queries. Used by the simulated feed of the CLI and by tests,
//! which can also inject failures and latency.

use crate::store::types::{
    Anchor, AnchoredBatch, AnchoredQuery, AuthorizationStatus, ChangeNotification,
    ChangeSubscription, NotificationSender, QuantitySample, SamplePredicate, SampleQuery,
    SampleType, SortOrder, Statistic, StoreError, UpdateFrequency,
};
use crate::store::SampleStore;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// How the store answers authorization prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    GrantAll,
    DenyAll,
    /// The prompt itself fails with the given message
    Fail(String),
}

#[derive(Debug)]
struct Entry {
    position: u64,
    sample: QuantitySample,
}

#[derive(Debug)]
struct Deletion {
    position: u64,
    id: Uuid,
    sample_type: SampleType,
}

#[derive(Debug)]
struct Inner {
    next_position: u64,
    entries: Vec<Entry>,
    deletions: Vec<Deletion>,
    policy: AuthorizationPolicy,
    status: HashMap<SampleType, AuthorizationStatus>,
    prompts: usize,
    subscribers: HashMap<SampleType, Vec<NotificationSender>>,
    subscriptions: HashMap<SampleType, usize>,
    background: HashMap<SampleType, UpdateFrequency>,
    pending_acks: Vec<oneshot::Receiver<()>>,
    failing_queries: usize,
    latency: Option<Duration>,
}

impl Inner {
    fn head(&self) -> Anchor {
        Anchor::from_raw(self.next_position - 1)
    }

    fn ensure_authorized(&self, sample_type: SampleType) -> Result<(), StoreError> {
        match self.status.get(&sample_type) {
            Some(AuthorizationStatus::Granted) => Ok(()),
            _ => Err(StoreError::NotAuthorized(sample_type)),
        }
    }

    fn take_injected_failure(&mut self) -> Result<(), StoreError> {
        if self.failing_queries > 0 {
            self.failing_queries -= 1;
            return Err(StoreError::Query("injected failure".to_string()));
        }
        Ok(())
    }

    fn notify(&mut self, sample_type: SampleType) {
        let Some(senders) = self.subscribers.get_mut(&sample_type) else {
            return;
        };

        let mut acks = Vec::new();
        senders.retain(|sender| {
            let (notification, ack) = ChangeNotification::new(sample_type);
            if sender.send(Ok(notification)).is_ok() {
                acks.push(ack);
                true
            } else {
                false
            }
        });
        self.pending_acks.extend(acks);
    }
}

/// A health store backed by memory.
#[derive(Debug)]
pub struct InMemorySampleStore {
    inner: Mutex<Inner>,
}

impl InMemorySampleStore {
    /// Create an empty store answering prompts with `policy`.
    pub fn new(policy: AuthorizationPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_position: 1,
                entries: Vec::new(),
                deletions: Vec::new(),
                policy,
                status: HashMap::new(),
                prompts: 0,
                subscribers: HashMap::new(),
                subscriptions: HashMap::new(),
                background: HashMap::new(),
                pending_acks: Vec::new(),
                failing_queries: 0,
                latency: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add samples and notify observers of every affected type.
    pub fn insert(&self, samples: impl IntoIterator<Item = QuantitySample>) {
        let mut inner = self.lock();
        let mut touched = BTreeSet::new();

        for sample in samples {
            touched.insert(sample.sample_type());
            let position = inner.next_position;
            inner.next_position += 1;
            inner.entries.push(Entry { position, sample });
        }

        for sample_type in touched {
            inner.notify(sample_type);
        }
    }

    /// Remove samples by id and notify observers of every affected type.
    pub fn delete(&self, ids: &[Uuid]) {
        let mut inner = self.lock();
        let mut touched = BTreeSet::new();

        for id in ids {
            let Some(index) = inner.entries.iter().position(|e| e.sample.id() == *id) else {
                continue;
            };
            let removed = inner.entries.remove(index);
            let sample_type = removed.sample.sample_type();
            touched.insert(sample_type);

            let position = inner.next_position;
            inner.next_position += 1;
            inner.deletions.push(Deletion {
                position,
                id: *id,
                sample_type,
            });
        }

        for sample_type in touched {
            inner.notify(sample_type);
        }
    }

    /// Push a change notification without modifying data.
    pub fn notify(&self, sample_type: SampleType) {
        self.lock().notify(sample_type);
    }

    /// Deliver an observer error to every subscriber of `sample_type`.
    pub fn notify_error(&self, sample_type: SampleType, message: &str) {
        if let Some(senders) = self.lock().subscribers.get(&sample_type) {
            for sender in senders {
                let _ = sender.send(Err(StoreError::Observer(message.to_string())));
            }
        }
    }

    /// Drop every subscription so observers see their stream end.
    pub fn close_subscriptions(&self) {
        self.lock().subscribers.clear();
    }

    pub fn set_policy(&self, policy: AuthorizationPolicy) {
        self.lock().policy = policy;
    }

    /// Make the next `count` queries fail.
    pub fn fail_next_queries(&self, count: usize) {
        self.lock().failing_queries = count;
    }

    /// Delay every query by `latency`.
    pub fn set_query_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// Number of observers ever registered for a type.
    pub fn subscription_count(&self, sample_type: SampleType) -> usize {
        self.lock()
            .subscriptions
            .get(&sample_type)
            .copied()
            .unwrap_or(0)
    }

    /// Number of authorization prompts shown so far.
    pub fn authorization_prompts(&self) -> usize {
        self.lock().prompts
    }

    /// Background delivery frequency enabled for a type, if any.
    pub fn background_delivery(&self, sample_type: SampleType) -> Option<UpdateFrequency> {
        self.lock().background.get(&sample_type).copied()
    }

    /// Notifications delivered but not yet acknowledged.
    pub fn unacknowledged(&self) -> usize {
        let mut inner = self.lock();
        inner
            .pending_acks
            .retain_mut(|ack| matches!(ack.try_recv(), Err(oneshot::error::TryRecvError::Empty)));
        inner.pending_acks.len()
    }

    /// Current position of the store, i.e. the anchor a full anchored query would return.
    pub fn head(&self) -> Anchor {
        self.lock().head()
    }

    async fn simulate_latency(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

impl Default for InMemorySampleStore {
    fn default() -> Self {
        Self::new(AuthorizationPolicy::GrantAll)
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn request_authorization(&self, types: &BTreeSet<SampleType>) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        inner.prompts += 1;

        let status = match &inner.policy {
            AuthorizationPolicy::GrantAll => AuthorizationStatus::Granted,
            AuthorizationPolicy::DenyAll => AuthorizationStatus::Denied,
            AuthorizationPolicy::Fail(message) => {
                return Err(StoreError::Authorization(message.clone()));
            }
        };

        for sample_type in types {
            inner.status.insert(*sample_type, status);
        }
        Ok(status == AuthorizationStatus::Granted)
    }

    fn authorization_status(&self, sample_type: SampleType) -> AuthorizationStatus {
        self.lock()
            .status
            .get(&sample_type)
            .copied()
            .unwrap_or(AuthorizationStatus::Undetermined)
    }

    async fn statistic(
        &self,
        sample_type: SampleType,
        statistic: Statistic,
        predicate: &SamplePredicate,
    ) -> Result<Option<f64>, StoreError> {
        self.simulate_latency().await;

        let mut inner = self.lock();
        inner.ensure_authorized(sample_type)?;
        inner.take_injected_failure()?;

        let values: Vec<f64> = inner
            .entries
            .iter()
            .map(|e| &e.sample)
            .filter(|s| s.sample_type() == sample_type && predicate.matches(s))
            .map(QuantitySample::value)
            .collect();

        if values.is_empty() {
            return Ok(None);
        }

        let result: f64 = match statistic {
            Statistic::CumulativeSum => values.iter().sum(),
            Statistic::Average => values.iter().sum::<f64>() / values.len() as f64,
            Statistic::Minimum => values.iter().copied().fold(f64::INFINITY, f64::min),
            Statistic::Maximum => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        };
        Ok(Some(result))
    }

    async fn samples(&self, query: &SampleQuery) -> Result<Vec<QuantitySample>, StoreError> {
        self.simulate_latency().await;

        let mut inner = self.lock();
        inner.ensure_authorized(query.sample_type)?;
        inner.take_injected_failure()?;

        let mut samples: Vec<QuantitySample> = inner
            .entries
            .iter()
            .map(|e| &e.sample)
            .filter(|s| s.sample_type() == query.sample_type && query.predicate.matches(s))
            .cloned()
            .collect();

        samples.sort_by_key(QuantitySample::start);
        if query.sort == SortOrder::Descending {
            samples.reverse();
        }
        if let Some(limit) = query.limit {
            samples.truncate(limit);
        }
        Ok(samples)
    }

    async fn anchored_samples(&self, query: &AnchoredQuery) -> Result<AnchoredBatch, StoreError> {
        self.simulate_latency().await;

        let mut inner = self.lock();
        inner.ensure_authorized(query.sample_type)?;
        inner.take_injected_failure()?;

        let after = query.anchor.map_or(0, |a| a.as_raw());
        let mut added: Vec<&Entry> = inner
            .entries
            .iter()
            .filter(|e| {
                e.position > after
                    && e.sample.sample_type() == query.sample_type
                    && query.predicate.matches(&e.sample)
            })
            .collect();
        added.sort_by_key(|e| e.position);

        let mut anchor = inner.head();
        if let Some(limit) = query.limit {
            if added.len() > limit {
                added.truncate(limit);
                if let Some(last) = added.last() {
                    anchor = Anchor::from_raw(last.position);
                }
            }
        }

        let deleted = inner
            .deletions
            .iter()
            .filter(|d| {
                d.sample_type == query.sample_type
                    && d.position > after
                    && d.position <= anchor.as_raw()
            })
            .map(|d| d.id)
            .collect();

        Ok(AnchoredBatch {
            added: added.into_iter().map(|e| e.sample.clone()).collect(),
            deleted,
            anchor,
        })
    }

    fn subscribe(&self, sample_type: SampleType) -> Result<ChangeSubscription, StoreError> {
        let mut inner = self.lock();
        inner.ensure_authorized(sample_type)?;

        let (sender, subscription) = ChangeSubscription::channel(sample_type);
        inner.subscribers.entry(sample_type).or_default().push(sender);
        *inner.subscriptions.entry(sample_type).or_default() += 1;
        Ok(subscription)
    }

    async fn enable_background_delivery(
        &self,
        sample_type: SampleType,
        frequency: UpdateFrequency,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.ensure_authorized(sample_type).is_err() {
            return Err(StoreError::BackgroundDelivery {
                sample_type,
                reason: "read access not granted".to_string(),
            });
        }
        inner.background.insert(sample_type, frequency);
        Ok(())
    }
}
