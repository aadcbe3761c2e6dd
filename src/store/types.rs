//! Sample types shared between the health store and the observation pipeline.
//!
//! Samples are immutable once produced by a store. Anchors are opaque cursors
//! that only ever move forward.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Kind of biometric quantity observed from the health store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleType {
    StepCount,
    HeartRate,
}

impl SampleType {
    /// Every type the agent knows how to observe.
    pub const ALL: [SampleType; 2] = [SampleType::StepCount, SampleType::HeartRate];

    /// Unit the values of this type are expressed in.
    pub fn unit(&self) -> SampleUnit {
        match self {
            SampleType::StepCount => SampleUnit::Count,
            SampleType::HeartRate => SampleUnit::CountPerMinute,
        }
    }

    /// Stable identifier used in logs, config and persisted state.
    pub fn identifier(&self) -> &'static str {
        match self {
            SampleType::StepCount => "step_count",
            SampleType::HeartRate => "heart_rate",
        }
    }
}

impl fmt::Display for SampleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

/// Unit of a sample value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleUnit {
    Count,
    CountPerMinute,
}

impl fmt::Display for SampleUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleUnit::Count => f.write_str("count"),
            SampleUnit::CountPerMinute => f.write_str("count/min"),
        }
    }
}

/// A single timestamped measurement.
///
/// Fields are private so a sample cannot be altered after the store hands it out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantitySample {
    id: Uuid,
    sample_type: SampleType,
    value: f64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl QuantitySample {
    /// Create a sample with a freshly generated id.
    pub fn new(sample_type: SampleType, value: f64, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::with_id(Uuid::new_v4(), sample_type, value, start, end)
    }

    /// Create a sample with a known id (e.g. when a store re-delivers one).
    pub fn with_id(
        id: Uuid,
        sample_type: SampleType,
        value: f64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            sample_type,
            value,
            start,
            end,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    /// Value in the unit of [`SampleType::unit`].
    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }
}

/// Opaque cursor marking everything already observed by an anchored query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Anchor(u64);

impl Anchor {
    /// Build an anchor from a store-specific position.
    pub fn from_raw(position: u64) -> Self {
        Self(position)
    }

    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Whether read access was granted for a set of types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Undetermined,
    Granted,
    Denied,
}

/// Sort order by sample start time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Reduction applied by a statistics query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Statistic {
    CumulativeSum,
    Average,
    Minimum,
    Maximum,
}

/// How often the store may wake the agent while it runs in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    Immediate,
    Hourly,
    Daily,
    Weekly,
}

/// Time bounds applied to a query.
///
/// `until` is strict on the end date: a sample matches only if it ended at or
/// before that instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplePredicate {
    pub from: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl SamplePredicate {
    /// Match every sample.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match samples that ended at or before `until`.
    pub fn ending_by(until: DateTime<Utc>) -> Self {
        Self {
            from: None,
            until: Some(until),
        }
    }

    pub fn matches(&self, sample: &QuantitySample) -> bool {
        self.from.map_or(true, |from| sample.start() >= from)
            && self.until.map_or(true, |until| sample.end() <= until)
    }
}

/// A sorted bulk query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleQuery {
    pub sample_type: SampleType,
    pub predicate: SamplePredicate,
    pub sort: SortOrder,
    pub limit: Option<usize>,
}

/// An incremental query relative to a previously returned anchor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredQuery {
    pub sample_type: SampleType,
    pub predicate: SamplePredicate,
    /// `None` starts from the beginning of the store.
    pub anchor: Option<Anchor>,
    pub limit: Option<usize>,
}

/// Result of an anchored query.
#[derive(Debug, Clone, PartialEq)]
pub struct AnchoredBatch {
    /// Samples added since the query anchor
    pub added: Vec<QuantitySample>,
    /// Ids of samples deleted since the query anchor
    pub deleted: Vec<Uuid>,
    /// Anchor to use for the next query
    pub anchor: Anchor,
}

/// Errors reported by a health store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("read access to {0} has not been granted")]
    NotAuthorized(SampleType),

    #[error("query failed: {0}")]
    Query(String),

    #[error("authorization request failed: {0}")]
    Authorization(String),

    #[error("background delivery could not be enabled for {sample_type}: {reason}")]
    BackgroundDelivery {
        sample_type: SampleType,
        reason: String,
    },

    #[error("observer failed: {0}")]
    Observer(String),
}

/// Acknowledgement owed to the store for a change notification.
///
/// Completing it tells the store the new data was processed. If it is dropped
/// without being completed it completes itself and logs a warning, so the store
/// never waits on a notification forever.
#[derive(Debug)]
pub struct Acknowledgement {
    sample_type: SampleType,
    sender: Option<oneshot::Sender<()>>,
}

impl Acknowledgement {
    pub fn new(sample_type: SampleType, sender: oneshot::Sender<()>) -> Self {
        Self {
            sample_type,
            sender: Some(sender),
        }
    }

    /// Mark the notification as processed.
    pub fn complete(mut self) {
        self.send();
    }

    fn send(&mut self) {
        if let Some(sender) = self.sender.take() {
            // The store may have stopped listening; nothing left to tell it.
            let _ = sender.send(());
        }
    }
}

impl Drop for Acknowledgement {
    fn drop(&mut self) {
        if self.sender.is_some() {
            tracing::warn!(
                sample_type = %self.sample_type,
                "change notification dropped without acknowledgement"
            );
            self.send();
        }
    }
}

/// Signal that new data is available for a sample type.
#[derive(Debug)]
pub struct ChangeNotification {
    pub sample_type: SampleType,
    pub acknowledgement: Acknowledgement,
}

impl ChangeNotification {
    /// Create a notification and the receiver the store waits on for its acknowledgement.
    pub fn new(sample_type: SampleType) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let notification = Self {
            sample_type,
            acknowledgement: Acknowledgement::new(sample_type, tx),
        };
        (notification, rx)
    }

    /// Consume the notification, acknowledging it.
    pub fn complete(self) {
        self.acknowledgement.complete();
    }
}

/// Sending half handed to a store so it can push notifications to a subscriber.
pub type NotificationSender = mpsc::UnboundedSender<Result<ChangeNotification, StoreError>>;

/// A persistent subscription to change notifications for one sample type.
#[derive(Debug)]
pub struct ChangeSubscription {
    sample_type: SampleType,
    receiver: mpsc::UnboundedReceiver<Result<ChangeNotification, StoreError>>,
}

impl ChangeSubscription {
    /// Create a subscription and the sender the store uses to feed it.
    pub fn channel(sample_type: SampleType) -> (NotificationSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                sample_type,
                receiver: rx,
            },
        )
    }

    pub fn sample_type(&self) -> SampleType {
        self.sample_type
    }

    /// Wait for the next notification. Returns `None` once the store closes the subscription.
    pub async fn next(&mut self) -> Option<Result<ChangeNotification, StoreError>> {
        self.receiver.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_sample_type_units() {
        assert_eq!(SampleType::StepCount.unit(), SampleUnit::Count);
        assert_eq!(SampleType::HeartRate.unit().to_string(), "count/min");
        assert_eq!(SampleType::HeartRate.to_string(), "heart_rate");
    }

    #[test]
    fn test_predicate_is_strict_on_end_date() {
        let now = Utc::now();
        let predicate = SamplePredicate::ending_by(now);

        let ended = QuantitySample::new(SampleType::HeartRate, 70.0, now - Duration::minutes(1), now);
        let ongoing = QuantitySample::new(
            SampleType::HeartRate,
            70.0,
            now - Duration::minutes(1),
            now + Duration::seconds(1),
        );

        assert!(predicate.matches(&ended));
        assert!(!predicate.matches(&ongoing));
        assert!(SamplePredicate::all().matches(&ongoing));
    }

    #[test]
    fn test_anchor_ordering() {
        assert!(Anchor::from_raw(3) > Anchor::from_raw(2));
        assert_eq!(Anchor::from_raw(7).as_raw(), 7);
    }

    #[tokio::test]
    async fn test_dropped_notification_still_acknowledges() {
        let (notification, rx) = ChangeNotification::new(SampleType::StepCount);
        drop(notification);
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_completed_notification_acknowledges() {
        let (notification, rx) = ChangeNotification::new(SampleType::StepCount);
        notification.complete();
        assert!(rx.await.is_ok());
    }
}
