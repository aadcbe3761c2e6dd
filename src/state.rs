//! Observable state consumed by presentation.
//!
//! Updates travel through a channel to a single task that owns the state, so
//! every field has exactly one writer and subscribers always see whole
//! updates. Subscribers read the result through a `watch` receiver.

use crate::store::QuantitySample;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// State published to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthState {
    /// Sum of all observed step samples
    pub step_count: f64,
    /// Observed step samples, oldest first
    pub step_samples: Vec<QuantitySample>,
    /// Most recent heart rate samples, newest first
    pub heart_rate_samples: Vec<QuantitySample>,
    /// When the state last changed
    pub updated_at: Option<DateTime<Utc>>,
}

/// A change to apply to the published state.
#[derive(Debug, Clone, PartialEq)]
pub enum StateUpdate {
    Steps {
        total: f64,
        samples: Vec<QuantitySample>,
    },
    HeartRate {
        samples: Vec<QuantitySample>,
    },
}

impl HealthState {
    fn apply(&mut self, update: StateUpdate) {
        match update {
            StateUpdate::Steps { total, samples } => {
                self.step_count = total;
                self.step_samples = samples;
            }
            StateUpdate::HeartRate { samples } => {
                self.heart_rate_samples = samples;
            }
        }
        self.updated_at = Some(Utc::now());
    }
}

/// Handle used by observers to send updates.
#[derive(Debug, Clone)]
pub struct StatePublisher {
    sender: mpsc::UnboundedSender<StateUpdate>,
}

impl StatePublisher {
    /// Queue an update. Returns false once the sink has shut down.
    pub fn publish(&self, update: StateUpdate) -> bool {
        if self.sender.send(update).is_err() {
            tracing::debug!("state sink closed; update dropped");
            return false;
        }
        true
    }
}

/// Owner of the published state.
pub struct StateSink {
    publisher: StatePublisher,
    receiver: watch::Receiver<HealthState>,
}

impl StateSink {
    /// Start the task that applies updates in arrival order.
    ///
    /// The task ends once the sink and every publisher have been dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<StateUpdate>();
        let (state_tx, state_rx) = watch::channel(HealthState::default());

        let handle = tokio::spawn(async move {
            while let Some(update) = update_rx.recv().await {
                state_tx.send_modify(|state| state.apply(update));
            }
            tracing::debug!("state sink stopped");
        });

        let sink = Self {
            publisher: StatePublisher { sender: update_tx },
            receiver: state_rx,
        };
        (sink, handle)
    }

    pub fn publisher(&self) -> StatePublisher {
        self.publisher.clone()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.receiver.clone()
    }

    /// Copy of the current state.
    pub fn current(&self) -> HealthState {
        self.receiver.borrow().clone()
    }
}
