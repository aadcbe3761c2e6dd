//! Transparency log of health data handling.
//!
//! Counts what was read from the health store and what left the device,
//! without recording any sample values.

use crate::store::SampleType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Activity counters for the current and previous sessions.
#[derive(Debug)]
pub struct TransparencyLog {
    /// Change notifications received from the store
    notifications_received: AtomicU64,
    /// Change notifications acknowledged back to the store
    notifications_acknowledged: AtomicU64,
    /// Fetches that completed
    fetches_succeeded: AtomicU64,
    /// Fetches that failed
    fetches_failed: AtomicU64,
    /// Step samples read from the store
    step_samples_read: AtomicU64,
    /// Heart rate samples read from the store
    heart_rate_samples_read: AtomicU64,
    /// Batches handed to the collector
    forwards_attempted: AtomicU64,
    /// Batches the collector could not be reached for
    forwards_failed: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Path for persisting stats
    persist_path: Option<PathBuf>,
}

impl TransparencyLog {
    /// Create a new transparency log.
    pub fn new() -> Self {
        Self {
            notifications_received: AtomicU64::new(0),
            notifications_acknowledged: AtomicU64::new(0),
            fetches_succeeded: AtomicU64::new(0),
            fetches_failed: AtomicU64::new(0),
            step_samples_read: AtomicU64::new(0),
            heart_rate_samples_read: AtomicU64::new(0),
            forwards_attempted: AtomicU64::new(0),
            forwards_failed: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a transparency log with persistence.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "could not load previous transparency stats");
        }

        log
    }

    pub fn record_notification(&self) {
        self.notifications_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgement(&self) {
        self.notifications_acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed fetch and the number of samples it returned.
    pub fn record_fetch(&self, sample_type: SampleType, samples: u64) {
        self.fetches_succeeded.fetch_add(1, Ordering::Relaxed);
        let counter = match sample_type {
            SampleType::StepCount => &self.step_samples_read,
            SampleType::HeartRate => &self.heart_rate_samples_read,
        };
        counter.fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_fetch_failure(&self) {
        self.fetches_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward(&self) {
        self.forwards_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_forward_failure(&self) {
        self.forwards_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn stats(&self) -> TransparencyStats {
        TransparencyStats {
            notifications_received: self.notifications_received.load(Ordering::Relaxed),
            notifications_acknowledged: self.notifications_acknowledged.load(Ordering::Relaxed),
            fetches_succeeded: self.fetches_succeeded.load(Ordering::Relaxed),
            fetches_failed: self.fetches_failed.load(Ordering::Relaxed),
            step_samples_read: self.step_samples_read.load(Ordering::Relaxed),
            heart_rate_samples_read: self.heart_rate_samples_read.load(Ordering::Relaxed),
            forwards_attempted: self.forwards_attempted.load(Ordering::Relaxed),
            forwards_failed: self.forwards_failed.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        format!(
            "Session Statistics:\n\
             - Change notifications: {} received, {} acknowledged\n\
             - Fetches: {} succeeded, {} failed\n\
             - Step samples read: {}\n\
             - Heart rate samples read: {}\n\
             - Collector batches: {} sent, {} failed\n\
             - Session duration: {} seconds\n\
             \n\
             Data Handling:\n\
             - Only step counts and heart rate are read\n\
             - Only step samples are sent to the collector, and only when enabled",
            stats.notifications_received,
            stats.notifications_acknowledged,
            stats.fetches_succeeded,
            stats.fetches_failed,
            stats.step_samples_read,
            stats.heart_rate_samples_read,
            stats.forwards_attempted,
            stats.forwards_failed,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedStats {
                notifications_received: stats.notifications_received,
                notifications_acknowledged: stats.notifications_acknowledged,
                fetches_succeeded: stats.fetches_succeeded,
                fetches_failed: stats.fetches_failed,
                step_samples_read: stats.step_samples_read,
                heart_rate_samples_read: stats.heart_rate_samples_read,
                forwards_attempted: stats.forwards_attempted,
                forwards_failed: stats.forwards_failed,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    /// Load stats from disk.
    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let p: PersistedStats =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.notifications_received
                    .store(p.notifications_received, Ordering::Relaxed);
                self.notifications_acknowledged
                    .store(p.notifications_acknowledged, Ordering::Relaxed);
                self.fetches_succeeded
                    .store(p.fetches_succeeded, Ordering::Relaxed);
                self.fetches_failed.store(p.fetches_failed, Ordering::Relaxed);
                self.step_samples_read
                    .store(p.step_samples_read, Ordering::Relaxed);
                self.heart_rate_samples_read
                    .store(p.heart_rate_samples_read, Ordering::Relaxed);
                self.forwards_attempted
                    .store(p.forwards_attempted, Ordering::Relaxed);
                self.forwards_failed
                    .store(p.forwards_failed, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.notifications_received,
            &self.notifications_acknowledged,
            &self.fetches_succeeded,
            &self.fetches_failed,
            &self.step_samples_read,
            &self.heart_rate_samples_read,
            &self.forwards_attempted,
            &self.forwards_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for TransparencyLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of transparency statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyStats {
    pub notifications_received: u64,
    pub notifications_acknowledged: u64,
    pub fetches_succeeded: u64,
    pub fetches_failed: u64,
    pub step_samples_read: u64,
    pub heart_rate_samples_read: u64,
    pub forwards_attempted: u64,
    pub forwards_failed: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedStats {
    notifications_received: u64,
    notifications_acknowledged: u64,
    fetches_succeeded: u64,
    fetches_failed: u64,
    step_samples_read: u64,
    heart_rate_samples_read: u64,
    forwards_attempted: u64,
    forwards_failed: u64,
    last_updated: DateTime<Utc>,
}

/// Thread-safe shared transparency log.
pub type SharedTransparencyLog = Arc<TransparencyLog>;

/// Create a new shared transparency log.
pub fn create_shared_log() -> SharedTransparencyLog {
    Arc::new(TransparencyLog::new())
}

/// Create a new shared transparency log with persistence.
pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedTransparencyLog {
    Arc::new(TransparencyLog::with_persistence(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_counts_by_type() {
        let log = TransparencyLog::new();

        log.record_fetch(SampleType::StepCount, 3);
        log.record_fetch(SampleType::HeartRate, 10);
        log.record_fetch_failure();

        let stats = log.stats();
        assert_eq!(stats.fetches_succeeded, 2);
        assert_eq!(stats.fetches_failed, 1);
        assert_eq!(stats.step_samples_read, 3);
        assert_eq!(stats.heart_rate_samples_read, 10);
    }

    #[test]
    fn test_transparency_log_reset() {
        let log = TransparencyLog::new();

        log.record_notification();
        log.record_forward();
        log.reset();

        let stats = log.stats();
        assert_eq!(stats.notifications_received, 0);
        assert_eq!(stats.forwards_attempted, 0);
    }

    #[test]
    fn test_summary_format() {
        let log = TransparencyLog::new();
        let summary = log.summary();

        assert!(summary.contains("Change notifications"));
        assert!(summary.contains("Collector batches"));
        assert!(summary.contains("Data Handling"));
    }

    #[test]
    fn test_persisted_counts_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transparency.json");

        let log = TransparencyLog::with_persistence(path.clone());
        log.record_notification();
        log.record_acknowledgement();
        log.record_forward_failure();
        log.save().unwrap();

        let reloaded = TransparencyLog::with_persistence(path);
        let stats = reloaded.stats();
        assert_eq!(stats.notifications_received, 1);
        assert_eq!(stats.notifications_acknowledged, 1);
        assert_eq!(stats.forwards_failed, 1);
    }
}
