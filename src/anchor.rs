//! Per-type anchors for incremental queries.
//!
//! An anchor only moves forward. Updates are compare-and-swap against the
//! anchor the fetch was issued with, so a stale fetch can never overwrite a
//! newer position. Anchors can be persisted so a restart resumes where the
//! previous run stopped instead of replaying everything.

use crate::store::{Anchor, SampleType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Rejected anchor updates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnchorError {
    #[error("anchor for {sample_type} moved from {expected:?} to {current:?} during the fetch")]
    Conflict {
        sample_type: SampleType,
        expected: Option<Anchor>,
        current: Option<Anchor>,
    },

    #[error("anchor for {sample_type} would move backwards from {current} to {proposed}")]
    Regression {
        sample_type: SampleType,
        current: Anchor,
        proposed: Anchor,
    },
}

/// Stored anchors keyed by sample type.
#[derive(Debug)]
pub struct AnchorLedger {
    anchors: Mutex<BTreeMap<SampleType, Anchor>>,
    persist_path: Option<PathBuf>,
}

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedAnchors {
    anchors: BTreeMap<SampleType, Anchor>,
    last_updated: DateTime<Utc>,
}

impl AnchorLedger {
    /// Create an in-memory ledger.
    pub fn new() -> Self {
        Self {
            anchors: Mutex::new(BTreeMap::new()),
            persist_path: None,
        }
    }

    /// Create a ledger that saves every advance to `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut ledger = Self::new();
        ledger.persist_path = Some(path);

        if let Err(e) = ledger.load() {
            tracing::warn!(error = %e, "could not load previous anchors; starting from scratch");
        }

        ledger
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<SampleType, Anchor>> {
        self.anchors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last anchor recorded for a type.
    pub fn get(&self, sample_type: SampleType) -> Option<Anchor> {
        self.lock().get(&sample_type).copied()
    }

    /// Move the anchor for `sample_type` from `expected` to `proposed`.
    ///
    /// Fails without changing anything if another update landed since
    /// `expected` was read, or if `proposed` is older than the current anchor.
    pub fn advance(
        &self,
        sample_type: SampleType,
        expected: Option<Anchor>,
        proposed: Anchor,
    ) -> Result<(), AnchorError> {
        {
            let mut anchors = self.lock();
            let current = anchors.get(&sample_type).copied();

            if current != expected {
                return Err(AnchorError::Conflict {
                    sample_type,
                    expected,
                    current,
                });
            }
            if let Some(current) = current {
                if proposed < current {
                    return Err(AnchorError::Regression {
                        sample_type,
                        current,
                        proposed,
                    });
                }
            }
            anchors.insert(sample_type, proposed);
            if let Err(e) = self.write(&anchors) {
                tracing::warn!(%sample_type, error = %e, "could not persist anchor");
            }
        }

        tracing::debug!(%sample_type, anchor = %proposed, "anchor advanced");
        Ok(())
    }

    /// Forget the anchor for a type so the next fetch starts from the beginning.
    pub fn reset(&self, sample_type: SampleType) {
        let mut anchors = self.lock();
        anchors.remove(&sample_type);
        if let Err(e) = self.write(&anchors) {
            tracing::warn!(%sample_type, error = %e, "could not persist anchor reset");
        }
    }

    /// Forget every anchor.
    pub fn reset_all(&self) {
        let mut anchors = self.lock();
        anchors.clear();
        if let Err(e) = self.write(&anchors) {
            tracing::warn!(error = %e, "could not persist anchor reset");
        }
    }

    /// Copy of all anchors.
    pub fn snapshot(&self) -> BTreeMap<SampleType, Anchor> {
        self.lock().clone()
    }

    /// Save anchors to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        let anchors = self.lock();
        self.write(&anchors)
    }

    /// Write `anchors` while the caller holds the lock, so files land in update order.
    fn write(&self, anchors: &BTreeMap<SampleType, Anchor>) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedAnchors {
                anchors: anchors.clone(),
                last_updated: Utc::now(),
            };
            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            // Readers see either the old file or the new one, never a partial write.
            let tmp_path = path.with_extension("json.tmp");
            std::fs::write(&tmp_path, json)?;
            std::fs::rename(&tmp_path, path)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedAnchors =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;
                *self.lock() = persisted.anchors;
            }
        }
        Ok(())
    }
}

impl Default for AnchorLedger {
    fn default() -> Self {
        Self::new()
    }
}
