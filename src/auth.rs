//! Authorization gate for reading sample types.
//!
//! Read access is requested per set of types in one prompt. A set that was
//! already granted is answered from memory without prompting again.

use crate::store::{AuthorizationStatus, SampleStore, SampleType, StoreError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors returned by an authorization request.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("read access denied for {}", format_types(.0))]
    Denied(BTreeSet<SampleType>),

    #[error("authorization request failed: {0}")]
    Platform(#[from] StoreError),
}

fn format_types(types: &BTreeSet<SampleType>) -> String {
    types
        .iter()
        .map(SampleType::identifier)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A successful authorization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    /// Types covered by the grant
    pub types: BTreeSet<SampleType>,
    /// Whether this call prompted the store (false when answered from memory)
    pub prompted: bool,
}

/// Serializes authorization prompts and remembers their outcome.
pub struct AuthorizationGate<S> {
    store: Arc<S>,
    status: Mutex<HashMap<SampleType, AuthorizationStatus>>,
}

impl<S: SampleStore> AuthorizationGate<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            status: Mutex::new(HashMap::new()),
        }
    }

    /// Request read access to `types`.
    ///
    /// Concurrent callers are serialized so a set is never prompted twice.
    pub async fn request(&self, types: &BTreeSet<SampleType>) -> Result<Grant, AuthError> {
        let mut status = self.status.lock().await;

        let already_granted = types
            .iter()
            .all(|t| status.get(t) == Some(&AuthorizationStatus::Granted));
        if already_granted {
            tracing::debug!(types = %format_types(types), "read access already granted");
            return Ok(Grant {
                types: types.clone(),
                prompted: false,
            });
        }

        let granted = self.store.request_authorization(types).await.map_err(|e| {
            tracing::warn!(types = %format_types(types), error = %e, "authorization request failed");
            AuthError::Platform(e)
        })?;

        let outcome = if granted {
            AuthorizationStatus::Granted
        } else {
            AuthorizationStatus::Denied
        };
        for sample_type in types {
            status.insert(*sample_type, outcome);
        }

        if granted {
            tracing::info!(types = %format_types(types), "read access granted");
            Ok(Grant {
                types: types.clone(),
                prompted: true,
            })
        } else {
            tracing::warn!(types = %format_types(types), "read access denied");
            Err(AuthError::Denied(types.clone()))
        }
    }

    /// Last known status for a type, as seen by this gate.
    pub async fn status(&self, sample_type: SampleType) -> AuthorizationStatus {
        self.status
            .lock()
            .await
            .get(&sample_type)
            .copied()
            .unwrap_or(AuthorizationStatus::Undetermined)
    }

    /// Whether every type in `types` is currently granted.
    pub async fn is_granted(&self, types: &BTreeSet<SampleType>) -> bool {
        let status = self.status.lock().await;
        types
            .iter()
            .all(|t| status.get(t) == Some(&AuthorizationStatus::Granted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AuthorizationPolicy, InMemorySampleStore};

    fn steps_only() -> BTreeSet<SampleType> {
        [SampleType::StepCount].into_iter().collect()
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let store = Arc::new(InMemorySampleStore::default());
        let gate = AuthorizationGate::new(store.clone());

        let first = gate.request(&steps_only()).await.unwrap();
        assert!(first.prompted);

        let second = gate.request(&steps_only()).await.unwrap();
        assert!(!second.prompted);
        assert_eq!(store.authorization_prompts(), 1);
        assert_eq!(
            gate.status(SampleType::StepCount).await,
            AuthorizationStatus::Granted
        );
    }

    #[tokio::test]
    async fn test_superset_prompts_again() {
        let store = Arc::new(InMemorySampleStore::default());
        let gate = AuthorizationGate::new(store.clone());

        gate.request(&steps_only()).await.unwrap();
        let all: BTreeSet<_> = SampleType::ALL.into_iter().collect();
        let grant = gate.request(&all).await.unwrap();

        assert!(grant.prompted);
        assert_eq!(store.authorization_prompts(), 2);
        assert!(gate.is_granted(&all).await);
    }

    #[tokio::test]
    async fn test_denied_is_reported() {
        let store = Arc::new(InMemorySampleStore::new(AuthorizationPolicy::DenyAll));
        let gate = AuthorizationGate::new(store);

        let err = gate.request(&steps_only()).await.unwrap_err();
        assert_eq!(err, AuthError::Denied(steps_only()));
        assert_eq!(err.to_string(), "read access denied for step_count");
        assert_eq!(
            gate.status(SampleType::StepCount).await,
            AuthorizationStatus::Denied
        );
    }

    #[tokio::test]
    async fn test_platform_failure_is_typed() {
        let store = Arc::new(InMemorySampleStore::new(AuthorizationPolicy::Fail(
            "health data unavailable".to_string(),
        )));
        let gate = AuthorizationGate::new(store);

        let err = gate.request(&steps_only()).await.unwrap_err();
        assert!(matches!(err, AuthError::Platform(StoreError::Authorization(_))));
        assert_eq!(
            gate.status(SampleType::StepCount).await,
            AuthorizationStatus::Undetermined
        );
    }

    #[tokio::test]
    async fn test_denied_then_granted() {
        let store = Arc::new(InMemorySampleStore::new(AuthorizationPolicy::DenyAll));
        let gate = AuthorizationGate::new(store.clone());

        assert!(gate.request(&steps_only()).await.is_err());
        store.set_policy(AuthorizationPolicy::GrantAll);
        assert!(gate.request(&steps_only()).await.unwrap().prompted);
    }
}
