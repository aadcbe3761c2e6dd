//! Top-level error type and its classification.

use crate::anchor::AnchorError;
use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::forward::ForwardError;
use crate::monitor::MonitorError;
use crate::observe::ObserveError;
use crate::store::StoreError;

/// Broad class of a failure, independent of where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AuthorizationDenied,
    PlatformQuery,
    Network,
    Serialization,
    Configuration,
}

/// Any error surfaced by the agent.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Authorization(#[from] AuthError),

    #[error(transparent)]
    Observation(#[from] ObserveError),

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Observation(ObserveError::Store(e))
    }
}

impl From<AnchorError> for SyncError {
    fn from(e: AnchorError) -> Self {
        SyncError::Observation(ObserveError::Anchor(e))
    }
}

impl From<MonitorError> for SyncError {
    fn from(e: MonitorError) -> Self {
        match e {
            MonitorError::Authorization(e) => SyncError::Authorization(e),
            MonitorError::Observation(e) => SyncError::Observation(e),
        }
    }
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Authorization(AuthError::Denied(_)) => ErrorKind::AuthorizationDenied,
            SyncError::Authorization(AuthError::Platform(_)) => ErrorKind::PlatformQuery,
            SyncError::Observation(_) => ErrorKind::PlatformQuery,
            SyncError::Forward(ForwardError::Network(_)) => ErrorKind::Network,
            SyncError::Forward(ForwardError::Serialization(_)) => ErrorKind::Serialization,
            SyncError::Forward(ForwardError::Config(_)) => ErrorKind::Configuration,
            SyncError::Config(ConfigError::Parse(_) | ConfigError::Serialize(_)) => {
                ErrorKind::Serialization
            }
            SyncError::Config(_) => ErrorKind::Configuration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SampleType;

    #[test]
    fn test_kinds() {
        let denied: SyncError = AuthError::Denied([SampleType::HeartRate].into_iter().collect()).into();
        assert_eq!(denied.kind(), ErrorKind::AuthorizationDenied);

        let query: SyncError = StoreError::Query("boom".to_string()).into();
        assert_eq!(query.kind(), ErrorKind::PlatformQuery);

        let network: SyncError = ForwardError::Network("refused".to_string()).into();
        assert_eq!(network.kind(), ErrorKind::Network);

        let encoding: SyncError = ForwardError::Serialization("NaN".to_string()).into();
        assert_eq!(encoding.kind(), ErrorKind::Serialization);
    }

    #[test]
    fn test_monitor_errors_flatten() {
        let err: SyncError =
            MonitorError::Authorization(AuthError::Platform(StoreError::Authorization("x".into())))
                .into();
        assert!(matches!(err, SyncError::Authorization(AuthError::Platform(_))));
        assert_eq!(err.kind(), ErrorKind::PlatformQuery);
    }
}
