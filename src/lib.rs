//! LibreConnect - health sample observer and collector sync.
//!
//! This library observes a health store for step count and heart rate
//! changes, keeps a live view of the data for presentation, and mirrors step
//! samples to a collector endpoint.
//!
//! # Guarantees
//!
//! - **One observer per type**: re-authorizing never registers a second subscription
//! - **Every notification acknowledged**: on success and on failure alike
//! - **Anchors only move forward**: a stale fetch cannot rewind an incremental query
//! - **Read only**: nothing is ever written back to the health store
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          SyncAgent                            │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Monitors   │──▶│  Observe    │──▶│  Aggregate  │         │
//! │  │ (auth gate) │   │ (per type)  │   │ (totals/HR) │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         │                 │                  │                │
//! │         ▼                 ▼                  ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │ SampleStore │   │   Forward   │   │    State    │         │
//! │  │  (trait)    │   │ (collector) │   │  (watch)    │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use libreconnect::{Config, InMemorySampleStore, SyncAgent};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), libreconnect::SyncError> {
//! let store = Arc::new(InMemorySampleStore::default());
//! let agent = SyncAgent::new(store, &Config::default())?;
//!
//! let report = agent.start().await;
//! println!("observing: {:?}", report.granted);
//!
//! let mut state = agent.subscribe();
//! while state.changed().await.is_ok() {
//!     println!("steps: {}", state.borrow().step_count);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod anchor;
pub mod auth;
pub mod config;
pub mod core;
pub mod error;
pub mod forward;
pub mod monitor;
pub mod observe;
pub mod state;
pub mod store;
pub mod transparency;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use agent::{StartReport, SyncAgent};
pub use anchor::{AnchorError, AnchorLedger};
pub use auth::{AuthError, AuthorizationGate, Grant};
pub use config::{CollectorSettings, Config, ConfigError, SourceConfig, StrategyKind};
pub use error::{ErrorKind, SyncError};
pub use forward::{CollectorConfig, ForwardError, ForwardReceipt, SyncForwarder};
pub use monitor::{ActivityMonitor, HealthMonitor, HeartMonitor, MonitorError};
pub use observe::{FetchStrategy, ObservationController, ObserveError, ObserverState};
pub use state::{HealthState, StatePublisher, StateSink, StateUpdate};
pub use store::{InMemorySampleStore, QuantitySample, SampleStore, SampleType, StoreError};
pub use transparency::{SharedTransparencyLog, TransparencyLog, TransparencyStats};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
