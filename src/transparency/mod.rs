//! Transparency module for the health sync agent.
//!
//! Tracks how much health data was read and forwarded so a user can audit
//! what the agent did on their behalf.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, SharedTransparencyLog, TransparencyLog,
    TransparencyStats,
};
