//! Core processing for the health sync agent.
//!
//! This module contains:
//! - Aggregation of fetched samples into step totals and heart rate windows
//! - Collector payload building

pub mod aggregate;
pub mod payload;

// Re-export commonly used types
pub use aggregate::{Aggregator, HeartRateWindow, StepTotals, HEART_RATE_WINDOW};
pub use payload::{format_timestamp, to_body, PayloadError, StepBatch, StepRecord, StepTotal};
