//! Collector payloads.
//!
//! The collector accepts either a batch of step samples or a single scalar
//! total, both under a `steps` key:
//!
//! ```text
//! {"steps":[{"quantity":5,"startDate":"2024-01-01T00:00:00.000Z","endDate":"2024-01-01T00:01:00.000Z"}]}
//! {"steps":1234}
//! ```

use crate::store::QuantitySample;
use chrono::{DateTime, SecondsFormat, Utc};
use chrono_tz::Tz;
use serde::{Serialize, Serializer};

/// Largest integer an f64 represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Errors building a payload.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PayloadError {
    #[error("payload serialization failed: {0}")]
    Serialization(String),
}

/// Format a timestamp as RFC 3339 with milliseconds in `tz`.
///
/// UTC renders with a `Z` suffix, other zones with their offset.
pub fn format_timestamp(timestamp: DateTime<Utc>, tz: Tz) -> String {
    timestamp
        .with_timezone(&tz)
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Integral quantities are written as JSON integers, others as floats.
fn serialize_quantity<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if !value.is_finite() {
        return Err(serde::ser::Error::custom(format!(
            "quantity {value} is not a finite number"
        )));
    }
    if value.fract() == 0.0 && value.abs() < MAX_EXACT_INTEGER {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

/// One step sample as the collector expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    #[serde(serialize_with = "serialize_quantity")]
    pub quantity: f64,
    pub start_date: String,
    pub end_date: String,
}

impl StepRecord {
    pub fn from_sample(sample: &QuantitySample, tz: Tz) -> Self {
        Self {
            quantity: sample.value(),
            start_date: format_timestamp(sample.start(), tz),
            end_date: format_timestamp(sample.end(), tz),
        }
    }
}

/// Batch form: `{"steps": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepBatch {
    pub steps: Vec<StepRecord>,
}

impl StepBatch {
    pub fn from_samples(samples: &[QuantitySample], tz: Tz) -> Self {
        Self {
            steps: samples.iter().map(|s| StepRecord::from_sample(s, tz)).collect(),
        }
    }
}

/// Scalar form: `{"steps": <total>}`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepTotal {
    #[serde(serialize_with = "serialize_quantity")]
    pub steps: f64,
}

/// Serialize a payload to the exact bytes sent on the wire.
pub fn to_body<T: Serialize>(payload: &T) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(payload).map_err(|e| PayloadError::Serialization(e.to_string()))
}
