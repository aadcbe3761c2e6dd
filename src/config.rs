//! Configuration for the health sync agent.

use crate::core::HEART_RATE_WINDOW;
use crate::forward::{CollectorConfig, DEFAULT_COLLECTOR_URL};
use crate::observe::FetchStrategy;
use crate::store::{SampleType, UpdateFrequency};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path for anchors and transparency logs
    pub data_path: PathBuf,

    /// Which sample types to observe
    pub sources: SourceConfig,

    /// How heart rate is read after a change notification
    pub heart_rate_strategy: StrategyKind,

    /// Number of recent heart rate samples kept
    pub heart_rate_window: usize,

    /// Background delivery frequency requested from the store
    pub background_frequency: UpdateFrequency,

    /// Keep anchors across restarts
    pub persist_anchors: bool,

    /// Collector endpoint step samples are forwarded to
    pub collector: CollectorSettings,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("libreconnect");

        Self {
            data_path: data_dir,
            sources: SourceConfig::default(),
            heart_rate_strategy: StrategyKind::Anchored,
            heart_rate_window: HEART_RATE_WINDOW,
            background_frequency: UpdateFrequency::Immediate,
            persist_anchors: true,
            collector: CollectorSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, falling back to defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("libreconnect")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.data_path).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn anchors_path(&self) -> PathBuf {
        self.data_path.join("anchors.json")
    }

    pub fn transparency_path(&self) -> PathBuf {
        self.data_path.join("transparency.json")
    }

    /// Check values that serde alone cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heart_rate_window == 0 {
            return Err(ConfigError::Invalid(
                "heart_rate_window must be at least 1".to_string(),
            ));
        }
        self.collector.timezone()?;
        Ok(())
    }

    /// The single path heart rate is read through.
    pub fn heart_rate_fetch_strategy(&self) -> FetchStrategy {
        match self.heart_rate_strategy {
            StrategyKind::Bulk => FetchStrategy::bulk_recent(self.heart_rate_window),
            StrategyKind::Anchored => FetchStrategy::anchored(),
        }
    }
}

/// Which sample types to observe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub steps: bool,
    pub heart_rate: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            steps: true,
            heart_rate: true,
        }
    }
}

impl SourceConfig {
    /// Parse source configuration from a comma-separated string.
    pub fn from_csv(s: &str) -> Self {
        let sources: Vec<String> = s.split(',').map(|s| s.trim().to_lowercase()).collect();

        Self {
            steps: sources.iter().any(|s| s == "steps" || s == "all"),
            heart_rate: sources
                .iter()
                .any(|s| s == "heart_rate" || s == "heart" || s == "all"),
        }
    }

    /// Check if at least one source is enabled.
    pub fn any_enabled(&self) -> bool {
        self.steps || self.heart_rate
    }

    pub fn sample_types(&self) -> BTreeSet<SampleType> {
        let mut types = BTreeSet::new();
        if self.steps {
            types.insert(SampleType::StepCount);
        }
        if self.heart_rate {
            types.insert(SampleType::HeartRate);
        }
        types
    }
}

/// Fetch strategy selectable from the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Bulk,
    Anchored,
}

/// Collector forwarding settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorSettings {
    /// Whether step samples are forwarded at all
    pub enabled: bool,
    /// Collector URL
    pub url: String,
    /// Request timeout (seconds)
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// IANA zone used for timestamps sent to the collector
    pub timezone: String,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: DEFAULT_COLLECTOR_URL.to_string(),
            timeout: Duration::from_secs(10),
            timezone: "UTC".to_string(),
        }
    }
}

impl CollectorSettings {
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| ConfigError::Invalid(format!("unknown timezone '{}': {e}", self.timezone)))
    }

    pub fn collector_config(&self) -> Result<CollectorConfig, ConfigError> {
        Ok(CollectorConfig::new(self.url.clone())
            .with_timeout(self.timeout)
            .with_timezone(self.timezone()?))
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid configuration value: {0}")]
    Invalid(String),
}

/// Serde support for Duration.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
