/// Startup configuration
///
/// Defaults, then an optional JSON file, then `ROBOT_HEAD_*` environment
/// overrides, then command-line flags. Validated once all layers are applied.

use crate::coordinator::{CoordinatorSettings, DEFAULT_COMMAND_TIMEOUT, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::engine::{EngineSettings, DEFAULT_KEYWORD_THRESHOLD};
use crate::notify::{DEFAULT_LOW_BATTERY_MESSAGE, DEFAULT_LOW_BATTERY_PERCENT};
use crate::shared_state::{QuietHours, DEFAULT_QUIET_FROM_HOUR, DEFAULT_QUIET_TO_HOUR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value '{value}' for {var}")]
    InvalidEnv { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Nightly silence window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuietHoursConfig {
    pub from_hour: u32,
    pub to_hour: u32,
}

impl Default for QuietHoursConfig {
    fn default() -> Self {
        Self {
            from_hour: DEFAULT_QUIET_FROM_HOUR,
            to_hour: DEFAULT_QUIET_TO_HOUR,
        }
    }
}

/// Low-battery announcement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub low_percent: u8,
    pub low_message: String,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            low_percent: DEFAULT_LOW_BATTERY_PERCENT,
            low_message: DEFAULT_LOW_BATTERY_MESSAGE.to_string(),
        }
    }
}

/// Robot head voice configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Phrase that opens the command window
    pub wake_phrase: String,

    /// Command window length in milliseconds
    pub command_timeout_ms: u64,

    /// Largest accepted best-score magnitude for command results
    pub confidence_threshold: i64,

    /// Keyword-spotting sensitivity (0 < t <= 1, lower = fewer false alarms)
    pub keyword_threshold: f64,

    pub quiet_hours: QuietHoursConfig,

    pub battery: BatteryConfig,

    /// Utterance → reply table for the built-in resolver
    pub commands: BTreeMap<String, String>,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        let mut commands = BTreeMap::new();
        commands.insert("hello".to_string(), "hello human".to_string());
        commands.insert("turn on lights".to_string(), "lights on".to_string());
        commands.insert("turn off lights".to_string(), "lights off".to_string());

        Self {
            wake_phrase: "robot".to_string(),
            command_timeout_ms: DEFAULT_COMMAND_TIMEOUT.as_millis() as u64,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD as i64,
            keyword_threshold: DEFAULT_KEYWORD_THRESHOLD,
            quiet_hours: QuietHoursConfig::default(),
            battery: BatteryConfig::default(),
            commands,
        }
    }
}

impl VoiceConfig {
    /// Defaults, optional file, then the process environment.
    ///
    /// Not validated: callers apply their own overrides, then `validate()`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(path, |var| std::env::var(var).ok())
    }

    /// `load` with an explicit environment lookup
    pub fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_overrides(lookup)?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Apply `ROBOT_HEAD_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(phrase) = lookup("ROBOT_HEAD_WAKE_PHRASE") {
            debug!("Wake phrase overridden from environment");
            self.wake_phrase = phrase;
        }

        if let Some(value) = parse_var(&lookup, "ROBOT_HEAD_COMMAND_TIMEOUT_MS")? {
            self.command_timeout_ms = value;
        }

        if let Some(value) = parse_var(&lookup, "ROBOT_HEAD_CONFIDENCE_THRESHOLD")? {
            self.confidence_threshold = value;
        }

        if let Some(value) = parse_var(&lookup, "ROBOT_HEAD_QUIET_FROM")? {
            self.quiet_hours.from_hour = value;
        }

        if let Some(value) = parse_var(&lookup, "ROBOT_HEAD_QUIET_TO")? {
            self.quiet_hours.to_hour = value;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.wake_phrase.trim().is_empty() {
            return Err(ConfigError::Invalid("wake_phrase must not be empty".to_string()));
        }

        if self.command_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.confidence_threshold < 0 || self.confidence_threshold > u32::MAX as i64 {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold out of range: {}",
                self.confidence_threshold
            )));
        }

        if !(self.keyword_threshold > 0.0 && self.keyword_threshold <= 1.0) {
            return Err(ConfigError::Invalid(
                "keyword_threshold must be in (0, 1]".to_string(),
            ));
        }

        if self.quiet_hours.from_hour > 23 || self.quiet_hours.to_hour > 23 {
            return Err(ConfigError::Invalid(
                "quiet hours must be between 0 and 23".to_string(),
            ));
        }

        if self.battery.low_percent > 100 {
            return Err(ConfigError::Invalid(
                "battery.low_percent must be at most 100".to_string(),
            ));
        }

        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            wake_phrase: self.wake_phrase.trim().to_string(),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            confidence_threshold: self.confidence_threshold.clamp(0, u32::MAX as i64) as u32,
        }
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            wake_phrase: self.wake_phrase.trim().to_string(),
            keyword_threshold: self.keyword_threshold,
        }
    }

    pub fn quiet_hours(&self) -> QuietHours {
        QuietHours::new(self.quiet_hours.from_hour, self.quiet_hours.to_hour)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                var: var.to_string(),
                value,
            }),
        None => Ok(None),
    }
}
