use std::str::FromStr;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use derive_more::Display;
use error_stack::{Report, ResultExt};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::constants::{
    DEFAULT_BIDDER_TIMEOUT_MS, DEFAULT_THROTTLE_TIMEOUT_MS, ENV_PREFIX, MAX_BIDDER_TIMEOUT_MS,
    MAX_THROTTLE_TIMEOUT_MS,
};
use crate::error::OrchestratorError;

/// Tunable orchestrator settings.
///
/// Settings are created with defaults when an orchestrator is constructed and
/// are mutated through [`crate::orchestrator::Orchestrator::set`]. They live
/// for the lifetime of the orchestrator and are never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
pub struct Settings {
    /// How long an auction waits for header bidders before rendering anyway.
    #[serde(default = "default_bidder_timeout_ms")]
    #[validate(range(min = 1, max = MAX_BIDDER_TIMEOUT_MS))]
    pub bidder_timeout_ms: u64,

    /// Batching window between the first queued request and the round start.
    #[serde(default = "default_throttle_timeout_ms")]
    #[validate(range(max = MAX_THROTTLE_TIMEOUT_MS))]
    pub throttle_timeout_ms: u64,

    /// Forward every orchestrator event to the `log` facade.
    #[serde(default)]
    pub debug: bool,
}

fn default_bidder_timeout_ms() -> u64 {
    DEFAULT_BIDDER_TIMEOUT_MS
}

fn default_throttle_timeout_ms() -> u64 {
    DEFAULT_THROTTLE_TIMEOUT_MS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bidder_timeout_ms: DEFAULT_BIDDER_TIMEOUT_MS,
            throttle_timeout_ms: DEFAULT_THROTTLE_TIMEOUT_MS,
            debug: false,
        }
    }
}

impl Settings {
    /// Load settings from a TOML document, applying `BIDFLOW__*` environment
    /// overrides on top.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Configuration`] if the TOML is malformed,
    /// a value has the wrong type, or validation fails.
    pub fn from_toml(toml_str: &str) -> Result<Self, Report<OrchestratorError>> {
        let environment = Environment::default()
            .prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);

        let toml = File::from_str(toml_str, FileFormat::Toml);
        let settings: Self = Config::builder()
            .add_source(toml)
            .add_source(environment)
            .build()
            .change_context(OrchestratorError::Configuration {
                message: "Failed to build settings".to_string(),
            })?
            .try_deserialize()
            .change_context(OrchestratorError::Configuration {
                message: "Failed to deserialize settings".to_string(),
            })?;

        settings
            .validate()
            .change_context(OrchestratorError::Configuration {
                message: "Settings validation failed".to_string(),
            })?;

        Ok(settings)
    }

    /// Read a setting by key, in milliseconds.
    #[must_use]
    pub fn get(&self, key: SettingKey) -> u64 {
        match key {
            SettingKey::BidderTimeout => self.bidder_timeout_ms,
            SettingKey::ThrottleTimeout => self.throttle_timeout_ms,
        }
    }

    /// Write a setting by key and return the previous value.
    ///
    /// The value is validated against the same bounds used when loading from
    /// TOML; on failure the previous value is kept.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Setting`] if the new value is out of range.
    pub fn set(&mut self, key: SettingKey, value: u64) -> Result<u64, Report<OrchestratorError>> {
        let mut updated = self.clone();
        match key {
            SettingKey::BidderTimeout => updated.bidder_timeout_ms = value,
            SettingKey::ThrottleTimeout => updated.throttle_timeout_ms = value,
        }
        updated
            .validate()
            .change_context(OrchestratorError::Setting {
                message: format!("{key} = {value} is out of range"),
            })?;

        let previous = self.get(key);
        *self = updated;
        Ok(previous)
    }

    /// Bidder timeout as a [`Duration`].
    #[must_use]
    pub fn bidder_timeout(&self) -> Duration {
        Duration::from_millis(self.bidder_timeout_ms)
    }

    /// Throttle timeout as a [`Duration`].
    #[must_use]
    pub fn throttle_timeout(&self) -> Duration {
        Duration::from_millis(self.throttle_timeout_ms)
    }
}

/// Names of the settings exposed through `get` / `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SettingKey {
    #[display("bidderTimeout")]
    BidderTimeout,
    #[display("throttleTimeout")]
    ThrottleTimeout,
}

impl FromStr for SettingKey {
    type Err = Report<OrchestratorError>;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bidderTimeout" | "bidder_timeout_ms" => Ok(Self::BidderTimeout),
            "throttleTimeout" | "throttle_timeout_ms" => Ok(Self::ThrottleTimeout),
            other => Err(Report::new(OrchestratorError::Setting {
                message: format!("unknown setting '{other}'"),
            })),
        }
    }
}
