//! Settings management
//!
//! Settings come from an optional JSON file. Any field left out keeps its
//! default, and `SLUICE_*` environment variables override both.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "SLUICE_";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed settings file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidOverride { key: String, value: String },
}

/// Runtime settings
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub script: ScriptSettings,
    pub queue: QueueSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Interpreter stack ceiling in bytes.
    pub max_stack_size: usize,
    /// Interpreter heap ceiling in bytes; `None` leaves it unbounded.
    pub memory_limit: Option<usize>,
    /// Deepest container nesting the value bridge will convert.
    pub max_nesting_depth: usize,
    /// Most elements a single array or object may carry out of the
    /// interpreter.
    pub max_container_len: usize,
    /// Name of the per-host command pump reported by `get_event_pumps()`.
    pub command_pump: String,
    /// Prefix for the per-coroutine reply pump names.
    pub reply_pump_prefix: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            max_stack_size: 1024 * 1024,
            memory_limit: None,
            max_nesting_depth: 256,
            max_container_len: 1 << 20,
            command_pump: "ScriptCommand".to_string(),
            reply_pump_prefix: "ScriptReply".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Name of the queue the binary runs scripts on.
    pub name: String,
    /// How long a runner keeps servicing a queue before giving up, in ms.
    pub run_for_ms: u64,
}

impl QueueSettings {
    pub fn run_for(&self) -> Duration {
        Duration::from_millis(self.run_for_ms)
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "ScriptQueue".to_string(),
            run_for_ms: 5_000,
        }
    }
}

impl Settings {
    /// Read `path` as JSON, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: display.clone(),
            source,
        })?;
        let mut settings: Settings =
            serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
                path: display.clone(),
                source,
            })?;
        settings.apply_env()?;
        tracing::debug!(path = %display, "settings loaded");
        Ok(settings)
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Result<Self, SettingsError> {
        let mut settings = Settings::default();
        settings.apply_env()?;
        Ok(settings)
    }

    pub fn apply_env(&mut self) -> Result<(), SettingsError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides found through `lookup`, which maps a full variable
    /// name such as `SLUICE_SCRIPT_MAX_STACK_SIZE` to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |suffix: &str| {
            let key = format!("{ENV_PREFIX}{suffix}");
            lookup(&key).map(|value| (key, value))
        };

        if let Some((key, value)) = get("SCRIPT_MAX_STACK_SIZE") {
            self.script.max_stack_size = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SCRIPT_MEMORY_LIMIT") {
            self.script.memory_limit = match value.trim() {
                "" | "none" => None,
                _ => Some(parse(&key, &value)?),
            };
        }
        if let Some((key, value)) = get("SCRIPT_MAX_NESTING_DEPTH") {
            self.script.max_nesting_depth = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SCRIPT_MAX_CONTAINER_LEN") {
            self.script.max_container_len = parse(&key, &value)?;
        }
        if let Some((_, value)) = get("SCRIPT_COMMAND_PUMP") {
            self.script.command_pump = value;
        }
        if let Some((_, value)) = get("SCRIPT_REPLY_PUMP_PREFIX") {
            self.script.reply_pump_prefix = value;
        }
        if let Some((_, value)) = get("QUEUE_NAME") {
            self.queue.name = value;
        }
        if let Some((key, value)) = get("QUEUE_RUN_FOR_MS") {
            self.queue.run_for_ms = parse(&key, &value)?;
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, SettingsError> {
    value
        .trim()
        .parse()
        .map_err(|_| SettingsError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}
