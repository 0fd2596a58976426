//! Sluice Services Layer
//!
//! Typed configuration for the queue and script layers.

pub mod settings;

pub use settings::{QueueSettings, ScriptSettings, Settings, SettingsError};
