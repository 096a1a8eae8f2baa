//! Host-level engine configuration.
//!
//! Precedence: environment (`PARLEY__*`) > file (`PARLEY_CONFIG`, default
//! `config/parley`) > defaults. Flow-specific behaviour lives in the flow
//! document's global settings, not here.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Automatic transitions allowed in a single turn before the session is ended.
    pub max_auto_continuations: u32,
    /// Most recent turns passed to the generator as history.
    pub history_window: usize,
    /// Transcription language when a flow does not set one.
    pub default_language: String,
    /// Channel count reported to the transcriber.
    pub channels: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_auto_continuations: 10,
            history_window: 10,
            default_language: "en".to_string(),
            channels: 1,
        }
    }
}

impl EngineConfig {
    /// Load from `PARLEY_CONFIG` (or `config/parley`) and the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "config/parley".to_string());
        Self::load_from(config_path)
    }

    /// Load from an explicit file path plus the environment.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, config::ConfigError> {
        Self::build(
            path.as_ref(),
            config::Environment::with_prefix("PARLEY")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn build(path: &Path, env: config::Environment) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .set_default("max_auto_continuations", 10_i64)?
            .set_default("history_window", 10_i64)?
            .set_default("default_language", "en")?
            .set_default("channels", 1_i64)?
            .add_source(config::File::from(path).required(false));

        let built = builder.add_source(env).build()?;
        built.try_deserialize()
    }
}
