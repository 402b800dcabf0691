// Engine configuration

//! # Configuration
//!
//! [`EngineConfig`] is layered with the `config` crate, later sources
//! overriding earlier ones:
//!
//! 1. built-in defaults
//! 2. a TOML file: the explicit path if one is given, otherwise
//!    `process_runtime.toml` in the working directory when present
//! 3. environment variables prefixed `PROCESS_RUNTIME__`, e.g.
//!    `PROCESS_RUNTIME__EVENT_BUFFER=64`

use serde::{Deserialize, Serialize};

use crate::Result;

pub const DEFAULT_CONFIG_FILE: &str = "process_runtime";
pub const ENV_PREFIX: &str = "PROCESS_RUNTIME";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Capacity of the broadcast event bus
    pub event_buffer: usize,

    /// Default tracing filter when `RUST_LOG` is not set
    pub log_level: String,

    /// Keep ENDED executions in live trees after a command instead of purging
    pub retain_ended_executions: bool,

    /// Extra projection attempts after an inconsistent snapshot
    pub projection_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            event_buffer: 1000,
            log_level: "info".to_string(),
            retain_ended_executions: false,
            projection_retries: 3,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then the config file, then the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&EngineConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(::config::File::with_name(path).required(true)),
            None => builder.add_source(::config::File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: EngineConfig = builder.build()?.try_deserialize()?;
        Ok(loaded)
    }
}
