//! Client configuration: defaults, file/environment loading and validation.

use crate::connection::{ConnectParams, Protocol};
use crate::error::ConfigurationError;
use crate::tube::TubeOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;

/// Environment variable prefix used by [`QueueClientConfig::load`]
pub const ENV_PREFIX: &str = "TNTQ";

/// Default server port
pub const DEFAULT_PORT: u16 = 33013;

/// Configuration for queue client initialization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueClientConfig {
    pub host: String,
    pub port: u16,
    /// Server-side partition (space) every call is pinned to
    pub space: u32,
    /// Opaque value passed through to the connection unmodified
    pub schema: Option<serde_json::Value>,
    /// Procedure family the server speaks
    pub protocol: Protocol,
    /// Tubes registered at construction, with their default options
    pub tubes: BTreeMap<String, TubeOptions>,
}

impl Default for QueueClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            space: 0,
            schema: None,
            protocol: Protocol::Standard,
            tubes: BTreeMap::new(),
        }
    }
}

impl QueueClientConfig {
    /// Configuration pointing at the given server, with all other fields
    /// defaulted
    pub fn new(host: impl Into<String>, port: u16, space: u32) -> Self {
        Self {
            host: host.into(),
            port,
            space,
            ..Self::default()
        }
    }

    /// Load configuration from layered sources.
    ///
    /// Sources (applied in order, later sources override earlier ones):
    ///  1. Built-in defaults
    ///  2. `path`, if given; the format is taken from the file extension
    ///  3. Environment variables prefixed `TNTQ__`, e.g. `TNTQ__PORT=3301`
    ///
    /// The result is validated before it is returned.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let defaults = ::config::Config::try_from(&Self::default())?;

        let mut builder = ::config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings: Self = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check host and port. Called by [`crate::QueueClient::new`].
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::Missing {
                key: "host".to_string(),
            });
        }

        if let Err(e) = url::Host::parse(&self.host) {
            return Err(ConfigurationError::Invalid {
                message: format!("host '{}' is not a valid host name: {}", self.host, e),
            });
        }

        if self.port == 0 {
            return Err(ConfigurationError::Invalid {
                message: "port must be non-zero".to_string(),
            });
        }

        for name in self.tubes.keys() {
            if name.is_empty() {
                return Err(ConfigurationError::Invalid {
                    message: "tube names must not be empty".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Parameters handed to the connection factory
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams {
            host: self.host.clone(),
            port: self.port,
            schema: self.schema.clone(),
            protocol: self.protocol,
        }
    }
}
