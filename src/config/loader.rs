//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::{ClientConfig, ServerConfig};
use crate::config::validation::{validate_client_config, validate_server_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("could not parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", summarize(.0))]
    Invalid(Vec<ValidationError>),
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|error| error.0.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Load and validate a server configuration from a TOML file.
pub fn load_server_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let config: ServerConfig = toml::from_str(&fs::read_to_string(path)?)?;
    validate_server_config(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}

/// Load and validate a client configuration from a TOML file.
pub fn load_client_config(path: &Path) -> Result<ClientConfig, ConfigError> {
    let config: ClientConfig = toml::from_str(&fs::read_to_string(path)?)?;
    validate_client_config(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}
