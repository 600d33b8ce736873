//! Configuration validation logic.

use std::net::SocketAddr;

use url::Url;

use crate::config::schema::{ClientConfig, ServerConfig};

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ServerConfig for semantic correctness.
pub fn validate_server_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError(format!(
            "bind_address '{}' is not a socket address",
            config.bind_address
        )));
    }

    if config.api_keys.is_empty() {
        errors.push(ValidationError(
            "api_keys must contain at least one key".to_string(),
        ));
    } else if config.api_keys.iter().any(String::is_empty) {
        errors.push(ValidationError(
            "api_keys must not contain empty keys".to_string(),
        ));
    }

    if !config.connect_path.starts_with('/') {
        errors.push(ValidationError(format!(
            "connect_path '{}' must start with '/'",
            config.connect_path
        )));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a ClientConfig for semantic correctness.
pub fn validate_client_config(config: &ClientConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    for (field, value) in [
        ("server", &config.server),
        ("local_addr", &config.local_addr),
    ] {
        match Url::parse(value) {
            Ok(url) if matches!(url.scheme(), "http" | "https" | "ws" | "wss") => {}
            Ok(url) => errors.push(ValidationError(format!(
                "{} has unsupported scheme '{}'",
                field,
                url.scheme()
            ))),
            Err(err) => errors.push(ValidationError(format!("{} is not a url: {}", field, err))),
        }
    }

    if config.domain.is_empty() {
        errors.push(ValidationError("domain must not be empty".to_string()));
    }

    if config.api_key.is_empty() {
        errors.push(ValidationError("api_key must not be empty".to_string()));
    }

    if !config.connect_path.starts_with('/') {
        errors.push(ValidationError(format!(
            "connect_path '{}' must start with '/'",
            config.connect_path
        )));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
