//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Configuration for the public-facing tunnel server.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// API keys accepted at registration time.
    pub api_keys: Vec<String>,

    /// Path clients dial in on.
    pub connect_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            api_keys: Vec::new(),
            connect_path: crate::server::DEFAULT_CONNECT_PATH.to_string(),
        }
    }
}

/// Configuration for a tunnelling client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server base url (e.g., "https://tunnel.example").
    pub server: String,

    /// API key presented at registration.
    pub api_key: String,

    /// Domain to claim.
    pub domain: String,

    /// Local base url requests are replayed against.
    pub local_addr: String,

    /// Connect path on the server.
    pub connect_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: "http://127.0.0.1:8080".to_string(),
            api_key: String::new(),
            domain: String::new(),
            local_addr: "http://127.0.0.1:3000".to_string(),
            connect_path: crate::server::DEFAULT_CONNECT_PATH.to_string(),
        }
    }
}
