//! Gateway configuration

use crate::callback::CallbackSettings;
use objbridge_client::ClientOptions;
use objbridge_core::{BridgeError, Result};
use objbridge_wire::DEFAULT_MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const ENV_ADDRESS: &str = "OBJBRIDGE_ADDRESS";
pub const ENV_CALLBACK_ADDRESS: &str = "OBJBRIDGE_CALLBACK_ADDRESS";
pub const ENV_AUTH_TOKEN: &str = "OBJBRIDGE_AUTH_TOKEN";

/// Configuration for a gateway and its callback channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Primary channel listen address (default: 127.0.0.1:25333)
    pub address: String,
    /// Where the remote side listens for callbacks (default: 127.0.0.1:25334)
    pub callback_address: Option<String>,
    /// Token every connection must present first, in both directions
    pub auth_token: Option<String>,
    pub connect_timeout_ms: u64,
    /// Read timeout for callback responses; unbounded when unset
    pub callback_read_timeout_ms: Option<u64>,
    /// How long in-flight calls may run once shutdown begins
    pub shutdown_grace_ms: u64,
    /// Whether a `shutdown` frame from the peer stops the gateway
    pub allow_remote_shutdown: bool,
    pub max_frame_bytes: usize,
    /// Release remote objects when their last proxy is dropped
    pub auto_release_proxies: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:25333".into(),
            callback_address: Some("127.0.0.1:25334".into()),
            auth_token: None,
            connect_timeout_ms: 5000,
            callback_read_timeout_ms: None,
            shutdown_grace_ms: 2000,
            allow_remote_shutdown: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            auto_release_proxies: true,
        }
    }
}

impl GatewayConfig {
    /// Load from a JSON file; missing keys take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Apply `OBJBRIDGE_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(address) = lookup(ENV_ADDRESS) {
            self.address = address;
        }
        if let Some(callback) = lookup(ENV_CALLBACK_ADDRESS) {
            // An empty value turns callbacks off
            self.callback_address = Some(callback).filter(|c| !c.is_empty());
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN) {
            self.auth_token = Some(token).filter(|t| !t.is_empty());
        }
        self
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        self.address.parse::<SocketAddr>().map_err(|e| {
            BridgeError::Config(format!("Invalid address {:?}: {}", self.address, e))
        })?;
        if let Some(callback) = &self.callback_address {
            callback.parse::<SocketAddr>().map_err(|e| {
                BridgeError::Config(format!("Invalid callback address {:?}: {}", callback, e))
            })?;
        }
        if self.max_frame_bytes == 0 {
            return Err(BridgeError::Config("max_frame_bytes must be positive".into()));
        }
        if self.auth_token.as_deref().is_some_and(|t| t.contains('\n')) {
            return Err(BridgeError::Config("auth_token must be a single line".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn callback_read_timeout(&self) -> Option<Duration> {
        self.callback_read_timeout_ms.map(Duration::from_millis)
    }

    /// Settings for the callback channel
    pub fn callback_settings(&self) -> CallbackSettings {
        CallbackSettings {
            address: self.callback_address.clone(),
            client: ClientOptions {
                auth_token: self.auth_token.clone(),
                connect_timeout: self.connect_timeout(),
                read_timeout: self.callback_read_timeout(),
                max_frame_bytes: self.max_frame_bytes,
            },
            auto_release: self.auto_release_proxies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_conventional_ports() {
        let config = GatewayConfig::default();
        assert_eq!(config.address, "127.0.0.1:25333");
        assert_eq!(config.callback_address.as_deref(), Some("127.0.0.1:25334"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: GatewayConfig =
            serde_json::from_str(r#"{"address": "127.0.0.1:4000", "auth_token": "s3cret"}"#)
                .unwrap();
        assert_eq!(config.address, "127.0.0.1:4000");
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(2));
        assert_eq!(config.callback_settings().client.auth_token.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_json_file_round_trip() {
        let path = std::env::temp_dir().join(format!("objbridge-config-{}.json", std::process::id()));
        let config = GatewayConfig {
            callback_address: None,
            ..Default::default()
        };
        std::fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();
        let loaded = GatewayConfig::from_json_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);

        assert!(matches!(
            GatewayConfig::from_json_file(path),
            Err(BridgeError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_ADDRESS, "0.0.0.0:9000"),
            (ENV_CALLBACK_ADDRESS, ""),
            (ENV_AUTH_TOKEN, "tok"),
        ]
        .into_iter()
        .collect();
        let config = GatewayConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.address, "0.0.0.0:9000");
        assert_eq!(config.callback_address, None);
        assert_eq!(config.auth_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_validate_rejects_bad_addresses() {
        let config = GatewayConfig {
            address: "localhost".into(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }
}
