//! Client configuration.
//!
//! Settings are layered: built-in defaults, then an optional JSON file, then
//! `STOMP_JSONRPC_*` environment variables. The file is looked up at
//!
//! 1. the explicit path handed to [`ClientConfig::load`]
//! 2. `$STOMP_JSONRPC_CONFIG`
//! 3. `<config dir>/stomp-jsonrpc/config.json`
//!
//! A missing file at (3) is not an error; a missing file at (1) or (2) is.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::error::ClientError;
use crate::reactor::{shared, StaticTlsMaterial, TlsMaterialProvider};
use crate::rpc::{
    ClientPolicy, Destinations, JsonRpcClient, DEFAULT_REQUEST_DESTINATION,
    DEFAULT_RESPONSE_DESTINATION,
};
use crate::stomp::StompClient;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "STOMP_JSONRPC_";

/// Variable naming an explicit configuration file.
pub const CONFIG_ENV: &str = "STOMP_JSONRPC_CONFIG";

pub const DEFAULT_PLAIN_PORT: u16 = 61613;
pub const DEFAULT_TLS_PORT: u16 = 61614;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),
}

/// Where to connect and whether to wrap the link in TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `stomp://host:port` or `stomp+ssl://host:port`.
    pub url: String,
    pub retry_timeout_ms: u64,
    pub retry_number: u32,
    pub incoming_heartbeat_ms: u64,
    pub outgoing_heartbeat_ms: u64,
    pub handshake_timeout_ms: u64,
    pub request_destination: String,
    pub response_destination: String,
    /// Worker pool threads for response dispatch and event delivery.
    pub parallelism: usize,
    pub event_retention_hours: u64,
    /// DER-encoded trust anchor for `stomp+ssl` endpoints.
    pub trust_anchor: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: format!("stomp://localhost:{}", DEFAULT_PLAIN_PORT),
            retry_timeout_ms: 10_000,
            retry_number: 3,
            incoming_heartbeat_ms: 0,
            outgoing_heartbeat_ms: 0,
            handshake_timeout_ms: 10_000,
            request_destination: DEFAULT_REQUEST_DESTINATION.to_string(),
            response_destination: DEFAULT_RESPONSE_DESTINATION.to_string(),
            parallelism: 4,
            event_retention_hours: 3,
            trust_anchor: None,
        }
    }
}

impl ClientConfig {
    /// Resolve defaults, file and environment into one configuration.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `STOMP_JSONRPC_*` overrides found through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            let key = format!("{}{}", ENV_PREFIX, name);
            lookup(&key).map(|value| (key, value))
        };

        if let Some((_, value)) = get("URL") {
            self.url = value;
        }
        if let Some((key, value)) = get("RETRY_TIMEOUT_MS") {
            self.retry_timeout_ms = parse_number(key, value)?;
        }
        if let Some((key, value)) = get("RETRY_NUMBER") {
            self.retry_number = parse_number(key, value)?;
        }
        if let Some((key, value)) = get("INCOMING_HEARTBEAT_MS") {
            self.incoming_heartbeat_ms = parse_number(key, value)?;
        }
        if let Some((key, value)) = get("OUTGOING_HEARTBEAT_MS") {
            self.outgoing_heartbeat_ms = parse_number(key, value)?;
        }
        if let Some((key, value)) = get("HANDSHAKE_TIMEOUT_MS") {
            self.handshake_timeout_ms = parse_number(key, value)?;
        }
        if let Some((_, value)) = get("REQUEST_DESTINATION") {
            self.request_destination = value;
        }
        if let Some((_, value)) = get("RESPONSE_DESTINATION") {
            self.response_destination = value;
        }
        if let Some((key, value)) = get("PARALLELISM") {
            self.parallelism = parse_number(key, value)?;
        }
        if let Some((key, value)) = get("EVENT_RETENTION_HOURS") {
            self.event_retention_hours = parse_number(key, value)?;
        }
        if let Some((_, value)) = get("TRUST_ANCHOR") {
            self.trust_anchor = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {}", self.url, e)))?;
        let (tls, default_port) = match url.scheme() {
            "stomp" | "tcp" => (false, DEFAULT_PLAIN_PORT),
            "stomp+ssl" | "ssl" => (true, DEFAULT_TLS_PORT),
            other => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "{}: unsupported scheme {}",
                    self.url, other
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{}: missing host", self.url)))?;
        Ok(Endpoint {
            host: host.to_string(),
            port: url.port().unwrap_or(default_port),
            tls,
        })
    }

    pub fn policy(&self) -> ClientPolicy {
        ClientPolicy::new(
            Duration::from_millis(self.retry_timeout_ms),
            self.retry_number,
            Duration::from_millis(self.incoming_heartbeat_ms),
            Duration::from_millis(self.outgoing_heartbeat_ms),
            ClientPolicy::default().retryable_kinds().to_vec(),
        )
    }

    pub fn destinations(&self) -> Destinations {
        Destinations {
            requests: self.request_destination.clone(),
            responses: self.response_destination.clone(),
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_hours * 60 * 60)
    }

    /// Build a [`JsonRpcClient`] on the shared reactors and worker.
    ///
    /// `tls` overrides the trust anchor file for `stomp+ssl` endpoints. The
    /// link is dialled lazily by the first call unless the caller connects.
    pub fn open(&self, tls: Option<Arc<dyn TlsMaterialProvider>>) -> Result<JsonRpcClient, ClientError> {
        let endpoint = self
            .endpoint()
            .map_err(|e| ClientError::Misuse(e.to_string()))?;
        let reactor = if endpoint.tls {
            let provider = match tls {
                Some(provider) => provider,
                None => self.trust_anchor_material()?,
            };
            shared::tls_reactor(provider)?
        } else {
            shared::plain_reactor()?
        };

        let transport = reactor.create_client(&endpoint.host, endpoint.port, Arc::new(self.policy()));
        let stomp = StompClient::new(transport, self.handshake_timeout());
        let worker = shared::response_worker(self.parallelism, self.event_retention())?;
        info!(
            "Opened client for {}:{} (tls: {})",
            endpoint.host, endpoint.port, endpoint.tls
        );
        worker.register(stomp, self.destinations())
    }

    fn trust_anchor_material(&self) -> Result<Arc<dyn TlsMaterialProvider>, ClientError> {
        let path = self.trust_anchor.as_ref().ok_or_else(|| {
            ClientError::Tls(format!("{} requires a trust anchor", self.url))
        })?;
        let der = std::fs::read(path).map_err(|e| {
            ClientError::Tls(format!("failed to read trust anchor {}: {}", path.display(), e))
        })?;
        let material = StaticTlsMaterial::from_der(vec![CertificateDer::from(der)], None)?;
        Ok(Arc::new(material))
    }
}

/// `<config dir>/stomp-jsonrpc/config.json`, when the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("stomp-jsonrpc").join("config.json"))
}

fn parse_number<T: std::str::FromStr>(key: String, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint {
                host: "localhost".to_string(),
                port: 61613,
                tls: false
            }
        );
        let policy = config.policy();
        assert_eq!(policy.retry_timeout(), Duration::from_secs(10));
        assert_eq!(policy.retry_number(), 3);
        assert!(!policy.is_incoming_heartbeat());
        assert_eq!(config.destinations(), Destinations::default());
        assert_eq!(config.event_retention(), Duration::from_secs(3 * 60 * 60));
    }

    #[test]
    fn test_file_fills_missing_fields_with_defaults() {
        let dir = std::env::temp_dir().join(format!("stomp-jsonrpc-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(
            &path,
            r#"{"url": "stomp+ssl://broker.example:7000", "retry_number": 5, "incoming_heartbeat_ms": 2000}"#,
        )
        .unwrap();

        let config = ClientConfig::from_file(&path).unwrap();
        assert_eq!(config.retry_number, 5);
        assert_eq!(config.retry_timeout_ms, 10_000);
        assert_eq!(
            config.endpoint().unwrap(),
            Endpoint {
                host: "broker.example".to_string(),
                port: 7000,
                tls: true
            }
        );
        assert!(config.policy().is_incoming_heartbeat());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = ClientConfig::from_file(Path::new("/nonexistent/stomp-jsonrpc.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ClientConfig::default();
        config
            .apply_env(env(&[
                ("STOMP_JSONRPC_URL", "stomp://10.0.0.5"),
                ("STOMP_JSONRPC_RETRY_TIMEOUT_MS", "250"),
                ("STOMP_JSONRPC_RETRY_NUMBER", " 2 "),
                ("STOMP_JSONRPC_RESPONSE_DESTINATION", "replies.host-1"),
            ]))
            .unwrap();

        assert_eq!(config.retry_timeout_ms, 250);
        assert_eq!(config.retry_number, 2);
        assert_eq!(config.response_destination, "replies.host-1");
        assert_eq!(config.request_destination, "rpc.requests");
        assert_eq!(config.endpoint().unwrap().port, DEFAULT_PLAIN_PORT);
    }

    #[test]
    fn test_env_rejects_garbage_numbers() {
        let mut config = ClientConfig::default();
        let err = config
            .apply_env(env(&[("STOMP_JSONRPC_PARALLELISM", "many")]))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value for STOMP_JSONRPC_PARALLELISM: \"many\""
        );
    }

    #[test]
    fn test_endpoint_validation() {
        let mut config = ClientConfig::default();
        config.url = "http://localhost:8080".to_string();
        assert!(matches!(config.endpoint(), Err(ConfigError::InvalidEndpoint(_))));

        config.url = "stomp+ssl://secure.example".to_string();
        assert_eq!(config.endpoint().unwrap().port, DEFAULT_TLS_PORT);
    }

    #[test]
    fn test_tls_endpoint_without_trust_anchor() {
        let mut config = ClientConfig::default();
        config.url = "stomp+ssl://secure.example".to_string();
        assert!(matches!(config.open(None), Err(ClientError::Tls(_))));
    }
}
