//! Configuration management

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::Parser;
use jet_token::{KeyStore, TargetAddr, TokenKind, ValidatorConfig, VerificationKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::association::NegotiationConfig;

/// Prefix marking an inline base64 HMAC secret instead of a PEM path
const SECRET_PREFIX: &str = "secret:";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid key {path:?}: {reason}")]
    Key { path: String, reason: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command line arguments
#[derive(Debug, Default, Parser)]
#[command(name = "jet-relay", version, about = "JET relay server")]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'f', long)]
    pub config: Option<PathBuf>,

    /// Management API listen address
    #[arg(long)]
    pub http_listener: Option<SocketAddr>,

    /// Relay listener URL (tcp://ip:port or tls://ip:port), repeatable
    #[arg(short = 'l', long = "listener")]
    pub listeners: Vec<String>,

    /// Instance ID matched against `jet_gw_id`
    #[arg(long)]
    pub id: Option<Uuid>,

    /// Provisioner key: PEM file path or `secret:<base64>`
    #[arg(long)]
    pub provisioner_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerScheme {
    Tcp,
    Tls,
}

impl fmt::Display for ListenerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ListenerScheme::Tcp => "tcp",
            ListenerScheme::Tls => "tls",
        })
    }
}

/// A relay listener, `tcp://0.0.0.0:8181` or `tls://0.0.0.0:8443`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerUrl {
    pub scheme: ListenerScheme,
    pub addr: SocketAddr,
}

impl ListenerUrl {
    pub fn parse(url: &str) -> Result<Self, ConfigError> {
        let target = TargetAddr::parse(url, None)
            .map_err(|e| ConfigError::Invalid(format!("listener {url:?}: {e}")))?;
        let scheme = match target.scheme() {
            "tcp" => ListenerScheme::Tcp,
            "tls" => ListenerScheme::Tls,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "listener {url:?}: unsupported scheme {other:?}"
                )))
            }
        };
        let addr = target
            .authority()
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listener {url:?}: {e}")))?;
        Ok(Self { scheme, addr })
    }
}

impl fmt::Display for ListenerUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.addr)
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub id: Option<Uuid>,
    /// Where a generated instance ID is kept across restarts
    pub id_file: PathBuf,
    pub hostname: String,
    pub http_listener: SocketAddr,
    pub listeners: Vec<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
    pub provisioner_key: Option<String>,
    pub key_overrides: HashMap<String, String>,
    pub jrl_file: PathBuf,
    pub token_leeway_secs: u64,
    pub negotiation_timeout_secs: u64,
    pub connection_test_timeout_secs: u64,
    pub dial_timeout_secs: u64,
    pub recording_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    pub session_history: usize,
    pub shutdown_timeout_secs: u64,
    pub unsafe_allow_unsigned_tokens: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            id: None,
            id_file: PathBuf::from("relay.id"),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned()),
            http_listener: SocketAddr::from(([0, 0, 0, 0], 7171)),
            listeners: vec!["tcp://0.0.0.0:8181".to_owned()],
            tls_cert_path: None,
            tls_key_path: None,
            provisioner_key: None,
            key_overrides: HashMap::new(),
            jrl_file: PathBuf::from("jrl.json"),
            token_leeway_secs: 10 * 60,
            negotiation_timeout_secs: 30,
            connection_test_timeout_secs: 10,
            dial_timeout_secs: 10,
            recording_dir: None,
            log_file: None,
            session_history: 100,
            shutdown_timeout_secs: 30,
            unsafe_allow_unsigned_tokens: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration: defaults, then TOML file, then environment, then CLI
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("JET_RELAY_CONFIG").ok().map(PathBuf::from));

        let mut config = match config_path {
            Some(path) => Self::from_toml_file(&path)?,
            None => Self::default(),
        };

        config.apply_env()?;
        config.apply_cli(cli);

        config.validate()?;

        if config.id.is_none() {
            config.id = Some(load_or_create_id(&config.id_file)?);
        }
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(id) = std::env::var("JET_RELAY_ID") {
            self.id = Some(
                id.parse()
                    .map_err(|e| ConfigError::Invalid(format!("Invalid JET_RELAY_ID: {e}")))?,
            );
        }

        if let Ok(addr) = std::env::var("JET_RELAY_HTTP_LISTENER") {
            self.http_listener = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid JET_RELAY_HTTP_LISTENER: {e}")))?;
        }

        if let Ok(listeners) = std::env::var("JET_RELAY_LISTENERS") {
            self.listeners = listeners
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect();
        }

        if let Ok(key) = std::env::var("JET_RELAY_PROVISIONER_KEY") {
            self.provisioner_key = Some(key);
        }

        if let Ok(path) = std::env::var("JET_RELAY_ID_FILE") {
            self.id_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("JET_RELAY_JRL_FILE") {
            self.jrl_file = PathBuf::from(path);
        }

        if let Ok(path) = std::env::var("JET_RELAY_RECORDING_DIR") {
            self.recording_dir = Some(PathBuf::from(path));
        }

        if let Ok(path) = std::env::var("JET_RELAY_LOG_FILE") {
            self.log_file = Some(PathBuf::from(path));
        }

        Ok(())
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(addr) = cli.http_listener {
            self.http_listener = addr;
        }
        if !cli.listeners.is_empty() {
            self.listeners = cli.listeners.clone();
        }
        if let Some(id) = cli.id {
            self.id = Some(id);
        }
        if let Some(key) = &cli.provisioner_key {
            self.provisioner_key = Some(key.clone());
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provisioner_key.is_none() {
            return Err(ConfigError::Invalid("provisioner_key is required".to_owned()));
        }

        if self.negotiation_timeout_secs == 0 {
            return Err(ConfigError::Invalid("negotiation_timeout_secs must be > 0".to_owned()));
        }

        if self.connection_test_timeout_secs == 0 || self.dial_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connection_test_timeout_secs and dial_timeout_secs must be > 0".to_owned(),
            ));
        }

        let listeners = self.listener_urls()?;
        let wants_tls = listeners.iter().any(|l| l.scheme == ListenerScheme::Tls);
        if wants_tls && (self.tls_cert_path.is_none() || self.tls_key_path.is_none()) {
            return Err(ConfigError::Invalid(
                "tls listeners require tls_cert_path and tls_key_path".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn instance_id(&self) -> Uuid {
        self.id.unwrap_or_else(Uuid::nil)
    }

    pub fn listener_urls(&self) -> Result<Vec<ListenerUrl>, ConfigError> {
        self.listeners.iter().map(|url| ListenerUrl::parse(url)).collect()
    }

    pub fn key_store(&self) -> Result<KeyStore, ConfigError> {
        let provisioner = self
            .provisioner_key
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("provisioner_key is required".to_owned()))?;

        let mut store = KeyStore::new(load_key(provisioner)?);
        for (kind, spec) in &self.key_overrides {
            let kind: TokenKind = kind
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("key_overrides: {e}")))?;
            store = store.with_override(kind, load_key(spec)?);
        }
        Ok(store)
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            instance_id: self.instance_id(),
            leeway_secs: i64::try_from(self.token_leeway_secs).unwrap_or(i64::MAX),
            allow_unsigned: self.unsafe_allow_unsigned_tokens,
        }
    }

    pub fn negotiation_config(&self) -> NegotiationConfig {
        NegotiationConfig {
            negotiation_timeout: Duration::from_secs(self.negotiation_timeout_secs),
            connection_test_timeout: Duration::from_secs(self.connection_test_timeout_secs),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
        }
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(self.dial_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Load a verification key from `secret:<base64>` or a PEM file path
pub fn load_key(spec: &str) -> Result<VerificationKey, ConfigError> {
    let key_error = |reason: String| ConfigError::Key {
        path: spec.strip_prefix(SECRET_PREFIX).map_or(spec, |_| "<inline secret>").to_owned(),
        reason,
    };

    if let Some(encoded) = spec.strip_prefix(SECRET_PREFIX) {
        let secret = STANDARD.decode(encoded.trim()).map_err(|e| key_error(e.to_string()))?;
        return VerificationKey::from_secret(&secret).map_err(|e| key_error(e.to_string()));
    }

    let pem = std::fs::read(spec).map_err(|e| key_error(e.to_string()))?;
    VerificationKey::from_pem(&pem).map_err(|e| key_error(e.to_string()))
}

/// Read the instance ID kept at `path`, generating and saving one if absent
fn load_or_create_id(path: &Path) -> Result<Uuid, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(content) => content
            .trim()
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("Invalid instance ID in {path:?}: {e}"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let id = Uuid::new_v4();
            if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(path, format!("{id}\n"))?;
            Ok(id)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_need_a_key() {
        let config = ServerConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.token_leeway_secs, 600);
        assert_eq!(config.negotiation_timeout_secs, 30);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            provisioner_key = "secret:c2VjcmV0"
            listeners = ["tcp://127.0.0.1:8181", "tls://[::1]:8443"]
            negotiation_timeout_secs = 5

            [key_overrides]
            JRL = "secret:anJs"
            "#,
        )
        .unwrap();

        assert_eq!(config.negotiation_timeout_secs, 5);
        assert_eq!(config.dial_timeout_secs, 10);
        assert!(config.key_store().is_ok());

        let listeners = config.listener_urls().unwrap();
        assert_eq!(listeners[0].scheme, ListenerScheme::Tcp);
        assert_eq!(listeners[1].addr, "[::1]:8443".parse().unwrap());

        // tls listener without a certificate
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listener_url_rejects_hostnames_and_schemes() {
        assert!(ListenerUrl::parse("udp://0.0.0.0:1").is_err());
        assert!(ListenerUrl::parse("tcp://relay.example:8181").is_err());
        assert_eq!(
            ListenerUrl::parse("tcp://0.0.0.0:8181").unwrap().to_string(),
            "tcp://0.0.0.0:8181"
        );
    }

    #[test]
    fn test_load_key_variants() {
        assert!(load_key("secret:c2VjcmV0").is_ok());
        assert!(matches!(load_key("secret:***"), Err(ConfigError::Key { .. })));
        assert!(matches!(
            load_key("/nonexistent/provisioner.pem"),
            Err(ConfigError::Key { .. })
        ));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::parse_from([
            "jet-relay",
            "--listener",
            "tcp://127.0.0.1:9000",
            "--provisioner-key",
            "secret:c2VjcmV0",
        ]);
        let mut config = ServerConfig::default();
        config.apply_cli(&cli);
        assert_eq!(config.listeners, vec!["tcp://127.0.0.1:9000".to_owned()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generated_id_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("relay.id");

        let first = load_or_create_id(&path).unwrap();
        assert_eq!(load_or_create_id(&path).unwrap(), first);

        std::fs::write(&path, "not-a-uuid").unwrap();
        assert!(matches!(load_or_create_id(&path), Err(ConfigError::Invalid(_))));
    }
}
