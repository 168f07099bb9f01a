//! Configuration loading and types for kvnode.
//!
//! Configuration is read from an optional YAML file, overridden by
//! environment variables and command-line flags (see [`crate::cli`]), and
//! frozen into a [`Config`] that is passed by reference to everything that
//! needs it.  Nothing reads configuration from global state.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::cluster::{Cluster, ClusterError};

/// Default number of committed entries between snapshots.
pub const DEFAULT_SNAPSHOT_COUNT: i64 = 10_000;

/// Configuration errors.  All are detected before any I/O.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid bootstrap-config: {0}")]
    Cluster(#[from] ClusterError),

    #[error("no member with name={0:?} exists")]
    UnknownMember(String),

    #[error("snapshot-count must be greater than 0: snapshot-count={0}")]
    SnapshotCount(i64),

    #[error("at least one bind-addr is required")]
    NoBindAddrs,

    #[error("discovery requires advertised-peer-urls")]
    DiscoveryWithoutAdvertisedUrls,

    #[error("invalid URL {url:?} for {field}")]
    InvalidUrl { field: &'static str, url: String },

    #[error("{channel} TLS requires both cert-file and key-file")]
    IncompleteTls { channel: &'static str },
}

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Unique human-readable name for this node.
    #[serde(default = "default_name")]
    pub name: String,

    /// Peer service address (e.g. `:7001` or `10.0.0.1:7001`).
    #[serde(default = "default_peer_bind_addr")]
    pub peer_bind_addr: String,

    /// Data directory.  Defaults to `<member id>_kvnode_data`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Discovery service used to bootstrap the cluster.
    #[serde(default)]
    pub discovery: Option<String>,

    /// Public URLs this node advertises for peer traffic.
    #[serde(default)]
    pub advertised_peer_urls: Vec<String>,

    /// Committed entries between snapshots.
    #[serde(default = "default_snapshot_count")]
    pub snapshot_count: i64,

    /// Client service addresses.
    #[serde(default = "default_bind_addrs")]
    pub bind_addrs: Vec<String>,

    /// Initial cluster configuration, `name=url[,name=url...]`.
    #[serde(default = "default_bootstrap_config")]
    pub bootstrap_config: String,

    /// Allowed CORS origins; `*` allows any.
    #[serde(default)]
    pub cors: Vec<String>,

    /// Run as a node or as a forwarding proxy.
    #[serde(default)]
    pub proxy: ProxyMode,

    /// TLS material for the client listeners.
    #[serde(default)]
    pub client_tls: TlsInfo,

    /// TLS material for the peer listener and outbound peer traffic.
    #[serde(default)]
    pub peer_tls: TlsInfo,

    /// Client request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            peer_bind_addr: default_peer_bind_addr(),
            data_dir: None,
            discovery: None,
            advertised_peer_urls: Vec::new(),
            snapshot_count: default_snapshot_count(),
            bind_addrs: default_bind_addrs(),
            bootstrap_config: default_bootstrap_config(),
            cors: Vec::new(),
            proxy: ProxyMode::default(),
            client_tls: TlsInfo::default(),
            peer_tls: TlsInfo::default(),
            timeout_ms: default_timeout_ms(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Check everything that can be checked without touching disk or network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snapshot_count <= 0 {
            return Err(ConfigError::SnapshotCount(self.snapshot_count));
        }
        if self.bind_addrs.is_empty() {
            return Err(ConfigError::NoBindAddrs);
        }
        self.cluster()?;
        if let Some(url) = &self.discovery {
            check_url("discovery", url)?;
        }
        for url in &self.advertised_peer_urls {
            check_url("advertised-peer-urls", url)?;
        }
        self.client_tls.validate("client")?;
        self.peer_tls.validate("peer")?;
        Ok(())
    }

    /// The locally configured cluster.
    pub fn cluster(&self) -> Result<Cluster, ConfigError> {
        Ok(Cluster::parse(&self.bootstrap_config)?)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Operating mode selector.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    /// Run a consensus participant.
    #[default]
    Off,
    /// Forward client requests, rejecting mutations.
    #[serde(rename = "readonly")]
    #[value(name = "readonly")]
    ReadOnly,
    /// Forward all client requests.
    On,
}

/// Paths to TLS material for one channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TlsInfo {
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl TlsInfo {
    pub fn is_empty(&self) -> bool {
        self.cert_file.is_none() && self.key_file.is_none() && self.ca_file.is_none()
    }

    /// Whether a server certificate is configured.
    pub fn serves_tls(&self) -> bool {
        self.cert_file.is_some()
    }

    pub fn scheme(&self) -> &'static str {
        if self.serves_tls() {
            "https"
        } else {
            "http"
        }
    }

    fn validate(&self, channel: &'static str) -> Result<(), ConfigError> {
        if self.cert_file.is_some() != self.key_file.is_some() {
            return Err(ConfigError::IncompleteTls { channel });
        }
        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn check_url(field: &'static str, url: &str) -> Result<(), ConfigError> {
    match reqwest::Url::parse(url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(ConfigError::InvalidUrl {
            field,
            url: url.to_string(),
        }),
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_name() -> String {
    "default".to_string()
}

fn default_peer_bind_addr() -> String {
    ":7001".to_string()
}

fn default_snapshot_count() -> i64 {
    DEFAULT_SNAPSHOT_COUNT
}

fn default_bind_addrs() -> Vec<String> {
    vec!["127.0.0.1:4001".to_string()]
}

fn default_bootstrap_config() -> String {
    "default=http://localhost:7001".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.name, "default");
        assert_eq!(config.snapshot_count, DEFAULT_SNAPSHOT_COUNT);
        assert_eq!(config.proxy, ProxyMode::Off);
        assert!(config.cluster().unwrap().find_name("default").is_some());
    }

    #[test]
    fn test_load_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvnode.yaml");
        std::fs::write(
            &path,
            r#"
name: n1
bootstrap_config: "n1=http://10.0.0.1:7001,n2=http://10.0.0.2:7001"
bind_addrs: ["0.0.0.0:4001", "0.0.0.0:4002"]
cors: ["http://example.com"]
proxy: readonly
peer_tls:
  cert_file: /etc/kvnode/peer.crt
  key_file: /etc/kvnode/peer.key
logging:
  format: json
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.name, "n1");
        assert_eq!(config.bind_addrs.len(), 2);
        assert_eq!(config.proxy, ProxyMode::ReadOnly);
        assert!(config.peer_tls.serves_tls());
        assert_eq!(config.peer_tls.scheme(), "https");
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.timeout_ms, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/kvnode.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_validate_snapshot_count() {
        let config = Config {
            snapshot_count: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SnapshotCount(0))
        ));
        let config = Config {
            snapshot_count: -5,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SnapshotCount(-5))
        ));
    }

    #[test]
    fn test_validate_incomplete_tls() {
        let config = Config {
            client_tls: TlsInfo {
                cert_file: Some("/tmp/c.pem".into()),
                ..TlsInfo::default()
            },
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::IncompleteTls { channel: "client" })
        ));
    }

    #[test]
    fn test_validate_bad_urls() {
        let config = Config {
            discovery: Some("not a url".into()),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl {
                field: "discovery",
                ..
            })
        ));

        let config = Config {
            bootstrap_config: "n1".into(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Cluster(_))));
    }

    #[test]
    fn test_validate_requires_bind_addr() {
        let config = Config {
            bind_addrs: vec![],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::NoBindAddrs)));
    }
}
