//! Command-line surface.
//!
//! Every flag may also be set through a `KVNODE_*` environment variable;
//! flags win over the environment, which wins over the YAML file, which
//! wins over built-in defaults.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{load_config, Config, ConfigError, ProxyMode};

/// Flags from the previous release line.  Accepted and ignored.
pub const DEPRECATED_FLAGS: &[&str] = &[
    "addr",
    "cluster-active-size",
    "cluster-remove-delay",
    "cluster-sync-interval",
    "force",
    "max-result-buffer",
    "max-retry-attempts",
    "peer-addr",
    "peer-heartbeat-interval",
    "peer-election-timeout",
    "retry-interval",
    "snapshot",
    "v",
    "vv",
];

/// Deprecated flags that are switches and never take a value.
const DEPRECATED_SWITCHES: &[&str] = &["force", "snapshot", "v", "vv"];

/// Command-line arguments for a kvnode process.
#[derive(Parser, Debug, Default)]
#[command(
    name = "kvnode",
    version,
    about = "Replicated key-value node and proxy"
)]
pub struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long, env = "KVNODE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Unique human-readable name for this node.
    #[arg(long, env = "KVNODE_NAME")]
    pub name: Option<String>,

    /// Peer service address (e.g. ':7001').
    #[arg(long = "peer-bind-addr", env = "KVNODE_PEER_BIND_ADDR")]
    pub peer_bind_addr: Option<String>,

    /// Path to the data directory.
    #[arg(long = "data-dir", env = "KVNODE_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Discovery service used to bootstrap the cluster.
    #[arg(long, env = "KVNODE_DISCOVERY")]
    pub discovery: Option<String>,

    /// Comma-separated public URLs used for peer communication.
    #[arg(
        long = "advertised-peer-urls",
        env = "KVNODE_ADVERTISED_PEER_URLS",
        value_delimiter = ','
    )]
    pub advertised_peer_urls: Option<Vec<String>>,

    /// Number of committed entries to trigger a snapshot.
    #[arg(
        long = "snapshot-count",
        env = "KVNODE_SNAPSHOT_COUNT",
        allow_negative_numbers = true
    )]
    pub snapshot_count: Option<i64>,

    /// Comma-separated client service addresses.
    #[arg(long = "bind-addr", env = "KVNODE_BIND_ADDR", value_delimiter = ',')]
    pub bind_addrs: Option<Vec<String>>,

    /// Initial cluster configuration for bootstrapping.
    #[arg(long = "bootstrap-config", env = "KVNODE_BOOTSTRAP_CONFIG")]
    pub bootstrap_config: Option<String>,

    /// Comma-separated allow-list of origins for CORS.
    #[arg(long, env = "KVNODE_CORS", value_delimiter = ',')]
    pub cors: Option<Vec<String>>,

    /// Proxy mode.
    #[arg(long, env = "KVNODE_PROXY", value_enum)]
    pub proxy: Option<ProxyMode>,

    /// Path to the client server TLS CA file.
    #[arg(long = "ca-file", env = "KVNODE_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    /// Path to the client server TLS cert file.
    #[arg(long = "cert-file", env = "KVNODE_CERT_FILE")]
    pub cert_file: Option<PathBuf>,

    /// Path to the client server TLS key file.
    #[arg(long = "key-file", env = "KVNODE_KEY_FILE")]
    pub key_file: Option<PathBuf>,

    /// Path to the peer server TLS CA file.
    #[arg(long = "peer-ca-file", env = "KVNODE_PEER_CA_FILE")]
    pub peer_ca_file: Option<PathBuf>,

    /// Path to the peer server TLS cert file.
    #[arg(long = "peer-cert-file", env = "KVNODE_PEER_CERT_FILE")]
    pub peer_cert_file: Option<PathBuf>,

    /// Path to the peer server TLS key file.
    #[arg(long = "peer-key-file", env = "KVNODE_PEER_KEY_FILE")]
    pub peer_key_file: Option<PathBuf>,

    /// Client request timeout in milliseconds.
    #[arg(long = "timeout-ms", env = "KVNODE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", env = "KVNODE_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log format (text or json).
    #[arg(long = "log-format", env = "KVNODE_LOG_FORMAT")]
    pub log_format: Option<String>,
}

impl Cli {
    /// Resolve the final configuration: file (if any), then flag overrides.
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => Config::default(),
        };

        if let Some(v) = self.name {
            config.name = v;
        }
        if let Some(v) = self.peer_bind_addr {
            config.peer_bind_addr = v;
        }
        if let Some(v) = self.data_dir {
            config.data_dir = Some(v);
        }
        if let Some(v) = self.discovery {
            config.discovery = Some(v).filter(|d| !d.is_empty());
        }
        if let Some(v) = self.advertised_peer_urls {
            config.advertised_peer_urls = non_empty(v);
        }
        if let Some(v) = self.snapshot_count {
            config.snapshot_count = v;
        }
        if let Some(v) = self.bind_addrs {
            config.bind_addrs = non_empty(v);
        }
        if let Some(v) = self.bootstrap_config {
            config.bootstrap_config = v;
        }
        if let Some(v) = self.cors {
            config.cors = non_empty(v);
        }
        if let Some(v) = self.proxy {
            config.proxy = v;
        }
        overlay(&mut config.client_tls.ca_file, self.ca_file);
        overlay(&mut config.client_tls.cert_file, self.cert_file);
        overlay(&mut config.client_tls.key_file, self.key_file);
        overlay(&mut config.peer_tls.ca_file, self.peer_ca_file);
        overlay(&mut config.peer_tls.cert_file, self.peer_cert_file);
        overlay(&mut config.peer_tls.key_file, self.peer_key_file);
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.log_level {
            config.logging.level = v;
        }
        if let Some(v) = self.log_format {
            config.logging.format = v;
        }

        Ok(config)
    }
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Split deprecated flags out of `args`.
///
/// Returns the arguments to hand to clap and the names of the deprecated
/// flags that were dropped.  `--flag=value` is dropped as a whole; a
/// valued flag written as `--flag value` also takes the next argument
/// with it unless that argument is itself a flag.
pub fn strip_deprecated_flags<I>(args: I) -> (Vec<String>, Vec<String>)
where
    I: IntoIterator<Item = String>,
{
    let mut kept = Vec::new();
    let mut ignored = Vec::new();
    let mut args = args.into_iter().peekable();
    while let Some(arg) = args.next() {
        let Some(name) = deprecated_name(&arg) else {
            kept.push(arg);
            continue;
        };
        let takes_value = !arg.contains('=') && !DEPRECATED_SWITCHES.contains(&name);
        if takes_value && args.peek().is_some_and(|next| !next.starts_with('-')) {
            args.next();
        }
        ignored.push(name.to_string());
    }
    (kept, ignored)
}

fn deprecated_name(arg: &str) -> Option<&'static str> {
    let bare = arg.strip_prefix("--").or_else(|| arg.strip_prefix('-'))?;
    let name = bare.split_once('=').map_or(bare, |(n, _)| n);
    DEPRECATED_FLAGS.iter().copied().find(|d| *d == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_strip_deprecated_flags() {
        let (kept, ignored) = strip_deprecated_flags(args(&[
            "kvnode",
            "--name",
            "n1",
            "-v",
            "--peer-addr=10.0.0.1:7001",
            "--snapshot",
            "--data-dir",
            "/var/lib/kvnode",
        ]));
        assert_eq!(
            kept,
            args(&["kvnode", "--name", "n1", "--data-dir", "/var/lib/kvnode"])
        );
        assert_eq!(ignored, args(&["v", "peer-addr", "snapshot"]));
    }

    #[test]
    fn test_deprecated_flag_drops_separate_value() {
        let (kept, ignored) = strip_deprecated_flags(args(&[
            "kvnode",
            "--peer-addr",
            "10.0.0.1:7001",
            "--name",
            "n1",
        ]));
        assert_eq!(kept, args(&["kvnode", "--name", "n1"]));
        assert_eq!(ignored, args(&["peer-addr"]));
        let cli = Cli::try_parse_from(kept).unwrap();
        assert_eq!(cli.into_config().unwrap().name, "n1");
    }

    #[test]
    fn test_deprecated_flag_followed_by_flag_takes_no_value() {
        let (kept, ignored) =
            strip_deprecated_flags(args(&["kvnode", "-force", "--addr", "--name", "n1"]));
        assert_eq!(kept, args(&["kvnode", "--name", "n1"]));
        assert_eq!(ignored, args(&["force", "addr"]));
    }

    #[test]
    fn test_non_deprecated_prefix_is_kept() {
        let (kept, ignored) = strip_deprecated_flags(args(&["kvnode", "--addresses", "--vvv"]));
        assert_eq!(kept.len(), 3);
        assert!(ignored.is_empty());
    }

    #[test]
    fn test_flags_override_defaults() {
        let cli = Cli::parse_from([
            "kvnode",
            "--name",
            "n2",
            "--bind-addr",
            "127.0.0.1:4001,127.0.0.1:4002",
            "--bootstrap-config",
            "n2=http://127.0.0.1:7002",
            "--snapshot-count",
            "50",
            "--proxy",
            "readonly",
            "--cors",
            "http://a.example,http://b.example",
            "--peer-cert-file",
            "/tls/peer.crt",
            "--peer-key-file",
            "/tls/peer.key",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.name, "n2");
        assert_eq!(
            config.bind_addrs,
            args(&["127.0.0.1:4001", "127.0.0.1:4002"])
        );
        assert_eq!(config.snapshot_count, 50);
        assert_eq!(config.proxy, ProxyMode::ReadOnly);
        assert_eq!(config.cors.len(), 2);
        assert!(config.peer_tls.serves_tls());
        assert!(config.client_tls.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_negative_snapshot_count_parses_then_fails_validation() {
        let cli = Cli::parse_from(["kvnode", "--snapshot-count", "-1"]);
        let config = cli.into_config().unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::SnapshotCount(-1))
        ));
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvnode.yaml");
        std::fs::write(&path, "name: from-file\ntimeout_ms: 2500\n").unwrap();

        let cli = Cli::parse_from([
            "kvnode",
            "--config",
            path.to_str().unwrap(),
            "--name",
            "from-flag",
        ]);
        let config = cli.into_config().unwrap();
        assert_eq!(config.name, "from-flag");
        assert_eq!(config.timeout_ms, 2500);
    }
}
