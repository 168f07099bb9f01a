//! Process composition: bootstrap, initialize consensus, bind every
//! listener, then launch the serving tasks.
//!
//! All listeners are bound before any task is spawned, so a bind or TLS
//! failure on any endpoint aborts startup with nothing running.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::bootstrap::bootstrap;
use crate::compose::Supervisor;
use crate::config::{Config, ConfigError, ProxyMode, TlsInfo};
use crate::consensus::{self, Tuning};
use crate::discovery::{Discovery, HttpDiscovery};
use crate::errors::StartupError;
use crate::node::{NodeServer, PeerSender};
use crate::proxy::Proxy;
use crate::server::{client_app, peer_app, proxy_app};
use crate::transport::{new_client, Listener};

/// A started process: the supervisor plus the addresses it serves on.
pub struct Running {
    supervisor: Supervisor,
    pub peer_addr: Option<SocketAddr>,
    pub client_addrs: Vec<SocketAddr>,
}

impl Running {
    /// Block until the first serving task ends.
    pub async fn wait(self) -> Result<(), StartupError> {
        self.supervisor.wait().await
    }
}

/// Run a node or a proxy, depending on `config.proxy`, until it fails.
pub async fn run(config: &Config) -> Result<(), StartupError> {
    let running = match config.proxy {
        ProxyMode::Off => {
            let discovery = HttpDiscovery::new(new_client(&TlsInfo::default())?);
            start_node(config, &discovery).await?
        }
        ProxyMode::ReadOnly | ProxyMode::On => start_proxy(config)?,
    };
    running.wait().await
}

fn bind_clients(config: &Config) -> Result<Vec<Listener>, StartupError> {
    config
        .bind_addrs
        .iter()
        .map(|addr| Listener::bind(addr, &config.client_tls).map_err(StartupError::from))
        .collect()
}

fn serve_error(endpoint: &str, e: std::io::Error) -> StartupError {
    StartupError::Serve(format!("{endpoint} endpoint: {e}"))
}

/// Bootstrap a consensus participant and serve its peer and client
/// endpoints.
pub async fn start_node(
    config: &Config,
    discovery: &dyn Discovery,
) -> Result<Running, StartupError> {
    let boot = bootstrap(config, discovery).await?;
    let snapshot_count = u64::try_from(config.snapshot_count)
        .map_err(|_| ConfigError::SnapshotCount(config.snapshot_count))?;
    let raw = consensus::initialize(boot.initial.clone(), Tuning::default(), boot.store.clone())?;
    info!(
        id = %format!("{:016x}", boot.self_id),
        mode = ?boot.mode,
        members = boot.cluster.len(),
        "Consensus initialized"
    );

    let peer_listener = Listener::bind(&config.peer_bind_addr, &config.peer_tls)?;
    let client_listeners = bind_clients(config)?;
    let sender = PeerSender::new(
        new_client(&config.peer_tls)?,
        Arc::new(boot.cluster.clone()),
    );

    let (server, handle) =
        NodeServer::new(boot, raw, sender, snapshot_count, config.request_timeout());

    let mut supervisor = Supervisor::new();
    supervisor.spawn_node(server);
    let peer_addr = supervisor
        .spawn_endpoint("peer", peer_listener, peer_app(handle.clone()))
        .map_err(|e| serve_error("peer", e))?;
    let mut client_addrs = Vec::with_capacity(client_listeners.len());
    for listener in client_listeners {
        let addr = supervisor
            .spawn_endpoint("client", listener, client_app(handle.clone(), &config.cors))
            .map_err(|e| serve_error("client", e))?;
        client_addrs.push(addr);
    }

    Ok(Running {
        supervisor,
        peer_addr: Some(peer_addr),
        client_addrs,
    })
}

/// Serve a forwarding proxy in front of the configured cluster.
pub fn start_proxy(config: &Config) -> Result<Running, StartupError> {
    config.validate()?;
    let urls = config.cluster()?.peer_urls();
    info!(mode = ?config.proxy, endpoints = ?urls, "Starting proxy");

    let client_listeners = bind_clients(config)?;
    let proxy = Arc::new(Proxy::new(new_client(&config.peer_tls)?, urls));
    let router = proxy_app(proxy, config.proxy, &config.cors);

    let mut supervisor = Supervisor::new();
    let mut client_addrs = Vec::with_capacity(client_listeners.len());
    for listener in client_listeners {
        let addr = supervisor
            .spawn_endpoint("proxy", listener, router.clone())
            .map_err(|e| serve_error("proxy", e))?;
        client_addrs.push(addr);
    }

    Ok(Running {
        supervisor,
        peer_addr: None,
        client_addrs,
    })
}
