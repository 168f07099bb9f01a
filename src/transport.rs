//! Listener and outbound client construction.
//!
//! A [`Listener`] is bound eagerly so every bind or TLS error surfaces
//! before any endpoint starts serving.

use std::fs::File;
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;

use crate::config::TlsInfo;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("cannot read TLS file {path}: {source}")]
    ReadPem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("invalid TLS configuration: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("invalid client CA: {0}")]
    ClientVerifier(#[from] rustls::server::VerifierBuilderError),

    #[error("cannot build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// A bound listening socket, optionally wrapped in TLS.
pub struct Listener {
    socket: TcpListener,
    tls: Option<RustlsConfig>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("addr", &self.socket.local_addr().ok())
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl Listener {
    /// Bind `addr`; a bare `:port` binds every interface.  TLS is enabled
    /// when `tls` names a certificate.
    pub fn bind(addr: &str, tls: &TlsInfo) -> Result<Self, TransportError> {
        let tls = if tls.serves_tls() {
            Some(RustlsConfig::from_config(Arc::new(server_config(tls)?)))
        } else {
            None
        };

        let normalized = normalize_addr(addr);
        let bind_err = |source| TransportError::Bind {
            addr: addr.to_string(),
            source,
        };
        let socket = TcpListener::bind(normalized.as_str()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        Ok(Self { socket, tls })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Serve `router` until the socket fails.
    pub async fn serve(self, router: Router) -> std::io::Result<()> {
        match self.tls {
            Some(config) => {
                axum_server::from_tcp_rustls(self.socket, config)
                    .serve(router.into_make_service())
                    .await
            }
            None => {
                let listener = tokio::net::TcpListener::from_std(self.socket)?;
                axum::serve(listener, router).await
            }
        }
    }
}

fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

fn server_config(tls: &TlsInfo) -> Result<ServerConfig, TransportError> {
    let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) else {
        return Err(TransportError::NoPrivateKey(
            tls.cert_file.clone().unwrap_or_default(),
        ));
    };
    let certs = load_certs(cert_file)?;
    let key = load_key(key_file)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;
    let mut config = match &tls.ca_file {
        Some(ca_file) => {
            let verifier = WebPkiClientVerifier::builder_with_provider(
                Arc::new(root_store(ca_file)?),
                provider,
            )
            .build()?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TransportError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TransportError::ReadPem {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let mut reader = open_pem(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TransportError::ReadPem {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TransportError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let mut reader = open_pem(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TransportError::ReadPem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TransportError::NoPrivateKey(path.to_path_buf()))
}

fn root_store(path: &Path) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Outbound HTTP client for peer, discovery and proxy traffic.
///
/// No overall request timeout is set: discovery long-polls.
pub fn new_client(tls: &TlsInfo) -> Result<reqwest::Client, TransportError> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(5));
    if let Some(ca_file) = &tls.ca_file {
        let pem = read_file(ca_file)?;
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
        let cert = read_file(cert_file)?;
        let key = read_file(key_file)?;
        builder = builder.identity(reqwest::Identity::from_pkcs8_pem(&cert, &key)?);
    }
    Ok(builder.build()?)
}

fn read_file(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path).map_err(|source| TransportError::ReadPem {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;

    #[test]
    fn test_normalize_addr() {
        assert_eq!(normalize_addr(":7001"), "0.0.0.0:7001");
        assert_eq!(normalize_addr("127.0.0.1:4001"), "127.0.0.1:4001");
    }

    #[tokio::test]
    async fn test_plain_listener_serves() {
        let listener = Listener::bind("127.0.0.1:0", &TlsInfo::default()).unwrap();
        assert!(!listener.is_tls());
        let addr = listener.local_addr().unwrap();
        let router = Router::new().route("/ping", get(|| async { "pong" }));
        tokio::spawn(listener.serve(router));

        let client = new_client(&TlsInfo::default()).unwrap();
        let body = client
            .get(format!("http://{addr}/ping"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "pong");
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let first = Listener::bind("127.0.0.1:0", &TlsInfo::default()).unwrap();
        let addr = first.local_addr().unwrap().to_string();
        let err = Listener::bind(&addr, &TlsInfo::default()).unwrap_err();
        assert!(matches!(err, TransportError::Bind { .. }));
    }

    #[test]
    fn test_missing_cert_file() {
        let tls = TlsInfo {
            cert_file: Some("/nonexistent/server.crt".into()),
            key_file: Some("/nonexistent/server.key".into()),
            ca_file: None,
        };
        let err = Listener::bind("127.0.0.1:0", &tls).unwrap_err();
        assert!(matches!(err, TransportError::ReadPem { .. }));
    }

    #[test]
    fn test_cert_file_without_pem_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.crt");
        let key = dir.path().join("server.key");
        std::fs::write(&cert, "not a certificate\n").unwrap();
        std::fs::write(&key, "not a key\n").unwrap();
        let tls = TlsInfo {
            cert_file: Some(cert),
            key_file: Some(key),
            ca_file: None,
        };
        let err = Listener::bind("127.0.0.1:0", &tls).unwrap_err();
        assert!(matches!(err, TransportError::NoCertificate(_)));
    }

    #[test]
    fn test_client_missing_ca() {
        let tls = TlsInfo {
            ca_file: Some("/nonexistent/ca.crt".into()),
            ..TlsInfo::default()
        };
        assert!(matches!(
            new_client(&tls),
            Err(TransportError::ReadPem { .. })
        ));
    }
}
