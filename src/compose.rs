//! Concurrent serving tasks and their supervisor.
//!
//! Every endpoint (and the node driver) runs as its own task in one
//! [`JoinSet`].  The first task to finish, for any reason, ends the
//! process: there is no isolation between endpoints.

use std::net::SocketAddr;

use axum::Router;
use tokio::task::JoinSet;
use tracing::info;

use crate::errors::StartupError;
use crate::node::NodeServer;
use crate::transport::Listener;

/// How a supervised task ended.
type Exit = (String, Result<(), String>);

/// Owns all serving tasks.  Dropping it aborts them.
#[derive(Default)]
pub struct Supervisor {
    tasks: JoinSet<Exit>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `router` on an already-bound listener.
    pub fn spawn_endpoint(
        &mut self,
        name: &str,
        listener: Listener,
        router: Router,
    ) -> std::io::Result<SocketAddr> {
        let addr = listener.local_addr()?;
        let scheme = if listener.is_tls() { "https" } else { "http" };
        info!(endpoint = name, %addr, scheme, "Listening");
        let name = format!("{name} endpoint {addr}");
        self.tasks.spawn(async move {
            let result = listener.serve(router).await.map_err(|e| e.to_string());
            (name, result)
        });
        Ok(addr)
    }

    /// Drive the consensus participant.
    pub fn spawn_node(&mut self, server: NodeServer) {
        self.tasks.spawn(async move {
            let result = server.run().await.map_err(|e| e.to_string());
            ("node".to_string(), result)
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Block until the first task ends and report it as a serving error.
    /// Returns `Ok` only when nothing was spawned.
    pub async fn wait(mut self) -> Result<(), StartupError> {
        match self.tasks.join_next().await {
            None => Ok(()),
            Some(Ok((name, Ok(())))) => Err(StartupError::Serve(format!("{name} exited"))),
            Some(Ok((name, Err(e)))) => Err(StartupError::Serve(format!("{name} failed: {e}"))),
            Some(Err(e)) => Err(StartupError::Serve(format!("serving task aborted: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsInfo;
    use axum::routing::get;

    #[tokio::test]
    async fn test_empty_supervisor_returns() {
        let sup = Supervisor::new();
        assert!(sup.is_empty());
        sup.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_first_exit_is_fatal() {
        let mut sup = Supervisor::new();
        let listener = Listener::bind("127.0.0.1:0", &TlsInfo::default()).unwrap();
        sup.spawn_endpoint("client", listener, Router::new().route("/", get(|| async { "" })))
            .unwrap();
        sup.tasks.spawn(async { ("short".to_string(), Err("boom".to_string())) });
        assert_eq!(sup.len(), 2);

        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.category(), "serve");
        assert_eq!(err.to_string(), "short failed: boom");
    }

    #[tokio::test]
    async fn test_clean_exit_is_still_an_error() {
        let mut sup = Supervisor::new();
        sup.tasks.spawn(async { ("node".to_string(), Ok(())) });
        let err = sup.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "node exited");
    }
}
