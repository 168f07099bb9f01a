//! Axum router construction for the peer, client and proxy endpoints.
//!
//! [`client_app`], [`peer_app`] and [`proxy_app`] each return a
//! ready-to-serve [`axum::Router`].  The client and proxy routers are
//! wrapped by the CORS filter built from the configured allow-list.

use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::ProxyMode;
use crate::handlers::{client, peer};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::node::NodeHandle;
use crate::proxy::{forward, readonly_middleware, Proxy};

/// Key routes shared by the client and peer endpoints.
fn key_routes() -> Router<NodeHandle> {
    Router::new()
        .route(
            "/v2/keys/*key",
            get(client::get_key)
                .put(client::put_key)
                .delete(client::delete_key),
        )
        .route("/v2/machines", get(client::machines))
}

/// Router for a client listener.
pub fn client_app(node: NodeHandle, cors: &[String]) -> Router {
    key_routes()
        .route("/version", get(client::version))
        .route("/health", get(client::health))
        .route("/metrics", get(metrics_handler))
        .with_state(node)
        // Layer ordering: inner layers run first, outer layers wrap them.
        .layer(middleware::from_fn(metrics_middleware))
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

/// Router for the peer listener.  Key routes are mounted too, so a proxy
/// forwarding to peer URLs is answered.
pub fn peer_app(node: NodeHandle) -> Router {
    key_routes()
        .route("/raft", post(peer::raft_message))
        .with_state(node)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Router for a proxy listener.  In read-only mode mutating methods are
/// rejected before anything is forwarded.
pub fn proxy_app(proxy: Arc<Proxy>, mode: ProxyMode, cors: &[String]) -> Router {
    let mut router = Router::new().fallback(forward).with_state(proxy);
    if mode == ProxyMode::ReadOnly {
        router = router.layer(middleware::from_fn(readonly_middleware));
    }
    router
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

/// CORS filter for the configured origins; `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::PUT,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
