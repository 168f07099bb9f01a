//! Stateless forwarding proxy.
//!
//! Client requests are relayed unchanged (method, path, query, headers and
//! body) to the cluster's peer URLs.  Endpoints are tried in order; one
//! that failed recently is skipped until its cooldown expires.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use http::{HeaderMap, Method};
use metrics::counter;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::metrics::PROXY_REQUESTS_TOTAL;

/// How long a failed endpoint is left out of rotation.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(5);

/// Largest request body buffered for forwarding.
pub const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

#[derive(Debug)]
struct Endpoint {
    url: String,
    failed_at: Mutex<Option<Instant>>,
}

impl Endpoint {
    fn available(&self, now: Instant) -> bool {
        match *self.failed_at.lock().unwrap_or_else(|e| e.into_inner()) {
            Some(at) => now.duration_since(at) >= FAILURE_COOLDOWN,
            None => true,
        }
    }

    fn mark_failed(&self) {
        *self.failed_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
    }

    fn mark_ok(&self) {
        *self.failed_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Forwarding state shared by all proxy listeners.
#[derive(Debug)]
pub struct Proxy {
    client: reqwest::Client,
    endpoints: Vec<Endpoint>,
}

impl Proxy {
    pub fn new(client: reqwest::Client, urls: Vec<String>) -> Self {
        let endpoints = urls
            .into_iter()
            .map(|url| Endpoint {
                url: url.trim_end_matches('/').to_string(),
                failed_at: Mutex::new(None),
            })
            .collect();
        Self { client, endpoints }
    }

    pub fn endpoint_urls(&self) -> Vec<&str> {
        self.endpoints.iter().map(|e| e.url.as_str()).collect()
    }

    async fn relay(&self, req: Request) -> Result<Response, ApiError> {
        let now = Instant::now();
        let available: Vec<&Endpoint> =
            self.endpoints.iter().filter(|e| e.available(now)).collect();
        if available.is_empty() {
            return Err(ApiError::Unavailable {
                message: "proxy: zero endpoints currently available".into(),
            });
        }

        let (parts, body) = req.into_parts();
        let body = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| ApiError::BadRequest {
                message: format!("cannot read request body (limit {MAX_BODY_BYTES} bytes): {e}"),
            })?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let headers = strip_hop_by_hop(&parts.headers);

        for endpoint in &available {
            let url = format!("{}{}", endpoint.url, path_and_query);
            let result = self
                .client
                .request(parts.method.clone(), &url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(upstream) => {
                    endpoint.mark_ok();
                    counter!(PROXY_REQUESTS_TOTAL, "status" => "forwarded").increment(1);
                    return into_response(upstream).await;
                }
                Err(e) => {
                    warn!(endpoint = %endpoint.url, error = %e, "Proxy endpoint failed");
                    endpoint.mark_failed();
                }
            }
        }

        counter!(PROXY_REQUESTS_TOTAL, "status" => "failed").increment(1);
        Err(ApiError::Unavailable {
            message: format!(
                "proxy: unable to get response from {} endpoint(s)",
                available.len()
            ),
        })
    }
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP {
        out.remove(*name);
    }
    out
}

async fn into_response(upstream: reqwest::Response) -> Result<Response, ApiError> {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let body = upstream
        .bytes()
        .await
        .map_err(|e| ApiError::Unavailable {
            message: format!("proxy: upstream body read failed: {e}"),
        })?;
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Fallback handler relaying every request.
pub async fn forward(State(proxy): State<Arc<Proxy>>, req: Request) -> Response {
    debug!(method = %req.method(), uri = %req.uri(), "Proxying");
    match proxy.relay(req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Reject mutating methods before they reach [`forward`].
pub async fn readonly_middleware(req: Request, next: Next) -> Response {
    match *req.method() {
        Method::GET | Method::HEAD | Method::OPTIONS => next.run(req).await,
        _ => {
            counter!(PROXY_REQUESTS_TOTAL, "status" => "rejected").increment(1);
            ApiError::NotImplemented.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", "keep-alive".parse().unwrap());
        headers.insert("host", "a.example".parse().unwrap());
        headers.insert("x-custom", "1".parse().unwrap());
        let out = strip_hop_by_hop(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out["x-custom"], "1");
    }

    #[test]
    fn test_endpoint_cooldown() {
        let e = Endpoint {
            url: "http://a".into(),
            failed_at: Mutex::new(None),
        };
        let now = Instant::now();
        assert!(e.available(now));
        e.mark_failed();
        assert!(!e.available(Instant::now()));
        assert!(e.available(Instant::now() + FAILURE_COOLDOWN));
        e.mark_ok();
        assert!(e.available(Instant::now()));
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected_before_forwarding() {
        let proxy = Proxy::new(reqwest::Client::new(), vec!["http://127.0.0.1:1".into()]);
        let req = Request::builder()
            .method(Method::PUT)
            .uri("/v2/keys/a")
            .body(Body::from(vec![0u8; MAX_BODY_BYTES + 1]))
            .unwrap();
        let err = proxy.relay(req).await.unwrap_err();
        assert!(matches!(err, ApiError::BadRequest { .. }));
        assert!(proxy.endpoints[0].available(Instant::now()));
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let proxy = Proxy::new(
            reqwest::Client::new(),
            vec!["http://a:1/".into(), "http://b:2".into()],
        );
        assert_eq!(proxy.endpoint_urls(), vec!["http://a:1", "http://b:2"]);
    }
}
