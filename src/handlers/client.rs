//! Client API handlers.
//!
//! `GET`, `PUT` and `DELETE` on `/v2/keys/*key`.  Reads are served from the
//! local store; writes go through consensus and return once applied here.

use axum::extract::{Form, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::debug;

use crate::errors::ApiError;
use crate::node::NodeHandle;
use crate::store::Op;

/// `value` may come from the query string or a form body.
#[derive(Debug, Default, Deserialize)]
pub struct KeyParams {
    pub value: Option<String>,
}

/// `GET /v2/keys/*key`
pub async fn get_key(
    State(node): State<NodeHandle>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    let event = node.store().get(&key)?;
    Ok(Json(event).into_response())
}

/// `PUT /v2/keys/*key` -- 201 when the key is new, 200 when replaced.
pub async fn put_key(
    State(node): State<NodeHandle>,
    Path(key): Path<String>,
    Query(query): Query<KeyParams>,
    form: Option<Form<KeyParams>>,
) -> Result<Response, ApiError> {
    let value = form
        .and_then(|Form(f)| f.value)
        .or(query.value)
        .ok_or_else(|| ApiError::ValueRequired {
            key: format!("/{}", key.trim_start_matches('/')),
        })?;

    debug!(%key, "PUT");
    let event = node.propose(Op::Put { key, value }).await?;
    let status = if event.prev_node.is_some() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(event)).into_response())
}

/// `DELETE /v2/keys/*key`
pub async fn delete_key(
    State(node): State<NodeHandle>,
    Path(key): Path<String>,
) -> Result<Response, ApiError> {
    debug!(%key, "DELETE");
    let event = node.propose(Op::Delete { key }).await?;
    Ok(Json(event).into_response())
}

/// `GET /v2/machines` -- comma-separated peer URLs of the cluster.
pub async fn machines(State(node): State<NodeHandle>) -> impl IntoResponse {
    node.cluster().peer_urls().join(", ")
}

/// `GET /version`
pub async fn version() -> impl IntoResponse {
    format!("kvnode {}", env!("CARGO_PKG_VERSION"))
}

/// `GET /health` -- healthy once a leader is known.
pub async fn health(State(node): State<NodeHandle>) -> impl IntoResponse {
    let leader = node.leader();
    let status = if leader == 0 {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        status,
        Json(serde_json::json!({
            "health": leader != 0,
            "leader": format!("{leader:016x}"),
        })),
    )
}
