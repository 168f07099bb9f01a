//! Peer API handler: inbound consensus messages.

use axum::extract::State;
use axum::http::StatusCode;
use bytes::Bytes;
use protobuf::Message as PbMessage;
use raft::eraftpb::Message;

use crate::errors::ApiError;
use crate::node::NodeHandle;

/// `POST /raft` -- body is a protobuf-encoded raft message.
pub async fn raft_message(
    State(node): State<NodeHandle>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let msg = Message::parse_from_bytes(&body).map_err(|e| ApiError::BadRequest {
        message: format!("cannot decode raft message: {e}"),
    })?;
    node.step(msg).await?;
    Ok(StatusCode::NO_CONTENT)
}
