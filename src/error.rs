//! Error taxonomy for the client runtime.
//!
//! Mirrors the split the teacher crate uses between a transport-level error
//! and a facade-level error that wraps it, so a caller several layers up can
//! still match on the concrete cause (see `ethers-providers`'s
//! `ProviderError`/`WsClientError` pair).

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

/// Raised synchronously when a client or connection is misconfigured.
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("endpoint must be a string-like URL, got: {0}")]
    InvalidEndpoint(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("an app_id is required to connect to the API")]
    MissingAppId,
    #[error("req_id {0} collides with an in-flight request on this connection")]
    DuplicateReqId(u64),
}

/// Raised when an operation names a connection_id the pool does not know about.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {0} not found")]
    NotFound(u64),
}

/// The server responded with an `error` field on a non-parent request.
#[derive(Debug, Error, Clone)]
#[error("response error: {message} (code: {code:?})")]
pub struct ResponseError {
    pub code: Option<String>,
    pub message: String,
    /// The full response body, preserved for callers that need more context.
    pub body: Value,
}

impl ResponseError {
    pub fn from_response(body: Value) -> Self {
        let error = body.get("error");
        let message = error
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_owned();
        let code = error
            .and_then(|e| e.get("code"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        Self { code, message, body }
    }
}

/// Client-side misuse that never reaches the wire.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("subscription type is not found in the API")]
    UnknownStreamType,
}

/// Wraps an unexpected failure from an internally-scheduled task, tagged with
/// the task's name, so it can be routed onto the sanity-error bus instead of
/// propagating to (and killing) the task's own executor.
#[derive(Debug, Error)]
#[error("task '{task}' failed: {source}")]
pub struct AddedTaskError {
    pub task: &'static str,
    #[source]
    pub source: ClientError,
}

/// The top-level error type returned to callers of the facade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Response(#[from] ResponseError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("failed to (de)serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reconnect limit reached after {0} attempts")]
    TooManyReconnects(usize),
    #[error("the connection's actor task has shut down")]
    ActorGone,
    #[error("task panicked: {0}")]
    TaskPanicked(String),
}

/// Spawns `fut` as a detached task and, if it panics, reports the panic onto
/// `sanity_errors` as an `AddedTaskError` instead of letting it vanish
/// silently - mirroring `deriv_api.py`'s `add_task`, which funnels any
/// uncaught exception from a scheduled coroutine onto `self.sanity_errors`.
/// An ordinary `Result::Err` a task already reports through its own channel
/// (a response sink, a reply oneshot) is not duplicated here.
pub(crate) fn spawn_tracked<F>(sanity_errors: broadcast::Sender<Arc<AddedTaskError>>, task: &'static str, fut: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(join_err) = tokio::spawn(fut).await {
            let error = AddedTaskError { task, source: ClientError::TaskPanicked(join_err.to_string()) };
            let _ = sanity_errors.send(Arc::new(error));
        }
    });
}
