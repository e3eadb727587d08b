//! The closed set of events a connection (and, aggregated, the pool) emits.

use serde_json::Value;
use std::sync::Arc;

use crate::error::ClientError;

/// A tagged event broadcast on a connection's local stream, and re-tagged
/// with `connection_id` as it's forwarded onto the pool-wide buses.
#[derive(Debug, Clone)]
pub enum Event {
    Connect { connection_id: u64 },
    Send { connection_id: u64, data: Value },
    Message { connection_id: u64, data: Value },
    Close { connection_id: u64 },
    ConnectionClosed { connection_id: u64, error: Arc<ClientError> },
    Reconnecting { connection_id: u64, attempt: usize },
    Reconnected { connection_id: u64 },
    ReconnectFailed { connection_id: u64, attempt: usize, error: Arc<ClientError> },
    ReconnectMaxRetriesExceeded { connection_id: u64 },
    Error { connection_id: u64, error: Arc<ClientError> },
    UnmatchedResponse { connection_id: u64, data: Value },
    ForgetSubscription { connection_id: u64, subscription_id: String },
}

impl Event {
    /// The connection_id every event variant carries.
    pub fn connection_id(&self) -> u64 {
        match self {
            Event::Connect { connection_id }
            | Event::Send { connection_id, .. }
            | Event::Message { connection_id, .. }
            | Event::Close { connection_id }
            | Event::ConnectionClosed { connection_id, .. }
            | Event::Reconnecting { connection_id, .. }
            | Event::Reconnected { connection_id }
            | Event::ReconnectFailed { connection_id, .. }
            | Event::ReconnectMaxRetriesExceeded { connection_id }
            | Event::Error { connection_id, .. }
            | Event::UnmatchedResponse { connection_id, .. }
            | Event::ForgetSubscription { connection_id, .. } => *connection_id,
        }
    }

    /// True for the subset the pool also republishes on its error bus.
    pub fn is_error_class(&self) -> bool {
        matches!(
            self,
            Event::Error { .. }
                | Event::ConnectionClosed { .. }
                | Event::ReconnectFailed { .. }
                | Event::ReconnectMaxRetriesExceeded { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Send { .. } => "send",
            Event::Message { .. } => "message",
            Event::Close { .. } => "close",
            Event::ConnectionClosed { .. } => "connection_closed",
            Event::Reconnecting { .. } => "reconnecting",
            Event::Reconnected { .. } => "reconnected",
            Event::ReconnectFailed { .. } => "reconnect_failed",
            Event::ReconnectMaxRetriesExceeded { .. } => "reconnect_max_retries_exceeded",
            Event::Error { .. } => "error",
            Event::UnmatchedResponse { .. } => "unmatched_response",
            Event::ForgetSubscription { .. } => "forget_subscription",
        }
    }
}
