//! Transport: the per-connection actor and the handle callers use to talk
//! to it.

mod actor;
mod backend;
mod instruction;
pub(crate) mod mock;
mod types;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{AddedTaskError, ClientError, ConstructionError};
use crate::event::Event;
use crate::sink::SubscriptionEvent;

use actor::ConnectionActor;
use instruction::{Instruction, SendInstruction};
pub(crate) use types::{BoxedWsStream, Origin};
pub use types::Readiness;

/// Assembles the full Deriv API websocket URL, replicating the reference
/// client's scheme-normalization: any leading `scheme://` other than exactly
/// `ws://` (including none at all) is treated as a request for TLS.
pub fn build_api_url(endpoint: &str, app_id: &str, lang: &str, brand: &str) -> Result<String, ConstructionError> {
    let (is_ws, remainder) = strip_scheme(endpoint);
    let scheme = if is_ws { "ws" } else { "wss" };
    let base = format!("{scheme}://{remainder}");
    url::Url::parse(&base).map_err(|_| ConstructionError::InvalidUrl(endpoint.to_string()))?;
    Ok(format!("{base}/websockets/v3?app_id={app_id}&l={lang}&brand={brand}"))
}

fn strip_scheme(input: &str) -> (bool, &str) {
    let mut rest = input;
    let mut first_was_ws = None;
    loop {
        let Some(idx) = rest.find("://") else { break };
        let scheme_name = &rest[..idx];
        if scheme_name.is_empty() || !scheme_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            break;
        }
        if first_was_ws.is_none() {
            first_was_ws = Some(&rest[..idx + 3] == "ws://");
        }
        rest = &rest[idx + 3..];
    }
    (first_was_ws.unwrap_or(false), rest)
}

/// A cloneable handle to a running connection actor. Every method is a
/// message send across the actor's instruction channel plus (where the
/// caller needs an answer) a reply oneshot - the actor's own state is never
/// touched from outside its task.
#[derive(Clone)]
pub struct ConnectionHandle {
    connection_id: u64,
    instructions: mpsc::UnboundedSender<Instruction>,
    readiness: watch::Receiver<Readiness>,
}

impl ConnectionHandle {
    pub(crate) fn spawn_owned(
        connection_id: u64,
        url: String,
        auto_reconnect: bool,
        max_retry_count: usize,
        events: broadcast::Sender<Event>,
        sanity_errors: broadcast::Sender<Arc<AddedTaskError>>,
    ) -> Self {
        let (instructions, readiness) = ConnectionActor::spawn(
            connection_id,
            Origin::Owned { url },
            auto_reconnect,
            max_retry_count,
            events,
            sanity_errors,
        );
        Self { connection_id, instructions, readiness }
    }

    pub(crate) fn spawn_preopened(
        connection_id: u64,
        socket: BoxedWsStream,
        events: broadcast::Sender<Event>,
        sanity_errors: broadcast::Sender<Arc<AddedTaskError>>,
    ) -> Self {
        let (instructions, readiness) =
            ConnectionActor::spawn(connection_id, Origin::PreOpened(Some(socket)), false, 0, events, sanity_errors);
        Self { connection_id, instructions, readiness }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn readiness(&self) -> Readiness {
        *self.readiness.borrow()
    }

    /// Idempotent: if already `Open`, resolves immediately.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let (respond_to, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::Connect { respond_to })
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    /// Idempotent: a second call after the first has taken effect is a
    /// no-op that still resolves once the actor has processed it.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (respond_to, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::Disconnect { respond_to })
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)
    }

    /// Registers `request` under a freshly assigned `req_id` (or `req_id`
    /// itself if the caller supplied one) and returns it alongside the
    /// broadcast sender backing its sink, from which the caller derives as
    /// many receivers as it needs via `Sender::subscribe`. Resolves as soon
    /// as the request is registered, not once it's been written to the
    /// socket - writing happens on a detached task that waits for readiness
    /// on its own.
    pub(crate) async fn send_and_register(
        &self,
        request: Value,
        req_id: Option<u64>,
    ) -> Result<(u64, broadcast::Sender<SubscriptionEvent>), ClientError> {
        let (respond_to, rx) = oneshot::channel();
        self.instructions
            .send(Instruction::Send(SendInstruction { request, req_id, respond_to }))
            .map_err(|_| ClientError::ActorGone)?;
        rx.await.map_err(|_| ClientError::ActorGone)?
    }

    pub(crate) fn complete_request(&self, req_id: u64) {
        let _ = self.instructions.send(Instruction::CompleteRequest { req_id });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_scheme_is_preserved() {
        let url = build_api_url("ws://example.test", "1089", "EN", "deriv").unwrap();
        assert!(url.starts_with("ws://example.test/websockets/v3?"));
    }

    #[test]
    fn other_schemes_upgrade_to_wss() {
        let url = build_api_url("http://example.test", "1089", "EN", "deriv").unwrap();
        assert!(url.starts_with("wss://example.test/websockets/v3?"));
    }

    #[test]
    fn bare_host_defaults_to_wss() {
        let url = build_api_url("example.test", "1089", "EN", "deriv").unwrap();
        assert!(url.starts_with("wss://example.test/websockets/v3?"));
    }

    #[test]
    fn query_parameters_are_present() {
        let url = build_api_url("ws.derivws.com", "1089", "EN", "deriv").unwrap();
        assert!(url.contains("app_id=1089"));
        assert!(url.contains("l=EN"));
        assert!(url.contains("brand=deriv"));
    }
}
