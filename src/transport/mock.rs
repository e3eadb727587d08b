//! An in-memory stand-in for a websocket socket, used by integration tests
//! to drive a `ConnectionHandle` without opening a real TCP connection.
//!
//! Grounded in the reference crate's `transports::mock` test transport:
//! a channel pair masquerading as the wire, with a server-side handle the
//! test holds to inject frames and observe what the client sent.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::types::BoxedWsStream;

/// The client-side half, handed to the actor as its `BoxedWsStream`.
pub(crate) struct MockSocket {
    inbound: mpsc::UnboundedReceiver<Message>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Stream for MockSocket {
    type Item = Result<Message, WsError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inbound.poll_recv(cx).map(|opt| opt.map(Ok))
    }
}

impl Sink<Message> for MockSocket {
    type Error = WsError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), Self::Error> {
        self.outbound
            .send(item)
            .map_err(|_| WsError::ConnectionClosed)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

/// The test-side half: push frames in as if the server sent them, and drain
/// frames the client under test has sent out.
pub struct MockServer {
    to_client: mpsc::UnboundedSender<Message>,
    from_client: mpsc::UnboundedReceiver<Message>,
}

impl MockServer {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.to_client.send(Message::Text(text.into()));
    }

    pub fn push_json(&self, value: &serde_json::Value) {
        self.push_text(value.to_string());
    }

    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.from_client.recv().await? {
                Message::Text(text) => return Some(text),
                _ => continue,
            }
        }
    }

    pub async fn recv_json(&mut self) -> Option<serde_json::Value> {
        let text = self.recv_text().await?;
        serde_json::from_str(&text).ok()
    }
}

/// Builds a connected client/server pair of in-memory sockets.
pub fn mock_pair() -> (BoxedWsStream, MockServer) {
    let (to_client, from_server) = mpsc::unbounded_channel();
    let (to_server, from_client) = mpsc::unbounded_channel();
    let socket = MockSocket { inbound: from_server, outbound: to_server };
    let server = MockServer { to_client, from_client };
    (Box::new(socket), server)
}
