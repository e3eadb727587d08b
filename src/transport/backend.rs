//! The raw socket driver: a standalone task that owns the `WsStream` value
//! and shuttles text frames to and from it over plain channels.
//!
//! Split into a driver/backend pair the same way the teacher crate splits
//! `WsBackend`/`BackendDriver` - the driver is the handle the connection
//! actor keeps, the backend is the task doing blocking IO. Keeping socket IO
//! off the actor's own task means a slow write never stalls instruction
//! processing.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, trace};

use super::types::BoxedWsStream;

/// The connection actor's handle onto a single backend epoch.
pub(crate) struct BackendDriver {
    pub to_handle: mpsc::UnboundedReceiver<String>,
    pub dispatcher: mpsc::UnboundedSender<String>,
    shutdown: oneshot::Sender<()>,
}

impl BackendDriver {
    /// Signals the backend task to stop. Idempotent: a second call is a
    /// silent no-op if the task already exited on its own.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
    }
}

pub(crate) struct Backend {
    socket: BoxedWsStream,
    handler: mpsc::UnboundedSender<String>,
    to_dispatch: mpsc::UnboundedReceiver<String>,
    shutdown: oneshot::Receiver<()>,
}

impl Backend {
    pub fn new(socket: BoxedWsStream) -> (Self, BackendDriver) {
        let (handler, to_handle) = mpsc::unbounded_channel();
        let (dispatcher, to_dispatch) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        (
            Self { socket, handler, to_dispatch, shutdown: shutdown_rx },
            BackendDriver { to_handle, dispatcher, shutdown: shutdown_tx },
        )
    }

    pub fn spawn(self) {
        tokio::spawn(self.run());
    }

    /// Runs until told to shut down, the peer closes the socket, or a read
    /// error occurs. Either way, dropping `self.handler` on return is the
    /// signal the owning actor relies on to notice this epoch has ended.
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown => {
                    trace!("backend received shutdown instruction");
                    break;
                }
                outbound = self.to_dispatch.recv() => {
                    match outbound {
                        Some(text) => {
                            if let Err(err) = self.socket.send(Message::Text(text)).await {
                                error!(%err, "websocket send failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
                inbound = self.socket.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            if self.handler.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                        Some(Ok(Message::Binary(_))) => {
                            debug!("ignoring unexpected binary frame");
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "peer closed the websocket");
                            break;
                        }
                        Some(Err(err)) => {
                            error!(%err, "websocket read error");
                            break;
                        }
                        None => {
                            debug!("websocket stream ended");
                            break;
                        }
                    }
                }
            }
        }
    }
}
