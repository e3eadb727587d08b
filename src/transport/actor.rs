//! The connection actor: owns a connection's request registry, readiness
//! state, and backend epoch, all confined to one task. Every external
//! operation arrives as an `Instruction` over an mpsc channel; nothing
//! outside this module ever locks or mutates this state directly.
//!
//! This is the Rust rendition of the reference implementation's single
//! cooperative coroutine per connection: instead of `async`/`await`
//! interleaving on one event loop, each connection gets its own task and
//! every caller-visible operation is a message send plus a reply channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, instrument, warn};

use crate::error::{spawn_tracked, AddedTaskError, ClientError, ConstructionError, ResponseError};
use crate::event::Event;
use crate::sink::{new_sink, SubscriptionEvent};
use crate::wire;

use super::backend::{Backend, BackendDriver};
use super::instruction::{Flow, Instruction, SendInstruction};
use super::types::{BoxedWsStream, Origin, Readiness};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

enum RegistryEntry {
    Active(broadcast::Sender<SubscriptionEvent>),
    Completed,
}

/// State shared between the actor and the detached tasks it spawns to carry
/// out individual sends. Nothing in here requires the actor's own task to be
/// scheduled for a send task to make progress once the socket is open.
pub(crate) struct Shared {
    pub connection_id: u64,
    pub events: broadcast::Sender<Event>,
    pub sanity_errors: broadcast::Sender<Arc<AddedTaskError>>,
    pub readiness: watch::Sender<Readiness>,
    pub dispatcher: AsyncMutex<Option<mpsc::UnboundedSender<String>>>,
}

pub(crate) struct ConnectionActor {
    shared: Arc<Shared>,
    origin: Origin,
    auto_reconnect: bool,
    max_retry_count: usize,
    req_counter: u64,
    registry: HashMap<u64, RegistryEntry>,
    is_closing: bool,
    disconnected: bool,
    backend: Option<BackendDriver>,
    instructions: mpsc::UnboundedReceiver<Instruction>,
}

impl ConnectionActor {
    pub fn spawn(
        connection_id: u64,
        origin: Origin,
        auto_reconnect: bool,
        max_retry_count: usize,
        events: broadcast::Sender<Event>,
        sanity_errors: broadcast::Sender<Arc<AddedTaskError>>,
    ) -> (mpsc::UnboundedSender<Instruction>, watch::Receiver<Readiness>) {
        let (readiness_tx, readiness_rx) = watch::channel(Readiness::Pending);
        let (instr_tx, instr_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            connection_id,
            events,
            sanity_errors: sanity_errors.clone(),
            readiness: readiness_tx,
            dispatcher: AsyncMutex::new(None),
        });
        let actor = ConnectionActor {
            shared,
            origin,
            auto_reconnect,
            max_retry_count,
            req_counter: 0,
            registry: HashMap::new(),
            is_closing: false,
            disconnected: false,
            backend: None,
            instructions: instr_rx,
        };
        spawn_tracked(sanity_errors, "connection_actor", actor.run());
        (instr_tx, readiness_rx)
    }

    fn readiness(&self) -> Readiness {
        *self.shared.readiness.borrow()
    }

    fn set_readiness(&self, r: Readiness) {
        let _ = self.shared.readiness.send(r);
    }

    #[instrument(skip(self), fields(connection_id = self.shared.connection_id))]
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                instr = self.instructions.recv() => {
                    match instr {
                        Some(instr) => {
                            if self.handle_instruction(instr).await == Flow::Stop {
                                return;
                            }
                        }
                        None => return,
                    }
                }
                frame = recv_backend(&mut self.backend) => {
                    match frame {
                        Some(text) => self.handle_frame(&text),
                        None => self.on_epoch_ended().await,
                    }
                }
            }
        }
    }

    async fn handle_instruction(&mut self, instr: Instruction) -> Flow {
        match instr {
            Instruction::Connect { respond_to } => {
                let result = self.ensure_connected().await;
                let _ = respond_to.send(result);
                Flow::Keep
            }
            Instruction::Send(send) => {
                self.handle_send(send);
                Flow::Keep
            }
            Instruction::CompleteRequest { req_id } => {
                self.registry.insert(req_id, RegistryEntry::Completed);
                Flow::Keep
            }
            Instruction::Disconnect { respond_to } => {
                self.handle_disconnect();
                let _ = respond_to.send(());
                Flow::Stop
            }
        }
    }

    async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        if self.readiness() == Readiness::Open {
            return Ok(());
        }
        match &mut self.origin {
            Origin::Owned { url } => {
                if self.readiness() != Readiness::Pending {
                    return Err(ClientError::ActorGone);
                }
                let url = url.clone();
                let _ = self.shared.events.send(Event::Connect { connection_id: self.shared.connection_id });
                let driver = open_owned_socket(&url).await?;
                self.backend = Some(self.publish_backend(driver).await);
            }
            Origin::PreOpened(slot) => {
                if self.backend.is_none() {
                    let stream = slot.take().ok_or(ClientError::ActorGone)?;
                    let (backend, driver) = Backend::new(stream);
                    backend.spawn();
                    self.backend = Some(self.publish_backend(driver).await);
                }
            }
        }
        self.set_readiness(Readiness::Open);
        Ok(())
    }

    /// Wires up a freshly spawned backend's dispatcher so in-flight send
    /// tasks (which hold only `Arc<Shared>`) can reach it.
    async fn publish_backend(&self, driver: BackendDriver) -> BackendDriver {
        *self.shared.dispatcher.lock().await = Some(driver.dispatcher.clone());
        driver
    }

    fn handle_send(&mut self, send: SendInstruction) {
        let SendInstruction { request, req_id, respond_to } = send;
        let id = match req_id {
            Some(id) => {
                if self.registry.contains_key(&id) {
                    let _ = respond_to.send(Err(ConstructionError::DuplicateReqId(id).into()));
                    return;
                }
                id
            }
            None => {
                self.req_counter += 1;
                self.req_counter
            }
        };
        let (tx, _rx) = new_sink();
        self.registry.insert(id, RegistryEntry::Active(tx.clone()));
        let shared = self.shared.clone();
        spawn_tracked(shared.sanity_errors.clone(), "send_task", send_task(shared, id, request, tx.clone()));
        let _ = respond_to.send(Ok((id, tx)));
    }

    fn handle_disconnect(&mut self) {
        if self.disconnected {
            return;
        }
        self.disconnected = true;
        self.is_closing = true;
        self.set_readiness(Readiness::ClosedOk);
        let _ = self.shared.events.send(Event::Close { connection_id: self.shared.connection_id });
        if let Some(driver) = self.backend.take() {
            driver.shutdown();
        }
    }

    #[instrument(skip(self), fields(connection_id = self.shared.connection_id))]
    fn handle_frame(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(err) => {
                warn!(%err, "failed to parse inbound frame as JSON");
                let _ = self.shared.events.send(Event::Error {
                    connection_id: self.shared.connection_id,
                    error: Arc::new(ClientError::Json(err)),
                });
                return;
            }
        };
        let _ = self
            .shared
            .events
            .send(Event::Message { connection_id: self.shared.connection_id, data: value.clone() });

        let req_id = match value.get("req_id").and_then(Value::as_u64) {
            Some(id) => id,
            None => {
                let _ = self.shared.events.send(Event::UnmatchedResponse {
                    connection_id: self.shared.connection_id,
                    data: value,
                });
                return;
            }
        };
        let Some(entry) = self.registry.get(&req_id) else {
            let _ = self
                .shared
                .events
                .send(Event::UnmatchedResponse { connection_id: self.shared.connection_id, data: value });
            return;
        };

        let echo_req = value.get("echo_req").cloned().unwrap_or(Value::Null);
        let is_parent = wire::is_parent_proposal_open_contract(&echo_req);
        let has_error = value.get("error").is_some();

        if has_error && !is_parent {
            if let RegistryEntry::Active(sender) = entry {
                let _ = sender.send(Err(Arc::new(ResponseError::from_response(value.clone()))));
            }
            self.registry.insert(req_id, RegistryEntry::Completed);
            return;
        }

        if matches!(entry, RegistryEntry::Completed) {
            if let Some(subs_id) = value.pointer("/subscription/id").and_then(Value::as_str) {
                let _ = self.shared.events.send(Event::ForgetSubscription {
                    connection_id: self.shared.connection_id,
                    subscription_id: subs_id.to_owned(),
                });
            }
            return;
        }

        if let RegistryEntry::Active(sender) = entry {
            let _ = sender.send(Ok(value));
        }
    }

    async fn on_epoch_ended(&mut self) {
        self.backend = None;
        *self.shared.dispatcher.lock().await = None;
        if self.is_closing {
            return;
        }
        self.set_readiness(Readiness::ClosedError);
        let _ = self.shared.events.send(Event::ConnectionClosed {
            connection_id: self.shared.connection_id,
            error: Arc::new(ClientError::ActorGone),
        });

        let owns_socket = matches!(self.origin, Origin::Owned { .. });
        if self.auto_reconnect && owns_socket {
            self.attempt_reconnect().await;
        }
    }

    async fn attempt_reconnect(&mut self) {
        let Origin::Owned { url } = &self.origin else { return };
        let url = url.clone();
        let mut delay = INITIAL_BACKOFF;
        let mut attempt = 0usize;

        while attempt < self.max_retry_count {
            if self.is_closing {
                return;
            }
            attempt += 1;
            let _ = self
                .shared
                .events
                .send(Event::Reconnecting { connection_id: self.shared.connection_id, attempt });

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                instr = self.instructions.recv() => {
                    match instr {
                        Some(instr) => {
                            if self.handle_instruction(instr).await == Flow::Stop {
                                return;
                            }
                            // Disconnect is the only instruction that stops
                            // the loop; everything else (sends queue behind
                            // readiness, CompleteRequest mutates state
                            // directly) is safe to apply mid-backoff.
                        }
                        None => return,
                    }
                }
            }

            match open_owned_socket(&url).await {
                Ok(driver) => {
                    self.backend = Some(self.publish_backend(driver).await);
                    self.set_readiness(Readiness::Open);
                    let _ = self
                        .shared
                        .events
                        .send(Event::Reconnected { connection_id: self.shared.connection_id });
                    return;
                }
                Err(err) => {
                    info!(attempt, %err, "reconnect attempt failed");
                    let _ = self.shared.events.send(Event::ReconnectFailed {
                        connection_id: self.shared.connection_id,
                        attempt,
                        error: Arc::new(err),
                    });
                    delay = std::cmp::min(delay * 2, MAX_BACKOFF);
                }
            }
        }

        let _ = self
            .shared
            .events
            .send(Event::ReconnectMaxRetriesExceeded { connection_id: self.shared.connection_id });
        self.set_readiness(Readiness::ClosedError);
    }
}

async fn recv_backend(backend: &mut Option<BackendDriver>) -> Option<String> {
    match backend {
        Some(driver) => driver.to_handle.recv().await,
        None => std::future::pending().await,
    }
}

async fn open_owned_socket(url: &str) -> Result<BackendDriver, ClientError> {
    let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
    let boxed: BoxedWsStream = Box::new(stream);
    let (backend, driver) = Backend::new(boxed);
    backend.spawn();
    Ok(driver)
}

/// Waits for the connection to become `Open`, then serializes and transmits
/// `request` under `req_id`. Runs detached from the actor's own task so a
/// caller blocked waiting on readiness never stalls instruction processing;
/// failures are reported through `sink` directly since that's the only
/// piece of registry state this task needs.
async fn send_task(shared: Arc<Shared>, req_id: u64, mut request: Value, sink: broadcast::Sender<SubscriptionEvent>) {
    let mut readiness_rx = shared.readiness.subscribe();
    while *readiness_rx.borrow() != Readiness::Open {
        if readiness_rx.changed().await.is_err() {
            return;
        }
    }

    if let Value::Object(map) = &mut request {
        map.insert("req_id".to_string(), json!(req_id));
    }

    let dispatcher = shared.dispatcher.lock().await.clone();
    let Some(dispatcher) = dispatcher else {
        let _ = sink.send(Err(Arc::new(transmission_error("no active websocket connection"))));
        return;
    };
    let text = match serde_json::to_string(&request) {
        Ok(text) => text,
        Err(err) => {
            let _ = sink.send(Err(Arc::new(transmission_error(&format!("failed to serialize request: {err}")))));
            return;
        }
    };
    match dispatcher.send(text) {
        Ok(()) => {
            debug!(req_id, "request dispatched");
            let _ = shared.events.send(Event::Send { connection_id: shared.connection_id, data: request });
        }
        Err(_) => {
            let _ = sink.send(Err(Arc::new(transmission_error("websocket dispatcher is gone"))));
        }
    }
}

fn transmission_error(message: &str) -> ResponseError {
    ResponseError { code: None, message: message.to_string(), body: Value::Null }
}
