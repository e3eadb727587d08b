//! Subscription Manager: multiplexes any number of local `subscribe()`
//! callers that ask for the identical request onto a single upstream
//! subscription per connection, and tears that subscription down once the
//! last local consumer drops.
//!
//! Grounded in `subscription_manager.py`'s three parallel indices
//! (`subs_id_to_key`, `source_by_msg_type`, and the fingerprint-keyed
//! subject table). Guarded by a plain `std::sync::Mutex` rather than being
//! its own actor: every critical section here is a synchronous map
//! mutation, so there's no need to serialize it through a task the way the
//! Transport's per-connection state is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::error::{spawn_tracked, ClientError};
use crate::pool::ConnectionPool;
use crate::shared::{ConsumerDropped, SharedSubscription};
use crate::sink::SubscriptionEvent;
use crate::wire;

struct Entry {
    sender: broadcast::Sender<SubscriptionEvent>,
    req_id: u64,
    subs_id: Option<String>,
    msg_type: Option<&'static str>,
}

#[derive(Default)]
struct ConnectionState {
    by_fingerprint: HashMap<Vec<u8>, Entry>,
    subs_id_to_fingerprint: HashMap<String, Vec<u8>>,
    /// contract_id -> fingerprint of the `buy` subscription backing it, so a
    /// later `proposal_open_contract` query for the same contract can reuse
    /// the stream `buy` already opened instead of issuing a second one.
    buy_by_contract: HashMap<String, Vec<u8>>,
}

pub struct SubscriptionManager {
    pool: Arc<ConnectionPool>,
    state: Mutex<HashMap<u64, ConnectionState>>,
    dropped_tx: mpsc::UnboundedSender<ConsumerDropped>,
    self_weak: std::sync::Weak<SubscriptionManager>,
}

impl SubscriptionManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Arc<Self> {
        let (dropped_tx, dropped_rx) = mpsc::unbounded_channel();
        let sanity_errors = pool.sanity_errors();
        let manager = Arc::new_cyclic(|weak| Self {
            pool,
            state: Mutex::new(HashMap::new()),
            dropped_tx,
            self_weak: weak.clone(),
        });
        spawn_tracked(sanity_errors, "subscription_janitor", Self::run_janitor(manager.clone(), dropped_rx));
        manager
    }

    /// Background task: reacts to consumers dropping their
    /// `SharedSubscription` handle by tearing down any subscription whose
    /// local reference count has reached zero.
    async fn run_janitor(manager: Arc<Self>, mut dropped_rx: mpsc::UnboundedReceiver<ConsumerDropped>) {
        while let Some(ConsumerDropped { connection_id, fingerprint }) = dropped_rx.recv().await {
            manager.maybe_teardown(connection_id, &fingerprint).await;
        }
    }

    async fn maybe_teardown(&self, connection_id: u64, fingerprint: &[u8]) {
        let (req_id, subs_id) = {
            let mut state = self.state.lock().unwrap();
            let Some(conn_state) = state.get_mut(&connection_id) else { return };
            let Some(entry) = conn_state.by_fingerprint.get(fingerprint) else { return };
            if entry.sender.receiver_count() > 0 {
                return;
            }
            let entry = conn_state.by_fingerprint.remove(fingerprint).expect("checked above");
            if let Some(ref id) = entry.subs_id {
                conn_state.subs_id_to_fingerprint.remove(id);
            }
            conn_state.buy_by_contract.retain(|_, fp| fp != fingerprint);
            (entry.req_id, entry.subs_id)
        };

        debug!(connection_id, req_id, ?subs_id, "tearing down subscription with no local consumers left");
        if let Ok(handle) = self.pool.handle(connection_id).await {
            handle.complete_request(req_id);
        }
        if let Some(subs_id) = subs_id {
            let _ = self.send_forget(connection_id, &subs_id).await;
        }
    }

    /// Subscribes to `request` on `connection_id`, reusing an existing
    /// upstream subscription with the identical fingerprint (or, for a
    /// `proposal_open_contract` query, an existing `buy` stream on the same
    /// contract) instead of issuing a new one.
    pub async fn subscribe(&self, connection_id: u64, mut request: Value) -> Result<SharedSubscription, ClientError> {
        if let Value::Object(map) = &mut request {
            map.insert("subscribe".to_string(), json!(1));
        }
        let fingerprint = wire::fingerprint(&request);

        if let Some(shared) = self.reuse_existing(connection_id, &fingerprint, &request) {
            return Ok(shared);
        }

        let handle = self.pool.handle(connection_id).await?;
        let (req_id, sender) = handle.send_and_register(request.clone(), None).await?;
        let msg_type = wire::msg_type(&request);

        let rx = {
            let mut state = self.state.lock().unwrap();
            let conn_state = state.entry(connection_id).or_default();
            conn_state
                .by_fingerprint
                .insert(fingerprint.clone(), Entry { sender: sender.clone(), req_id, subs_id: None, msg_type });
            sender.subscribe()
        };

        spawn_tracked(
            self.pool.sanity_errors(),
            "watch_first_response",
            Self::watch_first_response(
                self.self_weak.clone(),
                connection_id,
                fingerprint.clone(),
                request.clone(),
                sender.subscribe(),
            ),
        );

        Ok(SharedSubscription::new(connection_id, fingerprint, rx, self.dropped_tx.clone()))
    }

    /// Observes the first emission of a freshly registered subscription to
    /// record its server-assigned id and, for a `buy` request, the
    /// contract_id it backs - so later lookups (`forget`, a
    /// `proposal_open_contract` query reusing this stream) work without the
    /// caller having to report anything back.
    ///
    /// This task holds its own receiver on the same sink every external
    /// caller shares, so it must also participate in ref-counted teardown:
    /// if the only external consumer drops before the first frame arrives,
    /// `maybe_teardown` sees this task's receiver keeping the count above
    /// zero and does nothing. Once this task is done with its receiver, it
    /// drops it and re-checks, so the subscription still gets torn down
    /// rather than leaking forever.
    async fn watch_first_response(
        manager: std::sync::Weak<Self>,
        connection_id: u64,
        fingerprint: Vec<u8>,
        request: Value,
        mut rx: broadcast::Receiver<SubscriptionEvent>,
    ) {
        let received = rx.recv().await;
        drop(rx);

        let Some(manager) = manager.upgrade() else { return };

        if let Ok(Ok(response)) = received {
            if let Some(subs_id) = response.pointer("/subscription/id").and_then(Value::as_str) {
                manager.note_subscription_id(connection_id, &fingerprint, subs_id.to_owned());
            }

            if wire::msg_type(&request) == Some("buy") {
                let contract_id = response
                    .pointer("/buy/contract_id")
                    .and_then(|v| v.as_str().map(str::to_owned).or_else(|| v.as_u64().map(|n| n.to_string())));
                if let Some(contract_id) = contract_id {
                    manager.note_buy_contract(connection_id, contract_id, fingerprint.clone());
                }
            }
        }

        manager.maybe_teardown(connection_id, &fingerprint).await;
    }

    fn reuse_existing(&self, connection_id: u64, fingerprint: &[u8], request: &Value) -> Option<SharedSubscription> {
        let state = self.state.lock().unwrap();
        let conn_state = state.get(&connection_id)?;

        if let Some(entry) = conn_state.by_fingerprint.get(fingerprint) {
            return Some(SharedSubscription::new(
                connection_id,
                fingerprint.to_vec(),
                entry.sender.subscribe(),
                self.dropped_tx.clone(),
            ));
        }

        if wire::msg_type(request) == Some("proposal_open_contract") {
            let contract_id = request.get("contract_id").and_then(Value::as_str)?;
            let buy_fingerprint = conn_state.buy_by_contract.get(contract_id)?;
            let entry = conn_state.by_fingerprint.get(buy_fingerprint)?;
            return Some(SharedSubscription::new(
                connection_id,
                buy_fingerprint.clone(),
                entry.sender.subscribe(),
                self.dropped_tx.clone(),
            ));
        }
        None
    }

    /// Records that a `buy` subscription now backs `contract_id`, so a
    /// subsequent `proposal_open_contract` subscribe for that contract
    /// reuses it instead of opening a second stream.
    fn note_buy_contract(&self, connection_id: u64, contract_id: String, buy_fingerprint: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        state.entry(connection_id).or_default().buy_by_contract.insert(contract_id, buy_fingerprint);
    }

    /// Records a server-assigned subscription id once it's observed on the
    /// first response, so teardown can later issue the matching `forget`.
    fn note_subscription_id(&self, connection_id: u64, fingerprint: &[u8], subs_id: String) {
        let mut state = self.state.lock().unwrap();
        let Some(conn_state) = state.get_mut(&connection_id) else { return };
        if let Some(entry) = conn_state.by_fingerprint.get_mut(fingerprint) {
            conn_state.subs_id_to_fingerprint.insert(subs_id.clone(), fingerprint.to_vec());
            entry.subs_id = Some(subs_id);
        }
    }

    /// Forgets a single subscription by its server-assigned id, mirroring
    /// the literal `{"forget": subs_id}` call.
    pub async fn forget(&self, connection_id: u64, subs_id: &str) -> Result<Value, ClientError> {
        let fingerprint = {
            let mut state = self.state.lock().unwrap();
            state.get_mut(&connection_id).and_then(|conn_state| conn_state.subs_id_to_fingerprint.remove(subs_id))
        };
        if let Some(fingerprint) = fingerprint {
            let removed_req_id = {
                let mut state = self.state.lock().unwrap();
                state.get_mut(&connection_id).and_then(|conn_state| {
                    let entry = conn_state.by_fingerprint.remove(&fingerprint)?;
                    conn_state.buy_by_contract.retain(|_, fp| fp != &fingerprint);
                    Some(entry.req_id)
                })
            };
            if let Some(req_id) = removed_req_id {
                if let Ok(handle) = self.pool.handle(connection_id).await {
                    handle.complete_request(req_id);
                }
            }
        }
        self.send_forget(connection_id, subs_id).await
    }

    /// Forgets every subscription of the given message types on a
    /// connection in a single round trip, mirroring the literal
    /// `{"forget_all": list(types)}` call.
    pub async fn forget_all(&self, connection_id: u64, types: &[&str]) -> Result<Value, ClientError> {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(conn_state) = state.get_mut(&connection_id) {
                let to_remove: Vec<Vec<u8>> = conn_state
                    .by_fingerprint
                    .iter()
                    .filter(|(_, entry)| entry.msg_type.map(|t| types.contains(&t)).unwrap_or(false))
                    .map(|(fp, _)| fp.clone())
                    .collect();
                for fingerprint in to_remove {
                    if let Some(entry) = conn_state.by_fingerprint.remove(&fingerprint) {
                        if let Some(subs_id) = entry.subs_id {
                            conn_state.subs_id_to_fingerprint.remove(&subs_id);
                        }
                    }
                    conn_state.buy_by_contract.retain(|_, fp| fp != &fingerprint);
                }
            }
        }

        let handle = self.pool.handle(connection_id).await?;
        let (req_id, sender) = handle.send_and_register(json!({ "forget_all": types }), None).await?;
        let mut rx = sender.subscribe();
        let response = rx.recv().await.map_err(|_| ClientError::ActorGone)?;
        handle.complete_request(req_id);
        response.map_err(|err| (*err).clone().into())
    }

    async fn send_forget(&self, connection_id: u64, subs_id: &str) -> Result<Value, ClientError> {
        let handle = self.pool.handle(connection_id).await?;
        let (req_id, sender) = handle.send_and_register(json!({ "forget": subs_id }), None).await?;
        let mut rx = sender.subscribe();
        let response = rx.recv().await.map_err(|_| ClientError::ActorGone)?;
        handle.complete_request(req_id);
        response.map_err(|err| (*err).clone().into())
    }
}
