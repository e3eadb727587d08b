//! The Response Sink abstraction: a multicast channel with `{push-next,
//! push-error, complete}` semantics, uniform across one-shot sends and
//! long-lived subscriptions.
//!
//! Grounded in the reference implementation's use of a single RxPY `Subject`
//! type for both cases (a plain `send()` is just "take the first emission of
//! a `Subject` that happens to only ever receive one"). Rust has no
//! off-the-shelf hot multicast `Subject`, so `tokio::sync::broadcast` plays
//! that role here: a one-shot request's sink is simply a broadcast channel
//! whose first (and, in practice, only) emission is consumed by `send`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::ResponseError;

/// Emissions carried on the wire. An `Err` terminates the sink for plain
/// requests; for a parent `proposal_open_contract` subscription, per-element
/// errors are delivered as `Ok` data instead (see `wire::is_parent_proposal_open_contract`).
pub type SubscriptionEvent = Result<Value, Arc<ResponseError>>;

/// Broadcast buffer depth. Generous enough that a consumer which is merely
/// scheduled late (not actually slow) won't see a `Lagged` gap in practice;
/// true backpressure is still the caller's responsibility per the spec.
pub const SINK_CAPACITY: usize = 256;

pub(crate) fn new_sink() -> (broadcast::Sender<SubscriptionEvent>, broadcast::Receiver<SubscriptionEvent>) {
    broadcast::channel(SINK_CAPACITY)
}
