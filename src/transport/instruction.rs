use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

use crate::error::ClientError;
use crate::sink::SubscriptionEvent;

/// A single outbound call, handed to the connection actor with the sink it
/// should register under the assigned (or caller-supplied) `req_id`.
pub(crate) struct SendInstruction {
    pub request: Value,
    pub req_id: Option<u64>,
    pub respond_to: oneshot::Sender<Result<(u64, broadcast::Sender<SubscriptionEvent>), ClientError>>,
}

/// The full set of operations a connection actor accepts on its instruction
/// channel. Everything a caller can do to a connection - other than reading
/// its event stream - funnels through here, so the actor's internal state
/// (registry, readiness, backend epoch) is only ever touched from its own
/// task.
pub(crate) enum Instruction {
    Connect { respond_to: oneshot::Sender<Result<(), ClientError>> },
    Send(SendInstruction),
    /// Marks a request's registry slot completed without removing it, so a
    /// late frame still carrying that `req_id` is recognized as
    /// "subscription already torn down" rather than falling through to
    /// `unmatched_response`.
    CompleteRequest { req_id: u64 },
    Disconnect { respond_to: oneshot::Sender<()> },
}

/// Whether the actor's run loop should keep going after handling an
/// instruction.
#[derive(PartialEq, Eq)]
pub(crate) enum Flow {
    Keep,
    Stop,
}
