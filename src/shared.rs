//! `SharedSubscription`: the caller-facing handle returned by the
//! Subscription Manager's `subscribe`, wrapping one fan-out branch of a
//! dynamically-dispatched multicast stream.
//!
//! Ref-counting piggybacks on `broadcast::Sender::receiver_count`, so no
//! separate atomic counter is threaded through the registry. The only extra
//! plumbing needed is a way to notice when a count transitions to zero;
//! since nothing can run on a future inside `Drop`, the guard just fires a
//! fire-and-forget signal that the owning manager polls.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::sink::SubscriptionEvent;

/// Sent to a `SubscriptionManager`'s background janitor when a consumer goes
/// away, so it can check whether it was the last one for that fingerprint.
#[derive(Debug, Clone)]
pub(crate) struct ConsumerDropped {
    pub connection_id: u64,
    pub fingerprint: Vec<u8>,
}

/// A single consumer's view onto a subscription's shared sink.
///
/// Dropping this handle (letting it go out of scope, or an explicit `drop`)
/// is how a caller signals "I'm no longer interested"; once the last handle
/// for a given fingerprint is dropped, the owning connection's subscription
/// is torn down and a `forget` request is scheduled automatically.
pub struct SharedSubscription {
    connection_id: u64,
    fingerprint: Vec<u8>,
    inner: BroadcastStream<SubscriptionEvent>,
    notify: mpsc::UnboundedSender<ConsumerDropped>,
}

impl SharedSubscription {
    pub(crate) fn new(
        connection_id: u64,
        fingerprint: Vec<u8>,
        rx: broadcast::Receiver<SubscriptionEvent>,
        notify: mpsc::UnboundedSender<ConsumerDropped>,
    ) -> Self {
        Self { connection_id, fingerprint, inner: BroadcastStream::new(rx), notify }
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    /// Waits for the next emission. Resolves to `None` once the upstream
    /// subscription has been torn down (forgotten, or the connection's
    /// current epoch ended) - a clean end-of-stream, not an error.
    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        use futures_util::StreamExt;
        loop {
            match self.inner.next().await {
                Some(Ok(item)) => return Some(item),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    tracing::debug!(skipped, "subscriber lagged, resuming from latest");
                    continue;
                }
                None => return None,
            }
        }
    }
}

impl Stream for SharedSubscription {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

impl Drop for SharedSubscription {
    fn drop(&mut self) {
        let _ = self.notify.send(ConsumerDropped {
            connection_id: self.connection_id,
            fingerprint: self.fingerprint.clone(),
        });
    }
}
