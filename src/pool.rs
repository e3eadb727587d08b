//! Connection Pool: owns the set of live connections, hands out monotonic
//! ids, and republishes every connection's events onto pool-wide buses.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::error::{AddedTaskError, ClientError, ConnectionError};
use crate::event::Event;
use crate::transport::{build_api_url, ConnectionHandle, Readiness};

const EVENT_BUS_CAPACITY: usize = 1024;
const SANITY_BUS_CAPACITY: usize = 256;

/// Configuration shared by every connection the pool creates.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub endpoint: String,
    pub app_id: String,
    pub lang: String,
    pub brand: String,
    pub auto_reconnect: bool,
    pub max_retry_count: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            endpoint: "ws.derivws.com".to_string(),
            app_id: String::new(),
            lang: "EN".to_string(),
            brand: "deriv".to_string(),
            auto_reconnect: true,
            max_retry_count: 5,
        }
    }
}

/// A receiver that only yields the error-class subset of `Event`
/// (`Error`, `ConnectionClosed`, `ReconnectFailed`, `ReconnectMaxRetriesExceeded`).
pub struct ErrorSubscription(broadcast::Receiver<Event>);

impl ErrorSubscription {
    pub async fn recv(&mut self) -> Option<Event> {
        use broadcast::error::RecvError;
        loop {
            match self.0.recv().await {
                Ok(event) if event.is_error_class() => return Some(event),
                Ok(_) => continue,
                Err(RecvError::Closed) => return None,
                Err(RecvError::Lagged(_)) => continue,
            }
        }
    }
}

pub struct ConnectionPool {
    next_id: AtomicU64,
    connections: RwLock<HashMap<u64, ConnectionHandle>>,
    events: broadcast::Sender<Event>,
    sanity_errors: broadcast::Sender<Arc<AddedTaskError>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (sanity_errors, _) = broadcast::channel(SANITY_BUS_CAPACITY);
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            connections: RwLock::new(HashMap::new()),
            events,
            sanity_errors,
        })
    }

    /// Opens a new connection and registers it under a freshly assigned id.
    /// Does not itself await the socket opening - the caller decides whether
    /// to also call `connect()` up front or lazily on first use.
    pub async fn create_connection(&self, options: &ConnectionOptions) -> Result<u64, ClientError> {
        if options.app_id.is_empty() {
            return Err(crate::error::ConstructionError::MissingAppId.into());
        }
        let url = build_api_url(&options.endpoint, &options.app_id, &options.lang, &options.brand)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = ConnectionHandle::spawn_owned(
            id,
            url,
            options.auto_reconnect,
            options.max_retry_count,
            self.events.clone(),
            self.sanity_errors.clone(),
        );
        self.connections.write().await.insert(id, handle);
        Ok(id)
    }

    #[cfg(test)]
    pub(crate) async fn create_connection_with_socket(&self, socket: crate::transport::BoxedWsStream) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle =
            ConnectionHandle::spawn_preopened(id, socket, self.events.clone(), self.sanity_errors.clone());
        self.connections.write().await.insert(id, handle);
        id
    }

    pub async fn handle(&self, connection_id: u64) -> Result<ConnectionHandle, ClientError> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .cloned()
            .ok_or_else(|| ConnectionError::NotFound(connection_id).into())
    }

    pub async fn connect(&self, connection_id: u64) -> Result<(), ClientError> {
        self.handle(connection_id).await?.connect().await
    }

    pub async fn close_connection(&self, connection_id: u64) -> Result<(), ClientError> {
        let handle = {
            let mut guard = self.connections.write().await;
            guard.remove(&connection_id).ok_or(ConnectionError::NotFound(connection_id))?
        };
        handle.disconnect().await
    }

    /// Connects every pending connection concurrently, gathering a boolean
    /// outcome per attempt rather than aborting on the first failure.
    /// Connections already open, closing, or closed are left untouched.
    pub async fn connect_all(&self) -> Vec<bool> {
        let handles: Vec<_> = self
            .connections
            .read()
            .await
            .values()
            .filter(|handle| handle.readiness() == Readiness::Pending)
            .cloned()
            .collect();
        futures_util::future::join_all(handles.iter().map(|handle| handle.connect()))
            .await
            .into_iter()
            .map(|result| result.is_ok())
            .collect()
    }

    pub async fn disconnect_all(&self) -> Result<(), ClientError> {
        let ids: Vec<_> = self.connections.read().await.keys().copied().collect();
        for id in ids {
            self.close_connection(id).await?;
        }
        Ok(())
    }

    pub async fn connection_ids(&self) -> Vec<u64> {
        self.connections.read().await.keys().copied().collect()
    }

    /// All events across every connection this pool owns, tagged with
    /// `connection_id`.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// The error-class subset of `subscribe_events`, grounded in the
    /// original client's `monitor_errors()` helper.
    pub fn subscribe_errors(&self) -> ErrorSubscription {
        ErrorSubscription(self.events.subscribe())
    }

    /// Uncaught failures from internally-scheduled tasks (connection
    /// actors, subscription bookkeeping), grounded in the original
    /// client's `sanity_errors` stream.
    pub fn subscribe_sanity_errors(&self) -> broadcast::Receiver<Arc<AddedTaskError>> {
        self.sanity_errors.subscribe()
    }

    pub(crate) fn sanity_errors(&self) -> broadcast::Sender<Arc<AddedTaskError>> {
        self.sanity_errors.clone()
    }
}
