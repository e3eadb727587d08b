//! The public facade: a single `Client` aggregating the Connection Pool,
//! Subscription Manager, Response Cache, and Middleware chain into the
//! surface most callers use directly, the way `deriv_api.py`'s `DerivAPI`
//! sits on top of its `Connection`/`ConnectionManager`/`SubscriptionManager`.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::Stream;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use crate::cache::ResponseCache;
use crate::error::{ApiError, ClientError};
use crate::middleware::{Middleware, MiddlewareChain};
use crate::pool::{ConnectionOptions, ConnectionPool, ErrorSubscription};
use crate::shared::SharedSubscription;
use crate::sink::SubscriptionEvent;
use crate::subscription::SubscriptionManager;
use crate::wire;

/// Builder for a `Client`'s default connection and retry behavior.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    endpoint: String,
    app_id: String,
    lang: String,
    brand: String,
    auto_reconnect: bool,
    max_retry_count: usize,
}

impl ClientOptions {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            endpoint: "ws.derivws.com".to_string(),
            app_id: app_id.into(),
            lang: "EN".to_string(),
            brand: "deriv".to_string(),
            auto_reconnect: true,
            max_retry_count: 5,
        }
    }

    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = lang.into();
        self
    }

    pub fn brand(mut self, brand: impl Into<String>) -> Self {
        self.brand = brand.into();
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn max_retry_count(mut self, count: usize) -> Self {
        self.max_retry_count = count;
        self
    }

    fn into_connection_options(self) -> ConnectionOptions {
        ConnectionOptions {
            endpoint: self.endpoint,
            app_id: self.app_id,
            lang: self.lang,
            brand: self.brand,
            auto_reconnect: self.auto_reconnect,
            max_retry_count: self.max_retry_count,
        }
    }
}

/// A multicast source returned by `send_and_get_source`: the raw broadcast
/// channel backing one outbound call, bypassing the Subscription Manager's
/// dedup/teardown bookkeeping for callers that want to manage fan-out
/// themselves.
pub struct Source(BroadcastStream<SubscriptionEvent>);

impl Source {
    pub(crate) fn new(rx: broadcast::Receiver<SubscriptionEvent>) -> Self {
        Self(BroadcastStream::new(rx))
    }

    pub async fn recv(&mut self) -> Option<SubscriptionEvent> {
        use futures_util::StreamExt;
        loop {
            match self.0.next().await {
                Some(Ok(item)) => return Some(item),
                Some(Err(BroadcastStreamRecvError::Lagged(_))) => continue,
                None => return None,
            }
        }
    }
}

impl Stream for Source {
    type Item = SubscriptionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            return match Pin::new(&mut self.0).poll_next(cx) {
                Poll::Ready(Some(Ok(item))) => Poll::Ready(Some(item)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            };
        }
    }
}

pub struct Client {
    pool: Arc<ConnectionPool>,
    subscriptions: Arc<SubscriptionManager>,
    cache: Arc<ResponseCache>,
    middleware: Mutex<MiddlewareChain>,
    default_connection: u64,
}

impl Client {
    /// Opens (and connects) a default connection under the given options.
    pub async fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let pool = ConnectionPool::new();
        let default_connection = pool.create_connection(&options.into_connection_options()).await?;
        pool.connect(default_connection).await?;
        let subscriptions = SubscriptionManager::new(pool.clone());
        Ok(Self {
            pool,
            subscriptions,
            cache: Arc::new(ResponseCache::new()),
            middleware: Mutex::new(MiddlewareChain::new()),
            default_connection,
        })
    }

    /// Builds a client around an already-open (in practice, mock) socket
    /// instead of dialing a URL. Connections opened this way never
    /// auto-reconnect - see `transport::Origin::PreOpened`.
    #[cfg(test)]
    pub(crate) async fn new_with_socket(socket: crate::transport::BoxedWsStream) -> Self {
        let pool = ConnectionPool::new();
        let default_connection = pool.create_connection_with_socket(socket).await;
        pool.connect(default_connection).await.expect("preopened connect never fails");
        let subscriptions = SubscriptionManager::new(pool.clone());
        Self {
            pool,
            subscriptions,
            cache: Arc::new(ResponseCache::new()),
            middleware: Mutex::new(MiddlewareChain::new()),
            default_connection,
        }
    }

    pub fn connection_pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn default_connection_id(&self) -> u64 {
        self.default_connection
    }

    pub fn use_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().unwrap().register(middleware);
    }

    pub async fn create_connection(&self, options: &ConnectionOptions) -> Result<u64, ClientError> {
        self.pool.create_connection(options).await
    }

    /// Opens a new connection under the client's default options and
    /// connects it immediately.
    pub async fn connect(&self, connection_id: u64) -> Result<(), ClientError> {
        self.pool.connect(connection_id).await
    }

    pub async fn disconnect(&self, connection_id: u64) -> Result<(), ClientError> {
        self.pool.close_connection(connection_id).await
    }

    pub async fn disconnect_all(&self) -> Result<(), ClientError> {
        self.pool.disconnect_all().await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<crate::event::Event> {
        self.pool.subscribe_events()
    }

    pub fn subscribe_errors(&self) -> ErrorSubscription {
        self.pool.subscribe_errors()
    }

    /// Uncaught failures from internally-scheduled tasks (connection
    /// actors, subscription bookkeeping) - the sanity-error bus.
    pub fn subscribe_sanity_errors(&self) -> broadcast::Receiver<Arc<crate::error::AddedTaskError>> {
        self.pool.subscribe_sanity_errors()
    }

    /// Sends `request` on the default connection and waits for its single
    /// response. For anything that names a recognized stream type, prefer
    /// `subscribe` instead.
    pub async fn send(&self, request: Value) -> Result<Value, ClientError> {
        self.send_on(self.default_connection, request).await
    }

    pub async fn send_on(&self, connection_id: u64, request: Value) -> Result<Value, ClientError> {
        let mut request = request;
        if let Some(shortcut) = self.middleware.lock().unwrap().before_send(&mut request) {
            return Ok(shortcut);
        }

        let handle = self.pool.handle(connection_id).await?;
        let (req_id, sender) = handle.send_and_register(request.clone(), None).await?;
        let mut rx = sender.subscribe();
        let result = rx.recv().await.ok_or(ClientError::ActorGone)?;
        handle.complete_request(req_id);

        if let Some(override_value) = self.middleware.lock().unwrap().after_send(&request, &result) {
            self.cache.insert(&request, override_value.clone());
            return Ok(override_value);
        }

        if let Ok(value) = &result {
            self.cache.insert(&request, value.clone());
        }
        result.map_err(|err| ClientError::Response((*err).clone()))
    }

    /// Sends `request` and returns the raw multicast source backing its
    /// responses, without going through the subscription dedup path. Useful
    /// when the caller wants to drive fan-out itself.
    pub async fn send_and_get_source(&self, connection_id: u64, request: Value) -> Result<Source, ClientError> {
        let mut request = request;
        let _ = self.middleware.lock().unwrap().before_send(&mut request);
        let handle = self.pool.handle(connection_id).await?;
        let (_req_id, sender) = handle.send_and_register(request, None).await?;
        Ok(Source::new(sender.subscribe()))
    }

    /// Subscribes to `request` on the default connection. `request` must
    /// name one of the recognized stream types.
    pub async fn subscribe(&self, request: Value) -> Result<SharedSubscription, ClientError> {
        self.subscribe_on(self.default_connection, request).await
    }

    pub async fn subscribe_on(&self, connection_id: u64, request: Value) -> Result<SharedSubscription, ClientError> {
        if wire::msg_type(&request).is_none() {
            return Err(ApiError::UnknownStreamType.into());
        }
        self.subscriptions.subscribe(connection_id, request).await
    }

    pub async fn forget(&self, connection_id: u64, subscription_id: &str) -> Result<Value, ClientError> {
        self.subscriptions.forget(connection_id, subscription_id).await
    }

    pub async fn forget_all(&self, connection_id: u64, types: &[&str]) -> Result<Value, ClientError> {
        self.subscriptions.forget_all(connection_id, types).await
    }

    pub async fn expect_response(&self, msg_type: &'static str) -> Value {
        self.cache.expect_response(msg_type).await
    }

    pub fn cached_response(&self, request: &Value) -> Option<Value> {
        self.cache.get(request)
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}
