//! Middleware hooks: synchronous interception points around every outbound
//! call, mirroring the reference client's `sendWillBeCalled` /
//! `sendIsCalled` pair.

use std::sync::Arc;

use serde_json::Value;

use crate::sink::SubscriptionEvent;

/// Implemented by anything that wants to observe, rewrite, or short-circuit
/// requests as they pass through the facade. Both hooks are synchronous:
/// they run inline on the caller's task, not dispatched elsewhere, so a
/// middleware must not block.
pub trait Middleware: Send + Sync {
    /// Called just before a request is handed to the transport. May mutate
    /// `request` in place (e.g. to inject a shared `passthrough` field).
    /// Returning `Some(value)` short-circuits the send entirely: no network
    /// call happens and `value` becomes the result seen by the caller.
    fn send_will_be_called(&self, _request: &mut Value) -> Option<Value> {
        None
    }

    /// Called once the first response for a request has arrived. Returning
    /// `Some(value)` replaces the real response with `value`.
    fn send_is_called(&self, _request: &Value, _response: &SubscriptionEvent) -> Option<Value> {
        None
    }
}

#[derive(Default)]
pub struct MiddlewareChain(Vec<Arc<dyn Middleware>>);

impl MiddlewareChain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn register(&mut self, middleware: Arc<dyn Middleware>) {
        self.0.push(middleware);
    }

    /// Runs every registered hook in order, stopping at (and returning) the
    /// first `Some` short-circuit value.
    pub fn before_send(&self, request: &mut Value) -> Option<Value> {
        for middleware in &self.0 {
            if let Some(value) = middleware.send_will_be_called(request) {
                return Some(value);
            }
        }
        None
    }

    /// Runs every registered hook in order, stopping at (and returning) the
    /// first `Some` override value.
    pub fn after_send(&self, request: &Value, response: &SubscriptionEvent) -> Option<Value> {
        for middleware in &self.0 {
            if let Some(value) = middleware.send_is_called(request, response) {
                return Some(value);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingMiddleware(Arc<AtomicUsize>);

    impl Middleware for CountingMiddleware {
        fn send_will_be_called(&self, request: &mut Value) -> Option<Value> {
            if let Value::Object(map) = request {
                map.insert("passthrough".to_string(), json!(true));
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    #[test]
    fn before_send_runs_every_registered_hook() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut chain = MiddlewareChain::new();
        chain.register(Arc::new(CountingMiddleware(counter.clone())));
        let mut request = json!({"ping": 1});
        chain.before_send(&mut request);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(request["passthrough"], json!(true));
    }
}
