//! Core client runtime for multiplexing JSON-over-WebSocket request/response
//! and subscription traffic against the Deriv API.
//!
//! The pieces compose roughly bottom-up:
//!
//! - [`transport`] - one actor task per websocket connection, handling
//!   connect/reconnect, request/response correlation, and raw frame IO.
//! - [`subscription`] - multiplexes callers asking for the same stream onto
//!   one upstream subscription per connection.
//! - [`cache`] - the last response seen per request, plus waiting on the
//!   next response of a given type.
//! - [`pool`] - owns the set of live connections and their shared event
//!   buses.
//! - [`client`] - the facade tying the above together.

pub mod cache;
pub mod client;
pub mod error;
pub mod event;
pub mod middleware;
pub mod pool;
pub mod shared;
pub mod sink;
pub mod subscription;
mod transport;
pub mod wire;

pub use client::{Client, ClientOptions, Source};
pub use error::{AddedTaskError, ApiError, ClientError, ConnectionError, ConstructionError, ResponseError};
pub use event::Event;
pub use middleware::Middleware;
pub use pool::{ConnectionOptions, ConnectionPool, ErrorSubscription};
pub use shared::SharedSubscription;
pub use sink::SubscriptionEvent;
pub use transport::{build_api_url, ConnectionHandle, Readiness};

#[cfg(test)]
mod integration_tests;
