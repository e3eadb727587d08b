use futures_util::{Sink, Stream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// A boxable duplex WebSocket-message stream: either a real TLS-or-plain TCP
/// socket (`tokio_tungstenite::connect_async`'s return type) or, in tests, an
/// in-memory pair. Boxing trades a little dynamic dispatch for letting the
/// actor stay generic-free over "where did this socket come from".
pub(crate) trait WsStream: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send {}

impl<T> WsStream for T where T: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send
{}

pub(crate) type BoxedWsStream = Box<dyn WsStream>;

/// A connection's lifecycle state, mirrored into a `tokio::sync::watch`
/// channel so in-flight send tasks can wait for `Open` without polling the
/// actor directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Open,
    ClosedError,
    ClosedOk,
}

/// How a connection obtains its socket, decided once at construction.
pub(crate) enum Origin {
    /// The transport owns the socket: it dials `url` itself and is free to
    /// redial it on an unexpected close.
    Owned { url: String },
    /// The socket was handed in already connected. Reconnection is not
    /// attempted regardless of the `auto_reconnect` setting - there is no
    /// URL to redial, and the caller retained the intent to manage the
    /// resource's lifecycle themselves.
    PreOpened(Option<BoxedWsStream>),
}
