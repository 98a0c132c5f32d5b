//! Transport layer.

pub mod transport;
pub mod websocket;

pub use transport::{Transport, TransportEvent, TransportFactory, TransportListener};
pub use websocket::{WebSocketFactory, WebSocketTransport};
