//! Transport trait definition.

use crate::error::Result;
use crate::protocol::ProtocolMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// Events a transport delivers to its listener.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport finished its handshake and can carry frames
    Opened,
    /// A protocol frame arrived
    Message(ProtocolMessage),
    /// The transport failed; a Closed event may follow
    Error(String),
    /// The transport is gone
    Closed {
        code: Option<u16>,
        reason: Option<String>,
    },
}

/// Listener receiving every event a transport produces
pub type TransportListener = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// A duplex carrier of protocol frames.
///
/// `connect` starts the attempt and returns without waiting for it; success
/// or failure arrives through the listener as `Opened`, `Error` or `Closed`.
/// The caller owns any timeout on the attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start connecting to the given URL
    async fn connect(&mut self, url: &str) -> Result<()>;

    /// Close the transport
    async fn close(&mut self);

    /// Send a protocol frame
    async fn send(&self, message: &ProtocolMessage) -> Result<()>;

    /// Check if the transport is open
    fn is_connected(&self) -> bool;

    /// Install the event listener. Must be called before `connect`.
    fn set_listener(&mut self, listener: TransportListener);
}

/// Factory producing a fresh transport per connection attempt.
pub trait TransportFactory: Send + Sync {
    fn create(&self) -> Box<dyn Transport>;
}
