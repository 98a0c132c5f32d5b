//! Wire protocol for the Millrace realtime service.

pub mod message;

pub use message::{Action, Message, PresenceAction, PresenceMessage, ProtocolMessage};
