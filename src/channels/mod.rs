//! Channels: named pub/sub streams multiplexed over one realtime connection.
//!
//! A [`Channel`] tracks its own attachment lifecycle independently of the
//! connection, queues publishes while an attachment is pending and exposes
//! per-channel [`Presence`] tracking.

mod channel;
mod channels;
mod presence;

pub use channel::{Channel, ChannelState, ChannelStateChange};
pub use channels::Channels;
pub use presence::{Presence, PresenceMap};
