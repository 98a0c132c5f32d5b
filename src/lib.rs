//! # Millrace
//!
//! Client library for the Millrace hosted realtime messaging service.
//!
//! ## Features
//!
//! - Named pub/sub channels multiplexed over one WebSocket connection
//! - Automatic reconnection with jittered backoff, suspension after a
//!   sustained outage and connection resume/recovery
//! - Publishes queued while offline and delivered once connected, with
//!   per-message ACK tracking
//! - Channel presence with full member-set synchronization
//! - Token authentication with automatic single-shot renewal
//!
//! ## Example
//!
//! ```no_run
//! use millrace::{MillraceClient, MillraceOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> millrace::Result<()> {
//!     let client = MillraceClient::from_options(
//!         MillraceOptions::new("app.key:secret").client_id("alice"),
//!     )?;
//!     client.wait_for_connection(Duration::from_secs(5)).await?;
//!
//!     let room = client.channel("room");
//!     room.subscribe_event("chat", |message| {
//!         println!("chat: {:?}", message.data);
//!     });
//!     room.publish("chat", serde_json::json!({ "text": "hello" })).await?;
//!
//!     room.presence().enter(Some(serde_json::json!({ "mood": "curious" }))).await?;
//!     let members = room.presence().members(true).await?;
//!     println!("{} members present", members.len());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Callbacks
//!
//! Subscriber and state-change callbacks run synchronously on the client's
//! internal connection task, in wire arrival order. Keep them short and
//! non-blocking; applications that need events on a particular thread (a UI
//! loop, say) should forward them from the callback to their own executor.

pub mod auth;
pub mod channels;
pub mod connection;
pub mod events;
pub mod protocol;
pub mod transports;
pub mod utils;

mod client;
mod error;
mod options;

pub use auth::{AuthCallback, TokenDetails};
pub use channels::{Channel, ChannelState, ChannelStateChange, Channels, Presence, PresenceMap};
pub use client::MillraceClient;
pub use connection::{Connection, ConnectionState, ConnectionStateChange};
pub use error::{codes, ErrorInfo, MillraceError, Result};
pub use events::EventDispatcher;
pub use options::{Config, MillraceOptions};
pub use protocol::{Action, Message, PresenceAction, PresenceMessage, ProtocolMessage};
