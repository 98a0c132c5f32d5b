//! Channel registry.
//!
//! Owns every channel created on a client, routes channel-scoped frames to
//! the right one and fans connection state changes out to all of them.

use crate::channels::channel::Channel;
use crate::connection::{ConnectionManager, ConnectionStateChange};
use crate::protocol::ProtocolMessage;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Channels {
    channels: DashMap<String, Channel>,
    connection: Arc<ConnectionManager>,
    client_id: Option<String>,
    request_timeout: Duration,
}

impl Channels {
    pub(crate) fn new(
        connection: Arc<ConnectionManager>,
        client_id: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            connection,
            client_id,
            request_timeout,
        }
    }

    /// Get a channel by name, creating it on first use.
    pub fn get(&self, name: &str) -> Channel {
        if let Some(channel) = self.channels.get(name) {
            return channel.clone();
        }
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Creating channel {}", name);
                Channel::new(
                    name,
                    self.connection.clone(),
                    self.client_id.clone(),
                    self.request_timeout,
                )
            })
            .clone()
    }

    /// Look up a channel without creating it.
    pub fn find(&self, name: &str) -> Option<Channel> {
        self.channels.get(name).map(|channel| channel.clone())
    }

    /// Remove a channel from the registry and return it.
    ///
    /// The channel keeps working for anyone still holding a clone, but no
    /// further frames are routed to it. Detach before releasing to tear the
    /// attachment down remotely.
    pub fn release(&self, name: &str) -> Option<Channel> {
        self.channels.remove(name).map(|(_, channel)| {
            debug!("Released channel {}", name);
            channel
        })
    }

    /// Every channel currently registered.
    pub fn all(&self) -> Vec<Channel> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Route a channel-scoped frame to its channel.
    pub(crate) fn route_frame(&self, frame: &ProtocolMessage) {
        let Some(ref name) = frame.channel else {
            warn!("Dropping channel frame without a channel name");
            return;
        };
        match self.find(name) {
            Some(channel) => channel.handle_frame(frame),
            None => debug!("No channel registered for {}", name),
        }
    }

    /// Fan a connection state change out to every channel.
    pub(crate) fn handle_connection_change(&self, change: &ConnectionStateChange) {
        // Collect first so listeners never run under the registry's locks
        for channel in self.all() {
            channel.handle_connection_change(change);
        }
    }
}

impl std::fmt::Debug for Channels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channels")
            .field("count", &self.len())
            .finish()
    }
}
