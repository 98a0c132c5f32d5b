//! Channel presence: who is on a channel right now.
//!
//! The service announces the existing member set after attach through SYNC
//! frames, paged via `channelSerial`, and keeps it current with realtime
//! PRESENCE frames. [`PresenceMap`] holds the reconciled member set;
//! [`Presence`] is the per-channel handle exposing enter/update/leave and
//! subscriptions.

use crate::channels::channel::Channel;
use crate::error::{MillraceError, Result};
use crate::events::EventDispatcher;
use crate::protocol::{PresenceAction, PresenceMessage, ProtocolMessage};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tokio::sync::watch;
use tracing::{debug, trace};

/// Reconciled set of channel members, keyed by member key.
///
/// One client connected twice is two members; see
/// [`PresenceMessage::member_key`].
#[derive(Debug, Default)]
pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Member keys confirmed by the sync currently in progress
    seen: HashSet<String>,
    syncing: bool,
}

impl PresenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sync_in_progress(&self) -> bool {
        self.syncing
    }

    /// Start reconciling against an incoming sync.
    pub fn begin_sync(&mut self) {
        self.syncing = true;
        self.seen.clear();
    }

    /// Apply one presence event. Returns the event subscribers should see,
    /// or None when it changed nothing worth reporting.
    pub fn apply(&mut self, member: PresenceMessage) -> Option<PresenceMessage> {
        let key = member.member_key();
        match member.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                if self.syncing {
                    self.seen.insert(key.clone());
                }
                self.members.insert(key, member.clone());
                Some(member)
            }
            PresenceAction::Leave => {
                if self.syncing {
                    self.seen.remove(&key);
                }
                self.members.remove(&key).map(|_| member)
            }
            PresenceAction::Absent => {
                if self.syncing {
                    self.seen.remove(&key);
                }
                self.members.remove(&key);
                None
            }
        }
    }

    /// Finish a sync. Members the sync did not confirm are dropped and
    /// returned as synthesized leave events.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        self.syncing = false;
        let stale: Vec<String> = self
            .members
            .keys()
            .filter(|key| !self.seen.contains(*key))
            .cloned()
            .collect();
        self.seen.clear();
        stale
            .into_iter()
            .filter_map(|key| self.members.remove(&key))
            .map(synthesize_leave)
            .collect()
    }

    /// Drop every member, returning synthesized leave events for each.
    pub fn clear_with_leaves(&mut self) -> Vec<PresenceMessage> {
        self.syncing = false;
        self.seen.clear();
        self.members
            .drain()
            .map(|(_, member)| synthesize_leave(member))
            .collect()
    }

    /// Drop every member without reporting anything.
    pub fn clear(&mut self) {
        self.syncing = false;
        self.seen.clear();
        self.members.clear();
    }

    pub fn get(&self, member_key: &str) -> Option<&PresenceMessage> {
        self.members.get(member_key)
    }

    pub fn members(&self) -> Vec<PresenceMessage> {
        self.members.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn synthesize_leave(mut member: PresenceMessage) -> PresenceMessage {
    member.action = PresenceAction::Leave;
    member.timestamp = Some(chrono::Utc::now().timestamp_millis());
    member
}

/// A sync page serial is "<serial>:<cursor>"; an empty or missing cursor
/// marks the final page.
fn is_final_sync_page(channel_serial: Option<&str>) -> bool {
    match channel_serial.and_then(|serial| serial.split_once(':')) {
        Some((_, cursor)) => cursor.is_empty(),
        None => true,
    }
}

/// Presence state machine owned by a channel.
#[derive(Debug)]
pub(crate) struct PresenceCore {
    channel_name: String,
    map: RwLock<PresenceMap>,
    dispatcher: EventDispatcher<PresenceMessage>,
    /// True whenever no sync is outstanding
    synced: watch::Sender<bool>,
}

impl PresenceCore {
    pub(crate) fn new(channel_name: String) -> Self {
        let (synced, _) = watch::channel(true);
        Self {
            channel_name,
            map: RwLock::new(PresenceMap::new()),
            dispatcher: EventDispatcher::new(),
            synced,
        }
    }

    /// Apply a realtime PRESENCE frame.
    pub(crate) fn handle_presence(&self, frame: &ProtocolMessage) {
        self.apply_entries(frame);
    }

    /// Apply one SYNC page, finishing the sync on the final page.
    pub(crate) fn handle_sync(&self, frame: &ProtocolMessage) {
        {
            let mut map = self.map.write();
            if !map.sync_in_progress() {
                debug!("Presence sync started on {}", self.channel_name);
                map.begin_sync();
            }
        }
        self.synced.send_replace(false);

        self.apply_entries(frame);

        if is_final_sync_page(frame.channel_serial.as_deref()) {
            let leaves = self.map.write().end_sync();
            debug!(
                "Presence sync complete on {} ({} members dropped)",
                self.channel_name,
                leaves.len()
            );
            for leave in &leaves {
                self.emit(leave);
            }
            self.synced.send_replace(true);
        }
    }

    fn apply_entries(&self, frame: &ProtocolMessage) {
        let Some(ref entries) = frame.presence else {
            return;
        };
        for entry in entries {
            let mut member = entry.clone();
            if member.connection_id.is_none() {
                member.connection_id = frame.connection_id.clone();
            }
            if member.timestamp.is_none() {
                member.timestamp = frame.timestamp;
            }
            let event = self.map.write().apply(member);
            match event {
                Some(event) => self.emit(&event),
                None => trace!("Presence event on {} changed nothing", self.channel_name),
            }
        }
    }

    /// React to an ATTACHED frame. Without the presence flag the channel
    /// has no members, so anything we were tracking is stale.
    pub(crate) fn on_attached(&self, has_presence: bool) {
        if has_presence {
            self.map.write().begin_sync();
            self.synced.send_replace(false);
        } else {
            let leaves = self.map.write().clear_with_leaves();
            for leave in &leaves {
                self.emit(leave);
            }
            self.synced.send_replace(true);
        }
    }

    /// Stop tracking members, silently. Used when the channel leaves the
    /// attached world.
    pub(crate) fn reset(&self) {
        self.map.write().clear();
        self.synced.send_replace(true);
    }

    pub(crate) fn members(&self) -> Vec<PresenceMessage> {
        self.map.read().members()
    }

    pub(crate) fn member_count(&self) -> usize {
        self.map.read().len()
    }

    pub(crate) fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until no sync is outstanding.
    pub(crate) async fn wait_for_sync(&self) -> Result<()> {
        let mut rx = self.synced.subscribe();
        while !*rx.borrow_and_update() {
            rx.changed()
                .await
                .map_err(|_| MillraceError::channel("Presence tracking stopped"))?;
        }
        Ok(())
    }

    pub(crate) fn subscribe(
        &self,
        handler: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> u64 {
        self.dispatcher.bind_global(handler)
    }

    pub(crate) fn subscribe_action(
        &self,
        action: PresenceAction,
        handler: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> u64 {
        self.dispatcher.bind(action.to_string(), handler)
    }

    pub(crate) fn unsubscribe(&self, handler_id: u64) {
        self.dispatcher.unbind(None, Some(handler_id));
    }

    pub(crate) fn unsubscribe_all(&self) {
        self.dispatcher.unbind_all();
    }

    fn emit(&self, event: &PresenceMessage) {
        self.dispatcher.emit(&event.action.to_string(), event);
    }
}

/// Presence operations on one channel.
///
/// Enter, update and leave follow the channel's publish contract: they are
/// queued while an attachment is pending and rejected when the channel is
/// detached or failed. Entering requires a configured `client_id` and
/// attaches the channel implicitly when needed.
#[derive(Clone, Debug)]
pub struct Presence {
    channel: Channel,
}

impl Presence {
    pub(crate) fn new(channel: Channel) -> Self {
        Self { channel }
    }

    /// Announce this client as present on the channel.
    pub async fn enter(&self, data: Option<serde_json::Value>) -> Result<()> {
        self.channel
            .publish_presence(PresenceAction::Enter, data)
            .await
    }

    /// Update this client's presence payload.
    pub async fn update(&self, data: Option<serde_json::Value>) -> Result<()> {
        self.channel
            .publish_presence(PresenceAction::Update, data)
            .await
    }

    /// Remove this client from the channel's member set.
    pub async fn leave(&self, data: Option<serde_json::Value>) -> Result<()> {
        self.channel
            .publish_presence(PresenceAction::Leave, data)
            .await
    }

    /// Current member set.
    ///
    /// With `wait_for_sync` the call first waits for any in-flight sync to
    /// complete, so the answer reflects the service's view.
    pub async fn members(&self, wait_for_sync: bool) -> Result<Vec<PresenceMessage>> {
        let core = self.channel.presence_core();
        if wait_for_sync {
            core.wait_for_sync().await?;
        }
        Ok(core.members())
    }

    /// Number of members currently tracked.
    pub fn member_count(&self) -> usize {
        self.channel.presence_core().member_count()
    }

    /// Whether the member set is fully reconciled.
    pub fn is_synced(&self) -> bool {
        self.channel.presence_core().is_synced()
    }

    /// Subscribe to every presence event on the channel.
    pub fn subscribe(&self, handler: impl Fn(&PresenceMessage) + Send + Sync + 'static) -> u64 {
        self.channel.presence_core().subscribe(handler)
    }

    /// Subscribe to presence events with a specific action.
    pub fn subscribe_action(
        &self,
        action: PresenceAction,
        handler: impl Fn(&PresenceMessage) + Send + Sync + 'static,
    ) -> u64 {
        self.channel.presence_core().subscribe_action(action, handler)
    }

    /// Remove a presence subscription by id.
    pub fn unsubscribe(&self, handler_id: u64) {
        self.channel.presence_core().unsubscribe(handler_id);
    }

    /// Remove every presence subscription.
    pub fn unsubscribe_all(&self) {
        self.channel.presence_core().unsubscribe_all();
    }
}
