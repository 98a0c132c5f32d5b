//! Channel state machine.
//!
//! Each channel runs its own attach/detach lifecycle on top of the shared
//! connection. Publishes are queued while an attachment is pending and
//! handed to the connection once the channel reaches `Attached`.

use crate::channels::presence::{Presence, PresenceCore};
use crate::connection::{
    ConnectionManager, ConnectionState, ConnectionStateChange, MessageQueue, QueuedMessage,
};
use crate::error::{ErrorInfo, MillraceError, Result};
use crate::events::EventDispatcher;
use crate::protocol::{Action, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use crate::utils::CancellableTimer;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Channel attachment state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// No attach has been requested yet
    Initialized,
    /// An ATTACH is in flight or waiting for the connection to come up
    Attaching,
    /// Attachment confirmed by the service
    Attached,
    /// A DETACH is in flight
    Detaching,
    /// Channel is detached
    Detached,
    /// Attachment lost or timed out; will be retried when the connection
    /// is next connected
    Suspended,
    /// Unrecoverable channel error
    Failed,
}

impl ChannelState {
    /// Check if attached
    pub fn is_attached(&self) -> bool {
        matches!(self, Self::Attached)
    }

    /// Check if in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }

    /// Whether publishes may be queued for later delivery in this state
    pub fn can_queue_publishes(&self) -> bool {
        matches!(self, Self::Initialized | Self::Attaching | Self::Suspended)
    }
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::Initialized
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "initialized"),
            Self::Attaching => write!(f, "attaching"),
            Self::Attached => write!(f, "attached"),
            Self::Detaching => write!(f, "detaching"),
            Self::Detached => write!(f, "detached"),
            Self::Suspended => write!(f, "suspended"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Notification delivered to channel state listeners.
#[derive(Debug, Clone)]
pub struct ChannelStateChange {
    pub previous: ChannelState,
    pub current: ChannelState,
    /// Why the transition happened, when an error drove it
    pub reason: Option<ErrorInfo>,
}

impl ChannelStateChange {
    pub fn new(previous: ChannelState, current: ChannelState) -> Self {
        Self {
            previous,
            current,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: ErrorInfo) -> Self {
        self.reason = Some(reason);
        self
    }
}

type OpWaiter = oneshot::Sender<std::result::Result<(), ErrorInfo>>;

/// A named pub/sub channel.
///
/// Cheap to clone; all clones share the same underlying state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub(crate) fn new(
        name: impl Into<String>,
        connection: Arc<ConnectionManager>,
        client_id: Option<String>,
        request_timeout: Duration,
    ) -> Self {
        let name = name.into();
        Self {
            inner: Arc::new(ChannelInner {
                presence: PresenceCore::new(name.clone()),
                name,
                client_id,
                request_timeout,
                connection,
                state: RwLock::new(ChannelState::Initialized),
                reason: RwLock::new(None),
                state_dispatcher: EventDispatcher::new(),
                message_dispatcher: EventDispatcher::new(),
                queue: Mutex::new(MessageQueue::new()),
                attach_waiters: Mutex::new(Vec::new()),
                detach_waiters: Mutex::new(Vec::new()),
                op_timer: Mutex::new(None),
            }),
        }
    }

    /// Channel name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current attachment state
    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    /// Error that drove the last state transition, if any
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.inner.error_reason()
    }

    /// Check if attached
    pub fn is_attached(&self) -> bool {
        self.state().is_attached()
    }

    /// Presence operations for this channel
    pub fn presence(&self) -> Presence {
        Presence::new(self.clone())
    }

    /// Attach to the channel, resolving once the service confirms.
    ///
    /// A no-op when already attached. The ATTACH frame is only put on the
    /// wire while the connection is connected; otherwise the channel stays
    /// in `Attaching` and the frame is sent on the next `Connected`.
    pub async fn attach(&self) -> Result<()> {
        match self.inner.state() {
            ChannelState::Attached => return Ok(()),
            ChannelState::Detaching => {
                return Err(MillraceError::invalid_state(format!(
                    "Cannot attach to {} while a detach is in progress",
                    self.inner.name
                )));
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        self.inner.attach_waiters.lock().push(tx);
        self.inner.start_attach();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(info)) => Err(info.into()),
            Err(_) => Err(MillraceError::channel("Attach abandoned")),
        }
    }

    /// Detach from the channel, resolving once the service confirms.
    ///
    /// When the connection is not connected there is nothing to tear down
    /// remotely and the channel moves straight to `Detached`.
    pub async fn detach(&self) -> Result<()> {
        match self.inner.state() {
            ChannelState::Detached => return Ok(()),
            ChannelState::Initialized => {
                self.inner.update_state(ChannelState::Detached, None);
                return Ok(());
            }
            ChannelState::Failed => {
                let info = self
                    .inner
                    .error_reason()
                    .unwrap_or_else(|| ErrorInfo::channel("Channel failed"));
                return Err(info.into());
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        self.inner.detach_waiters.lock().push(tx);
        self.inner.start_detach();

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(info)) => Err(info.into()),
            Err(_) => Err(MillraceError::channel("Detach abandoned")),
        }
    }

    /// Publish a single named event.
    pub async fn publish(&self, name: impl Into<String>, data: serde_json::Value) -> Result<()> {
        self.publish_messages(vec![Message::new(name, data)]).await
    }

    /// Publish a pre-built message.
    pub async fn publish_message(&self, message: Message) -> Result<()> {
        self.publish_messages(vec![message]).await
    }

    /// Publish a batch of messages as one frame, resolving on ACK.
    ///
    /// While the channel is `Initialized`, `Attaching` or `Suspended` the
    /// publish is queued; from `Initialized` it also triggers an implicit
    /// attach. In `Detaching`, `Detached` and `Failed` the publish is
    /// rejected without touching the queue.
    pub async fn publish_messages(&self, mut messages: Vec<Message>) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        for message in &mut messages {
            if message.id.is_none() {
                message.id = Some(Uuid::new_v4().to_string());
            }
            if message.client_id.is_none() {
                message.client_id = self.inner.client_id.clone();
            }
        }
        let frame = ProtocolMessage::publish(&self.inner.name, messages);
        self.send_on_channel(frame).await
    }

    pub(crate) async fn publish_presence(
        &self,
        action: PresenceAction,
        data: Option<serde_json::Value>,
    ) -> Result<()> {
        if action == PresenceAction::Enter && self.inner.client_id.is_none() {
            return Err(MillraceError::config(
                "Entering presence requires a configured client_id",
            ));
        }
        let mut member = PresenceMessage::new(action);
        member.client_id = self.inner.client_id.clone();
        member.data = data;
        let frame = ProtocolMessage::presence(&self.inner.name, vec![member]);
        self.send_on_channel(frame).await
    }

    async fn send_on_channel(&self, frame: ProtocolMessage) -> Result<()> {
        let (tx, rx) = oneshot::channel();

        let state = self.inner.state();
        match state {
            ChannelState::Attached => {
                self.inner.connection.send(frame, Some(tx)).await?;
            }
            ChannelState::Initialized | ChannelState::Attaching | ChannelState::Suspended => {
                self.inner
                    .queue
                    .lock()
                    .push(QueuedMessage::new(frame, Some(tx)));
                if state == ChannelState::Initialized {
                    self.inner.start_attach();
                }
                // A queue-emptying transition may have run between the state
                // read above and the push; settle against the current state.
                self.inner.settle_queue();
            }
            ChannelState::Detaching | ChannelState::Detached => {
                return Err(MillraceError::channel(format!(
                    "Cannot publish on {} while {}",
                    self.inner.name, state
                )));
            }
            ChannelState::Failed => {
                let info = self
                    .inner
                    .error_reason()
                    .unwrap_or_else(|| ErrorInfo::channel("Channel failed"));
                return Err(info.into());
            }
        }

        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(info)) => Err(info.into()),
            Err(_) => Err(MillraceError::channel("Message delivery abandoned")),
        }
    }

    /// Subscribe to every message on the channel.
    pub fn subscribe(&self, handler: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        self.inner.message_dispatcher.bind_global(handler)
    }

    /// Subscribe to messages with a specific event name.
    pub fn subscribe_event(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.message_dispatcher.bind(name, handler)
    }

    /// Remove a message subscription by id.
    pub fn unsubscribe(&self, handler_id: u64) {
        self.inner.message_dispatcher.unbind(None, Some(handler_id));
    }

    /// Remove every message subscription.
    pub fn unsubscribe_all(&self) {
        self.inner.message_dispatcher.unbind_all();
    }

    /// Listen for transitions into a specific state.
    pub fn on(
        &self,
        state: ChannelState,
        handler: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.inner
            .state_dispatcher
            .bind(state.to_string(), handler)
    }

    /// Listen for every state transition.
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ChannelStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.inner.state_dispatcher.bind_global(handler)
    }

    /// Remove a state listener by id.
    pub fn off(&self, handler_id: u64) {
        self.inner.state_dispatcher.unbind(None, Some(handler_id));
    }

    pub(crate) fn presence_core(&self) -> &PresenceCore {
        &self.inner.presence
    }

    /// Feed a channel-scoped frame into the state machine.
    pub(crate) fn handle_frame(&self, frame: &ProtocolMessage) {
        let Some(action) = frame.action else {
            return;
        };

        // A detaching channel only cares about the detach outcome.
        if self.inner.state() == ChannelState::Detaching
            && !matches!(action, Action::Detached | Action::Error)
        {
            trace!(
                "Ignoring {} on {} while detaching",
                action,
                self.inner.name
            );
            return;
        }

        match action {
            Action::Attached => self.inner.handle_attached(frame),
            Action::Detached => self.inner.handle_detached(frame),
            Action::Error => self.inner.handle_error(frame),
            Action::Message => self.inner.handle_message(frame),
            Action::Presence => self.inner.presence.handle_presence(frame),
            Action::Sync => self.inner.presence.handle_sync(frame),
            other => trace!("Ignoring {} frame on {}", other, self.inner.name),
        }
    }

    /// React to a connection state transition.
    pub(crate) fn handle_connection_change(&self, change: &ConnectionStateChange) {
        self.inner.connection_changed(change);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

struct ChannelInner {
    name: String,
    client_id: Option<String>,
    request_timeout: Duration,
    connection: Arc<ConnectionManager>,
    state: RwLock<ChannelState>,
    reason: RwLock<Option<ErrorInfo>>,
    state_dispatcher: EventDispatcher<ChannelStateChange>,
    message_dispatcher: EventDispatcher<Message>,
    queue: Mutex<MessageQueue>,
    attach_waiters: Mutex<Vec<OpWaiter>>,
    detach_waiters: Mutex<Vec<OpWaiter>>,
    /// Timer for the attach or detach currently in flight. The two are
    /// mutually exclusive, so one slot covers both.
    op_timer: Mutex<Option<CancellableTimer>>,
    presence: PresenceCore,
}

impl ChannelInner {
    fn state(&self) -> ChannelState {
        *self.state.read()
    }

    fn error_reason(&self) -> Option<ErrorInfo> {
        self.reason.read().clone()
    }

    fn start_attach(self: &Arc<Self>) {
        if self.state() != ChannelState::Attaching {
            self.update_state(ChannelState::Attaching, None);
        }
        self.send_attach();
    }

    /// Put an ATTACH on the wire if the connection is up, and arm the
    /// attach timer either way so a dead connection cannot hang the caller.
    fn send_attach(self: &Arc<Self>) {
        if self.connection.state().is_connected() {
            if !self
                .connection
                .enqueue_frame(ProtocolMessage::attach(&self.name), None)
            {
                warn!("Could not hand ATTACH for {} to the connection", self.name);
            }
        } else {
            debug!(
                "Deferring ATTACH for {} until the connection is up",
                self.name
            );
        }
        self.arm_op_timer(TimedOp::Attach);
    }

    fn start_detach(self: &Arc<Self>) {
        if self.state() != ChannelState::Detaching {
            self.update_state(ChannelState::Detaching, None);
        }
        // An in-flight attach cannot complete once a detach supersedes it;
        // its waiters and the publishes queued behind it resolve now.
        let superseded = ErrorInfo::channel(format!(
            "Attach to {} superseded by detach",
            self.name
        ));
        self.fail_attach_waiters(superseded.clone());
        self.queue.lock().fail_all(&superseded);
        if self.connection.state().is_connected() {
            if !self
                .connection
                .enqueue_frame(ProtocolMessage::detach(&self.name), None)
            {
                warn!("Could not hand DETACH for {} to the connection", self.name);
            }
            self.arm_op_timer(TimedOp::Detach);
        } else {
            // Nothing on the wire to wait for
            self.finish_detach(None);
        }
    }

    fn arm_op_timer(self: &Arc<Self>, op: TimedOp) {
        let inner = Arc::clone(self);
        let timer = CancellableTimer::new(self.request_timeout, move || match op {
            TimedOp::Attach => inner.attach_timed_out(),
            TimedOp::Detach => inner.detach_timed_out(),
        });
        // Overwriting the slot drops and thereby cancels any previous timer
        *self.op_timer.lock() = Some(timer);
    }

    fn cancel_op_timer(&self) {
        *self.op_timer.lock() = None;
    }

    fn attach_timed_out(&self) {
        if self.state() != ChannelState::Attaching {
            return;
        }
        let reason = ErrorInfo::timeout(format!("Attach to {} timed out", self.name));
        warn!("{}", reason.message);
        self.update_state(ChannelState::Suspended, Some(reason.clone()));
        self.fail_attach_waiters(reason);
    }

    fn detach_timed_out(&self) {
        if self.state() != ChannelState::Detaching {
            return;
        }
        warn!("Detach from {} timed out; detaching locally", self.name);
        self.finish_detach(Some(ErrorInfo::timeout(format!(
            "Detach from {} timed out",
            self.name
        ))));
    }

    fn handle_attached(self: &Arc<Self>, frame: &ProtocolMessage) {
        if self.state() == ChannelState::Attached {
            // Attachment refreshed, e.g. after a resume; only the presence
            // flag carries new information.
            self.presence.on_attached(frame.has_presence_flag());
            return;
        }

        self.cancel_op_timer();
        self.presence.on_attached(frame.has_presence_flag());
        self.update_state(ChannelState::Attached, frame.error.clone());
        self.resolve_attach_waiters();
        self.flush_queue();
    }

    fn handle_detached(self: &Arc<Self>, frame: &ProtocolMessage) {
        match self.state() {
            ChannelState::Detaching => self.finish_detach(frame.error.clone()),
            ChannelState::Attached => {
                warn!("Server detached {}; reattaching", self.name);
                self.update_state(ChannelState::Attaching, frame.error.clone());
                self.send_attach();
            }
            ChannelState::Attaching => {
                let reason = frame
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::channel("Attach rejected"));
                self.cancel_op_timer();
                self.update_state(ChannelState::Suspended, Some(reason.clone()));
                self.fail_attach_waiters(reason);
            }
            state => debug!("Ignoring DETACHED for {} in state {}", self.name, state),
        }
    }

    fn handle_error(&self, frame: &ProtocolMessage) {
        match self.state() {
            ChannelState::Attaching | ChannelState::Attached | ChannelState::Detaching => {
                let reason = frame
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::channel("Channel error"));
                self.fail(reason);
            }
            state => debug!("Ignoring ERROR for {} in state {}", self.name, state),
        }
    }

    fn handle_message(&self, frame: &ProtocolMessage) {
        let Some(ref messages) = frame.messages else {
            return;
        };
        for received in messages {
            let mut message = received.clone();
            if message.connection_id.is_none() {
                message.connection_id = frame.connection_id.clone();
            }
            if message.timestamp.is_none() {
                message.timestamp = frame.timestamp;
            }
            let key = message.name.clone().unwrap_or_default();
            self.message_dispatcher.emit(&key, &message);
        }
    }

    fn connection_changed(self: &Arc<Self>, change: &ConnectionStateChange) {
        match change.current {
            ConnectionState::Connected => match self.state() {
                ChannelState::Attaching => self.send_attach(),
                ChannelState::Suspended => {
                    self.update_state(ChannelState::Attaching, None);
                    self.send_attach();
                }
                ChannelState::Attached if change.reason.is_some() => {
                    // Resume failed, so the attachment did not survive
                    self.update_state(ChannelState::Attaching, change.reason.clone());
                    self.send_attach();
                }
                _ => {}
            },
            ConnectionState::Suspended => {
                if matches!(
                    self.state(),
                    ChannelState::Attaching | ChannelState::Attached
                ) {
                    self.cancel_op_timer();
                    let reason = change
                        .reason
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::suspended("Connection suspended"));
                    self.update_state(ChannelState::Suspended, Some(reason.clone()));
                    self.fail_attach_waiters(reason);
                }
            }
            ConnectionState::Closed => {
                if matches!(
                    self.state(),
                    ChannelState::Attaching
                        | ChannelState::Attached
                        | ChannelState::Detaching
                        | ChannelState::Suspended
                ) {
                    let reason = ErrorInfo::closed("Connection closed");
                    self.cancel_op_timer();
                    self.presence.reset();
                    self.update_state(ChannelState::Detached, Some(reason.clone()));
                    self.queue.lock().fail_all(&reason);
                    self.fail_attach_waiters(reason);
                    self.resolve_detach_waiters();
                }
            }
            ConnectionState::Failed => {
                if matches!(
                    self.state(),
                    ChannelState::Attaching
                        | ChannelState::Attached
                        | ChannelState::Detaching
                        | ChannelState::Suspended
                ) {
                    let reason = change
                        .reason
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed"));
                    self.fail(reason);
                }
            }
            _ => {}
        }
    }

    fn fail(&self, reason: ErrorInfo) {
        self.cancel_op_timer();
        self.presence.reset();
        self.update_state(ChannelState::Failed, Some(reason.clone()));
        self.queue.lock().fail_all(&reason);
        self.fail_attach_waiters(reason.clone());
        self.fail_detach_waiters(reason);
    }

    fn finish_detach(&self, reason: Option<ErrorInfo>) {
        self.cancel_op_timer();
        self.presence.reset();
        self.update_state(ChannelState::Detached, reason);
        self.resolve_detach_waiters();
    }

    /// Hand queued publishes to the connection, oldest first. The lock is
    /// held across the handoff so concurrent flushes cannot interleave.
    fn flush_queue(&self) {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return;
        }
        debug!(
            "Flushing {} queued publishes on {}",
            queue.len(),
            self.name
        );
        for queued in queue.drain() {
            let QueuedMessage {
                message,
                completion,
            } = queued;
            if !self.connection.enqueue_frame(message, completion) {
                warn!("Connection refused a queued publish on {}", self.name);
            }
        }
    }

    /// Re-dispatch queued messages against the current state.
    ///
    /// A publisher pushes into the queue after reading the state, so a
    /// transition that empties the queue can run between the two steps and
    /// miss the new entry. Transitions flip the state before emptying, so
    /// re-reading here catches every late push.
    fn settle_queue(&self) {
        let state = self.state();
        match state {
            ChannelState::Attached => self.flush_queue(),
            ChannelState::Detaching | ChannelState::Detached => {
                self.queue.lock().fail_all(&ErrorInfo::channel(format!(
                    "Cannot publish on {} while {}",
                    self.name, state
                )));
            }
            ChannelState::Failed => {
                let reason = self
                    .error_reason()
                    .unwrap_or_else(|| ErrorInfo::channel("Channel failed"));
                self.queue.lock().fail_all(&reason);
            }
            _ => {}
        }
    }

    fn resolve_attach_waiters(&self) {
        for waiter in self.attach_waiters.lock().drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_attach_waiters(&self, reason: ErrorInfo) {
        for waiter in self.attach_waiters.lock().drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    fn resolve_detach_waiters(&self) {
        for waiter in self.detach_waiters.lock().drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn fail_detach_waiters(&self, reason: ErrorInfo) {
        for waiter in self.detach_waiters.lock().drain(..) {
            let _ = waiter.send(Err(reason.clone()));
        }
    }

    fn update_state(&self, next: ChannelState, reason: Option<ErrorInfo>) {
        let previous = {
            let mut state = self.state.write();
            if *state == next {
                return;
            }
            let previous = *state;
            *state = next;
            previous
        };
        *self.reason.write() = reason.clone();

        debug!("Channel {} state: {} -> {}", self.name, previous, next);

        let mut change = ChannelStateChange::new(previous, next);
        if let Some(reason) = reason {
            change = change.with_reason(reason);
        }
        self.state_dispatcher.emit(&next.to_string(), &change);
    }
}

#[derive(Clone, Copy)]
enum TimedOp {
    Attach,
    Detach,
}
