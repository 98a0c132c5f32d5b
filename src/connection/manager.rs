//! Connection manager: the connection state machine and its driver task.
//!
//! All mutation happens on a single driver task fed by an mpsc command
//! channel; public calls, transport events and timer expiries are commands,
//! so every transition and queue operation is serialized. Read access goes
//! through a snapshot behind a `parking_lot` lock.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::attempt::ConnectionAttempt;
use super::backoff::retry_delay;
use super::queue::{Completion, MessageQueue, PendingAcks, QueuedMessage};
use super::state::{ConnectionState, ConnectionStateChange};
use crate::auth::Auth;
use crate::error::{codes, ErrorInfo, MillraceError, Result};
use crate::events::EventDispatcher;
use crate::options::Config;
use crate::protocol::{Action, ProtocolMessage};
use crate::transports::{TransportEvent, TransportFactory};

/// Protocol version sent as the `v` connection parameter
const PROTOCOL_VERSION: &str = "1";

/// Routes channel-scoped frames to the channel layer
pub type FrameRouter = Arc<dyn Fn(&ProtocolMessage) + Send + Sync>;

/// Commands that can be sent to the connection task
#[derive(Debug)]
enum ConnectionCommand {
    Connect,
    Close,
    NetworkUnavailable,
    Send(QueuedMessage),
    Transport { generation: u64, event: TransportEvent },
}

/// Read-side mirror of the driver's state, kept current by the driver.
#[derive(Debug)]
struct Snapshot {
    state: ConnectionState,
    reason: Option<ErrorInfo>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: i64,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            state: ConnectionState::Initialized,
            reason: None,
            connection_id: None,
            connection_key: None,
            connection_serial: -1,
        }
    }
}

/// Connection manager handling the connection lifecycle
pub struct ConnectionManager {
    snapshot: Arc<RwLock<Snapshot>>,
    dispatcher: EventDispatcher<ConnectionStateChange>,
    command_tx: mpsc::Sender<ConnectionCommand>,
    router: Arc<RwLock<Option<FrameRouter>>>,
}

impl ConnectionManager {
    /// Create a new connection manager and spawn its driver task.
    /// Must be called within a tokio runtime.
    pub fn new(config: Config, factory: Arc<dyn TransportFactory>) -> Self {
        let config = Arc::new(config);
        let auth = Arc::new(Auth::new(&config));
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let dispatcher = EventDispatcher::new();
        let router: Arc<RwLock<Option<FrameRouter>>> = Arc::new(RwLock::new(None));

        let (command_tx, command_rx) = mpsc::channel(256);

        let core = ConnectionCore {
            config,
            auth,
            factory,
            snapshot: snapshot.clone(),
            dispatcher: dispatcher.clone(),
            router: router.clone(),
            listener_tx: command_tx.downgrade(),
            state: ConnectionState::Initialized,
            transport: None,
            generation: 0,
            attempt: None,
            retry_count: 0,
            token_renewed: false,
            resume_expected_id: None,
            connection_id: None,
            connection_key: None,
            connection_serial: -1,
            msg_serial: 0,
            queue: MessageQueue::new(),
            pending: PendingAcks::new(),
            retry_at: None,
            open_deadline: None,
            close_deadline: None,
        };

        tokio::spawn(connection_task(core, command_rx));

        Self {
            snapshot,
            dispatcher,
            command_tx,
            router,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.snapshot.read().state
    }

    /// The error that drove the last state change, if any
    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.snapshot.read().reason.clone()
    }

    /// Connection id assigned by the service
    pub fn id(&self) -> Option<String> {
        self.snapshot.read().connection_id.clone()
    }

    /// Private connection key for resuming
    pub fn key(&self) -> Option<String> {
        self.snapshot.read().connection_key.clone()
    }

    /// Serial of the last frame processed on this connection
    pub fn serial(&self) -> i64 {
        self.snapshot.read().connection_serial
    }

    /// Check if connected
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Opaque key for recovering this connection from a fresh client
    pub fn recovery_key(&self) -> Option<String> {
        let snapshot = self.snapshot.read();
        match (&snapshot.connection_id, &snapshot.connection_key) {
            (Some(id), Some(key)) => {
                Some(format!("{}:{}:{}", id, key, snapshot.connection_serial))
            }
            _ => None,
        }
    }

    /// Start connecting. Progress is reported through state listeners.
    pub async fn connect(&self) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Connect)
            .await
            .map_err(|_| MillraceError::connection("Connection driver is gone"))
    }

    /// Close the connection. Progress is reported through state listeners.
    pub async fn close(&self) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Close)
            .await
            .map_err(|_| MillraceError::connection("Connection driver is gone"))
    }

    /// Hint from the host that the network went down. An active connection
    /// drops and schedules a retry instead of waiting out the transport
    /// timeout.
    pub async fn on_network_unavailable(&self) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::NetworkUnavailable)
            .await
            .map_err(|_| MillraceError::connection("Connection driver is gone"))
    }

    /// Hand a frame to the connection for sending or queueing.
    pub(crate) async fn send(
        &self,
        message: ProtocolMessage,
        completion: Option<Completion>,
    ) -> Result<()> {
        self.command_tx
            .send(ConnectionCommand::Send(QueuedMessage::new(
                message, completion,
            )))
            .await
            .map_err(|_| MillraceError::connection("Connection driver is gone"))
    }

    /// Non-blocking variant of [`send`], usable from event listeners.
    pub(crate) fn enqueue_frame(
        &self,
        message: ProtocolMessage,
        completion: Option<Completion>,
    ) -> bool {
        self.command_tx
            .try_send(ConnectionCommand::Send(QueuedMessage::new(
                message, completion,
            )))
            .is_ok()
    }

    /// Bind a listener for transitions into one state
    pub fn on(
        &self,
        state: ConnectionState,
        handler: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.dispatcher.bind(state.to_string(), handler)
    }

    /// Bind a listener for every state change
    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.dispatcher.bind_global(handler)
    }

    /// Remove a listener by id
    pub fn off(&self, handler_id: u64) {
        self.dispatcher.unbind(None, Some(handler_id));
    }

    /// Install the router that receives channel-scoped frames
    pub(crate) fn set_frame_router(&self, router: FrameRouter) {
        *self.router.write() = Some(router);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("id", &self.id())
            .finish()
    }
}

/// Public handle to the connection, cloneable and cheap.
#[derive(Clone, Debug)]
pub struct Connection {
    manager: Arc<ConnectionManager>,
}

impl Connection {
    pub(crate) fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn error_reason(&self) -> Option<ErrorInfo> {
        self.manager.error_reason()
    }

    pub fn id(&self) -> Option<String> {
        self.manager.id()
    }

    pub fn key(&self) -> Option<String> {
        self.manager.key()
    }

    pub fn serial(&self) -> i64 {
        self.manager.serial()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn recovery_key(&self) -> Option<String> {
        self.manager.recovery_key()
    }

    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    pub async fn close(&self) -> Result<()> {
        self.manager.close().await
    }

    /// Tell the connection the host lost network access; it drops and
    /// retries immediately rather than waiting for a transport timeout.
    pub async fn on_network_unavailable(&self) -> Result<()> {
        self.manager.on_network_unavailable().await
    }

    pub fn on(
        &self,
        state: ConnectionState,
        handler: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.manager.on(state, handler)
    }

    pub fn on_state_change(
        &self,
        handler: impl Fn(&ConnectionStateChange) + Send + Sync + 'static,
    ) -> u64 {
        self.manager.on_state_change(handler)
    }

    pub fn off(&self, handler_id: u64) {
        self.manager.off(handler_id)
    }
}

/// Mutable core owned exclusively by the driver task.
struct ConnectionCore {
    config: Arc<Config>,
    auth: Arc<Auth>,
    factory: Arc<dyn TransportFactory>,
    snapshot: Arc<RwLock<Snapshot>>,
    dispatcher: EventDispatcher<ConnectionStateChange>,
    router: Arc<RwLock<Option<FrameRouter>>>,
    /// Weak so the driver exits once every public handle is gone
    listener_tx: mpsc::WeakSender<ConnectionCommand>,

    state: ConnectionState,
    transport: Option<Box<dyn crate::transports::Transport>>,
    /// Incremented whenever the current transport is discarded; events from
    /// older generations are stale and dropped
    generation: u64,
    attempt: Option<ConnectionAttempt>,
    retry_count: u32,
    /// Whether a token renewal has already been spent in this attempt sequence
    token_renewed: bool,
    /// Connection id a pending resume expects the service to confirm
    resume_expected_id: Option<String>,
    connection_id: Option<String>,
    connection_key: Option<String>,
    connection_serial: i64,
    /// Serial assigned to the next acknowledged outgoing message
    msg_serial: i64,
    queue: MessageQueue,
    pending: PendingAcks,
    retry_at: Option<Instant>,
    open_deadline: Option<Instant>,
    close_deadline: Option<Instant>,
}

/// Driver task: commands in, transitions out.
async fn connection_task(
    mut core: ConnectionCore,
    mut command_rx: mpsc::Receiver<ConnectionCommand>,
) {
    // Park duration when no timer is armed; the branch is disabled then,
    // this only keeps sleep_until's argument valid.
    const PARK: Duration = Duration::from_secs(3600);

    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            maybe_command = command_rx.recv() => {
                match maybe_command {
                    Some(command) => core.handle_command(command).await,
                    None => {
                        core.drop_transport().await;
                        break;
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(|| Instant::now() + PARK)),
                if deadline.is_some() =>
            {
                core.handle_deadline().await;
            }
        }
    }

    debug!("Connection driver ended");
}

impl ConnectionCore {
    fn next_deadline(&self) -> Option<Instant> {
        [self.retry_at, self.open_deadline, self.close_deadline]
            .into_iter()
            .flatten()
            .min()
    }

    async fn handle_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect => self.connect_requested().await,
            ConnectionCommand::Close => self.close_requested().await,
            ConnectionCommand::NetworkUnavailable => self.network_unavailable().await,
            ConnectionCommand::Send(queued) => self.send_requested(queued).await,
            ConnectionCommand::Transport { generation, event } => {
                self.handle_transport_event(generation, event).await
            }
        }
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();

        if self.close_deadline.is_some_and(|d| d <= now) {
            self.close_deadline = None;
            if self.state == ConnectionState::Closing {
                warn!("Close timed out; forcing closed");
                self.finish_close(None).await;
            }
            return;
        }

        if self.open_deadline.is_some_and(|d| d <= now) {
            self.open_deadline = None;
            if self.state == ConnectionState::Connecting {
                debug!("Connection attempt timed out");
                self.drop_transport().await;
                self.connection_attempt_failed(ErrorInfo::timeout("Connection attempt timed out"));
            }
            return;
        }

        if self.retry_at.is_some_and(|d| d <= now) {
            self.retry_at = None;
            if self.state.is_retrying() {
                info!("Retrying connection");
                self.start_attempt().await;
            }
        }
    }

    async fn connect_requested(&mut self) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Closing => {
                debug!("Ignoring connect() in state {}", self.state);
            }
            _ => {
                self.retry_at = None;
                self.start_attempt().await;
            }
        }
    }

    /// Begin (or continue) a connection attempt sequence.
    async fn start_attempt(&mut self) {
        if self.attempt.is_none() {
            self.attempt = Some(ConnectionAttempt::new());
            self.retry_count = 0;
            self.token_renewed = false;
        }
        self.retry_at = None;
        self.update_state(ConnectionState::Connecting, None, None);

        let auth_param = match self.auth.connect_param().await {
            Ok(param) => param,
            Err(MillraceError::ConfigurationError { message }) => {
                self.fail_connection(ErrorInfo::new(codes::UNAUTHORIZED, Some(401), message))
                    .await;
                return;
            }
            Err(e) => {
                self.connection_attempt_failed(ErrorInfo::new(
                    codes::UNAUTHORIZED,
                    Some(401),
                    e.to_string(),
                ));
                return;
            }
        };

        let url = match self.connect_url(auth_param) {
            Ok(url) => url,
            Err(e) => {
                self.fail_connection(ErrorInfo::new(codes::BAD_REQUEST, Some(400), e.to_string()))
                    .await;
                return;
            }
        };

        let mut transport = self.factory.create();
        self.generation += 1;
        let generation = self.generation;
        let listener_tx = self.listener_tx.clone();
        transport.set_listener(Arc::new(move |event| {
            let Some(tx) = listener_tx.upgrade() else {
                return;
            };
            if tx
                .try_send(ConnectionCommand::Transport { generation, event })
                .is_err()
            {
                warn!("Connection command channel full; dropping transport event");
            }
        }));

        self.open_deadline = Some(Instant::now() + self.config.open_timeout);

        info!("Connecting to {}", self.config.realtime_url);
        if let Err(e) = transport.connect(url.as_str()).await {
            self.connection_attempt_failed(ErrorInfo::connection_failed(e.to_string()));
            return;
        }
        self.transport = Some(transport);
    }

    /// Build the connection URL: protocol params, credentials and resume.
    fn connect_url(&mut self, auth_param: (&'static str, String)) -> Result<Url> {
        let mut params: Vec<(String, String)> = vec![
            ("v".into(), PROTOCOL_VERSION.into()),
            (
                "client".into(),
                format!("millrace-rust/{}", env!("CARGO_PKG_VERSION")),
            ),
        ];

        let (name, value) = auth_param;
        params.push((name.into(), value));

        if let Some(ref client_id) = self.config.client_id {
            params.push(("clientId".into(), client_id.clone()));
        }
        if !self.config.echo_messages {
            params.push(("echo".into(), "false".into()));
        }

        self.resume_expected_id = None;
        if let Some(ref key) = self.connection_key {
            params.push(("resume".into(), key.clone()));
            params.push(("connectionSerial".into(), self.connection_serial.to_string()));
            self.resume_expected_id = self.connection_id.clone();
        } else if let Some(ref recover) = self.config.recover {
            let parts: Vec<&str> = recover.splitn(3, ':').collect();
            match (parts.as_slice(), parts.get(2).and_then(|s| s.parse::<i64>().ok())) {
                ([id, key, _], Some(serial)) => {
                    params.push(("resume".into(), key.to_string()));
                    params.push(("connectionSerial".into(), serial.to_string()));
                    self.resume_expected_id = Some(id.to_string());
                }
                _ => warn!("Ignoring malformed recovery key"),
            }
        }

        Ok(Url::parse_with_params(&self.config.realtime_url, &params)?)
    }

    async fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation {
            trace!("Dropping event from stale transport generation {}", generation);
            return;
        }

        match event {
            TransportEvent::Opened => {
                debug!("Transport opened; awaiting CONNECTED");
            }
            TransportEvent::Message(frame) => self.handle_frame(frame).await,
            TransportEvent::Error(message) => {
                self.transport_gone(ErrorInfo::disconnected(message)).await;
            }
            TransportEvent::Closed { code, reason } => {
                let text = reason.unwrap_or_else(|| "Transport closed".to_string());
                let info = match code {
                    Some(code) => ErrorInfo::new(
                        codes::DISCONNECTED,
                        None,
                        format!("Transport closed ({}): {}", code, text),
                    ),
                    None => ErrorInfo::disconnected(text),
                };
                self.transport_gone(info).await;
            }
        }
    }

    /// The current transport failed or closed underneath us.
    async fn transport_gone(&mut self, reason: ErrorInfo) {
        match self.state {
            ConnectionState::Closing => self.finish_close(None).await,
            ConnectionState::Connected => self.handle_transport_drop(reason).await,
            ConnectionState::Connecting => {
                self.drop_transport().await;
                self.connection_attempt_failed(reason);
            }
            _ => trace!("Transport event ignored in state {}", self.state),
        }
    }

    async fn handle_frame(&mut self, frame: ProtocolMessage) {
        if let Some(serial) = frame.connection_serial {
            self.connection_serial = serial;
            self.snapshot.write().connection_serial = serial;
        }

        let action = match frame.action {
            Some(action) => action,
            None => {
                warn!("Dropping frame without action");
                return;
            }
        };
        trace!("Received {}", action);

        match action {
            Action::Heartbeat => debug!("Heartbeat"),
            Action::Connected => {
                if self.state == ConnectionState::Connecting {
                    self.handle_connected(frame).await;
                } else {
                    debug!("Ignoring CONNECTED in state {}", self.state);
                }
            }
            Action::Ack => {
                if let Some(serial) = frame.msg_serial {
                    self.pending.complete(serial, frame.count.unwrap_or(1));
                }
            }
            Action::Nack => {
                if let Some(serial) = frame.msg_serial {
                    let error = frame.error.clone().unwrap_or_else(|| {
                        ErrorInfo::new(50000, Some(500), "Message delivery failed")
                    });
                    self.pending.fail(serial, frame.count.unwrap_or(1), &error);
                }
            }
            Action::Disconnect | Action::Disconnected => {
                let reason = frame
                    .error
                    .clone()
                    .unwrap_or_else(|| ErrorInfo::disconnected("Server requested disconnect"));
                self.handle_connection_error(reason, false).await;
            }
            Action::Closed => {
                if self.state == ConnectionState::Closing {
                    self.finish_close(frame.error.clone()).await;
                } else {
                    warn!("Unsolicited CLOSED frame");
                    let reason = frame
                        .error
                        .clone()
                        .unwrap_or_else(|| ErrorInfo::disconnected("Connection closed by server"));
                    self.handle_connection_error(reason, false).await;
                }
            }
            Action::Error => {
                if frame.channel.is_some() {
                    self.route_frame(&frame);
                } else {
                    let reason = frame.error.clone().unwrap_or_else(|| {
                        ErrorInfo::new(codes::CONNECTION_FAILED, None, "Unknown connection error")
                    });
                    self.handle_connection_error(reason, true).await;
                }
            }
            Action::Attached
            | Action::Detached
            | Action::Message
            | Action::Presence
            | Action::Sync => {
                self.route_frame(&frame);
            }
            Action::Connect | Action::Close | Action::Attach | Action::Detach => {
                warn!("Ignoring unexpected {} frame", action);
            }
        }
    }

    async fn handle_connected(&mut self, frame: ProtocolMessage) {
        let resumed = match (self.resume_expected_id.take(), frame.connection_id.as_deref()) {
            (Some(expected), Some(actual)) => expected == actual && frame.error.is_none(),
            _ => false,
        };

        if let Some(ref error) = frame.error {
            warn!("Connection resume rejected: {}", error);
        }

        if !resumed {
            // Fresh session: serials restart and anything unacknowledged
            // goes back to the queue for re-send.
            self.msg_serial = 0;
            let unacked = self.pending.take_all();
            self.queue.requeue(unacked);
            if frame.connection_serial.is_none() {
                self.connection_serial = -1;
            }
        }

        self.connection_id = frame.connection_id.clone();
        if frame.connection_key.is_some() {
            self.connection_key = frame.connection_key.clone();
        }

        self.attempt = None;
        self.retry_count = 0;
        self.token_renewed = false;
        self.open_deadline = None;
        self.retry_at = None;

        info!("Connected: id={:?} resumed={}", self.connection_id, resumed);
        self.update_state(ConnectionState::Connected, frame.error.clone(), None);
        self.flush_queue().await;
    }

    /// Server-reported connection trouble. `fatal` distinguishes ERROR
    /// frames (terminal) from DISCONNECTED frames (retryable).
    async fn handle_connection_error(&mut self, reason: ErrorInfo, fatal: bool) {
        if self.try_token_renewal(&reason).await {
            return;
        }
        if fatal || reason.is_token_error() {
            self.fail_connection(reason).await;
        } else {
            match self.state {
                ConnectionState::Connected => self.handle_transport_drop(reason).await,
                ConnectionState::Connecting => {
                    self.drop_transport().await;
                    self.connection_attempt_failed(reason);
                }
                _ => debug!("Ignoring disconnect in state {}", self.state),
            }
        }
    }

    /// When the service rejects our token, renew it once per attempt
    /// sequence and reconnect immediately; a second rejection is terminal.
    async fn try_token_renewal(&mut self, reason: &ErrorInfo) -> bool {
        if !reason.is_token_error() || self.token_renewed || !self.auth.renewable() {
            return false;
        }

        info!("Token rejected; renewing and reconnecting");
        self.token_renewed = true;
        self.open_deadline = None;
        self.drop_transport().await;

        if self.attempt.is_none() {
            self.attempt = Some(ConnectionAttempt::new());
            self.retry_count = 0;
        }
        if let Some(ref mut attempt) = self.attempt {
            attempt.record_failure(ConnectionState::Disconnected, Some(reason.clone()));
        }

        match self.auth.request_token().await {
            Ok(_) => self.to_disconnected(reason.clone(), Some(Duration::ZERO)),
            Err(e) => {
                warn!("Token renewal failed: {}", e);
                self.fail_connection(reason.clone()).await;
            }
        }
        true
    }

    /// An established connection dropped.
    async fn handle_transport_drop(&mut self, reason: ErrorInfo) {
        self.drop_transport().await;
        let unacked = self.pending.take_all();
        self.queue.requeue(unacked);
        self.attempt = Some(ConnectionAttempt::new());
        self.retry_count = 0;
        self.token_renewed = false;
        self.connection_attempt_failed(reason);
    }

    /// Record a failed attempt and move to Disconnected or, once the
    /// sequence has outlived the suspension window, Suspended.
    fn connection_attempt_failed(&mut self, reason: ErrorInfo) {
        self.open_deadline = None;
        let suspend = self
            .attempt
            .as_ref()
            .map(|a| a.should_suspend(self.config.suspend_after))
            .unwrap_or(false);
        let failed_state = if suspend {
            ConnectionState::Suspended
        } else {
            ConnectionState::Disconnected
        };
        if let Some(ref mut attempt) = self.attempt {
            attempt.record_failure(failed_state, Some(reason.clone()));
        }
        if suspend {
            self.to_suspended(reason);
        } else {
            self.to_disconnected(reason, None);
        }
    }

    fn to_disconnected(&mut self, reason: ErrorInfo, delay: Option<Duration>) {
        let delay = match delay {
            Some(delay) => Some(delay),
            None if self.config.auto_connect => {
                self.retry_count += 1;
                Some(retry_delay(
                    self.config.disconnected_retry_timeout,
                    self.retry_count,
                ))
            }
            None => None,
        };
        if let Some(delay) = delay {
            self.retry_at = Some(Instant::now() + delay);
        }
        self.update_state(ConnectionState::Disconnected, Some(reason), delay);
    }

    /// Suspension abandons queued work; retries continue at a fixed cadence.
    fn to_suspended(&mut self, reason: ErrorInfo) {
        let reason = if reason.code == codes::CONNECTION_SUSPENDED {
            reason
        } else {
            ErrorInfo::suspended(format!("Connection suspended: {}", reason.message))
        };
        self.queue.fail_all(&reason);
        self.pending.fail_all(&reason);
        let delay = if self.config.auto_connect {
            let delay = self.config.suspended_retry_timeout;
            self.retry_at = Some(Instant::now() + delay);
            Some(delay)
        } else {
            None
        };
        self.update_state(ConnectionState::Suspended, Some(reason), delay);
    }

    /// Terminal failure: no retries, everything pending is failed.
    async fn fail_connection(&mut self, reason: ErrorInfo) {
        self.drop_transport().await;
        self.retry_at = None;
        self.open_deadline = None;
        self.close_deadline = None;
        self.attempt = None;
        self.resume_expected_id = None;
        self.connection_key = None;
        self.queue.fail_all(&reason);
        self.pending.fail_all(&reason);
        self.update_state(ConnectionState::Failed, Some(reason), None);
    }

    /// Proactive drop on a host network-down hint. Takes the same path as
    /// a transport failure, just without waiting for one.
    async fn network_unavailable(&mut self) {
        let reason = ErrorInfo::disconnected("Network unavailable");
        match self.state {
            ConnectionState::Connected => self.handle_transport_drop(reason).await,
            ConnectionState::Connecting => {
                self.drop_transport().await;
                self.connection_attempt_failed(reason);
            }
            _ => debug!("Ignoring network-down hint in state {}", self.state),
        }
    }

    async fn close_requested(&mut self) {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Failed => {
                debug!("Ignoring close() in state {}", self.state);
            }
            ConnectionState::Connected => {
                self.retry_at = None;
                self.update_state(ConnectionState::Closing, None, None);
                self.close_deadline = Some(Instant::now() + self.config.request_timeout);

                let sent = match self.transport {
                    Some(ref transport) => {
                        transport.send(&ProtocolMessage::close()).await.is_ok()
                    }
                    None => false,
                };
                if !sent {
                    self.finish_close(None).await;
                }
            }
            _ => {
                // No protocol exchange to wait for; close locally.
                self.finish_close(None).await;
            }
        }
    }

    /// Enter Closed: cancel timers, discard identity, fail pending work.
    async fn finish_close(&mut self, reason: Option<ErrorInfo>) {
        self.drop_transport().await;
        self.retry_at = None;
        self.open_deadline = None;
        self.close_deadline = None;
        self.attempt = None;
        self.resume_expected_id = None;
        self.connection_id = None;
        self.connection_key = None;
        self.connection_serial = -1;
        self.msg_serial = 0;

        let error = ErrorInfo::closed("Connection closed");
        self.queue.fail_all(&error);
        self.pending.fail_all(&error);

        self.update_state(ConnectionState::Closed, reason, None);
    }

    async fn send_requested(&mut self, mut queued: QueuedMessage) {
        if self.state == ConnectionState::Connected {
            if let Some(unsent) = self.send_now(queued).await {
                self.queue.requeue(vec![unsent]);
            }
            return;
        }

        if !queued.message.wants_ack() {
            // Control frames are never queued; the channel layer re-issues
            // them when the connection returns.
            debug!(
                "Dropping {:?} frame while {}",
                queued.message.action, self.state
            );
            queued.complete(Err(ErrorInfo::disconnected("Connection unavailable")));
            return;
        }

        if self.state.can_queue_messages() {
            if self.config.queue_messages {
                self.queue.push(queued);
            } else {
                queued.complete(Err(ErrorInfo::disconnected(
                    "Not connected and message queueing is disabled",
                )));
            }
            return;
        }

        let error = match self.state {
            ConnectionState::Suspended => ErrorInfo::suspended("Connection is suspended"),
            ConnectionState::Closing | ConnectionState::Closed => {
                ErrorInfo::closed("Connection is closed")
            }
            ConnectionState::Failed => self
                .snapshot
                .read()
                .reason
                .clone()
                .unwrap_or_else(|| ErrorInfo::connection_failed("Connection failed")),
            _ => ErrorInfo::disconnected("Connection unavailable"),
        };
        queued.complete(Err(error));
    }

    /// Write a frame to the live transport, assigning its serial when it
    /// expects an acknowledgement. Returns the message when it could not be
    /// written, so the caller can requeue it.
    async fn send_now(&mut self, mut queued: QueuedMessage) -> Option<QueuedMessage> {
        if self.transport.is_none() {
            return Some(queued);
        }

        if queued.message.wants_ack() {
            let serial = self.msg_serial;
            queued.message.msg_serial = Some(serial);
            let result = match self.transport {
                Some(ref transport) => transport.send(&queued.message).await,
                None => Err(MillraceError::invalid_state("No transport")),
            };
            match result {
                Ok(()) => {
                    self.msg_serial += 1;
                    self.pending.insert(serial, queued);
                    None
                }
                Err(e) => {
                    debug!("Send failed; requeueing: {}", e);
                    queued.message.msg_serial = None;
                    Some(queued)
                }
            }
        } else {
            let result = match self.transport {
                Some(ref transport) => transport.send(&queued.message).await,
                None => Err(MillraceError::invalid_state("No transport")),
            };
            match result {
                Ok(()) => queued.complete(Ok(())),
                Err(e) => {
                    debug!("Send failed: {}", e);
                    queued.complete(Err(ErrorInfo::disconnected(format!("Send failed: {}", e))));
                }
            }
            None
        }
    }

    /// Drain the queue onto the transport, in order, exactly once.
    async fn flush_queue(&mut self) {
        if self.queue.is_empty() {
            return;
        }
        let drained = self.queue.drain();
        debug!("Flushing {} queued messages", drained.len());

        let mut iter = drained.into_iter();
        while let Some(queued) = iter.next() {
            if let Some(unsent) = self.send_now(queued).await {
                // Transport died mid-flush; keep order for the next flush.
                let rest: Vec<QueuedMessage> = std::iter::once(unsent).chain(iter).collect();
                self.queue.requeue(rest);
                break;
            }
        }
    }

    fn route_frame(&self, frame: &ProtocolMessage) {
        let router = self.router.read().clone();
        match router {
            Some(router) => router(frame),
            None => debug!("No frame router installed; dropping {:?} frame", frame.action),
        }
    }

    async fn drop_transport(&mut self) {
        self.generation += 1;
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
    }

    /// Apply a transition: snapshot first, then listeners.
    fn update_state(
        &mut self,
        new_state: ConnectionState,
        reason: Option<ErrorInfo>,
        retry_in: Option<Duration>,
    ) {
        let previous = self.state;
        if previous == new_state {
            if let Some(reason) = reason {
                self.snapshot.write().reason = Some(reason);
            }
            return;
        }

        self.state = new_state;
        {
            let mut snapshot = self.snapshot.write();
            snapshot.state = new_state;
            snapshot.reason = reason.clone();
            snapshot.connection_id = self.connection_id.clone();
            snapshot.connection_key = self.connection_key.clone();
            snapshot.connection_serial = self.connection_serial;
        }

        debug!("Connection state changed: {} -> {}", previous, new_state);

        let mut change = ConnectionStateChange::new(previous, new_state);
        if let Some(reason) = reason {
            change = change.with_reason(reason);
        }
        if let Some(retry_in) = retry_in {
            change = change.with_retry_in(retry_in);
        }
        self.dispatcher.emit(&new_state.to_string(), &change);
    }
}
