//! Shared test fixtures: a scripted in-memory transport standing in for the
//! service, plus frame builders and polling helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use millrace::protocol::{Action, Message, PresenceAction, PresenceMessage, ProtocolMessage};
use millrace::transports::{Transport, TransportEvent, TransportFactory, TransportListener};
use millrace::{ErrorInfo, MillraceError, MillraceOptions};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What the next transport should do when its connection attempt starts.
pub enum ConnectBehavior {
    /// Open and deliver the given frames, in order
    Open(Vec<ProtocolMessage>),
    /// Fail the attempt immediately
    Refuse(String),
}

#[derive(Default)]
struct ServerState {
    script: Mutex<VecDeque<ConnectBehavior>>,
    /// Listener of the most recently opened transport
    listener: Mutex<Option<TransportListener>>,
    /// Open flag of the most recently opened transport
    live: Mutex<Option<Arc<AtomicBool>>>,
    sent: Mutex<Vec<ProtocolMessage>>,
    urls: Mutex<Vec<String>>,
    auto_ack: AtomicBool,
    connects: AtomicUsize,
}

/// Scripted stand-in for the service.
///
/// Hand its [`factory`](MockServer::factory) to the client, script what each
/// connection attempt should see, then inject frames or kill the transport
/// to drive the scenario. Unscripted attempts succeed with a standard
/// CONNECTED frame.
#[derive(Clone)]
pub struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState::default()),
        }
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(MockFactory {
            state: self.state.clone(),
        })
    }

    /// Queue the behavior for the next connection attempt.
    pub fn script(&self, behavior: ConnectBehavior) {
        self.state.script.lock().push_back(behavior);
    }

    /// Answer every publish and presence frame with a matching ACK.
    pub fn set_auto_ack(&self, on: bool) {
        self.state.auto_ack.store(on, Ordering::SeqCst);
    }

    /// Deliver a frame as if the service pushed it.
    pub fn inject(&self, frame: ProtocolMessage) {
        let listener = self.state.listener.lock().clone();
        match listener {
            Some(listener) => listener(TransportEvent::Message(frame)),
            None => panic!("inject: no transport has connected yet"),
        }
    }

    /// Kill the current transport from the server side.
    pub fn drop_connection(&self, code: Option<u16>, reason: Option<&str>) {
        if let Some(live) = self.state.live.lock().clone() {
            live.store(false, Ordering::SeqCst);
        }
        let listener = self.state.listener.lock().clone();
        if let Some(listener) = listener {
            listener(TransportEvent::Closed {
                code,
                reason: reason.map(str::to_string),
            });
        }
    }

    /// Frames the client has sent, oldest first.
    pub fn sent(&self) -> Vec<ProtocolMessage> {
        self.state.sent.lock().clone()
    }

    pub fn sent_actions(&self) -> Vec<Action> {
        self.sent().iter().filter_map(|frame| frame.action).collect()
    }

    pub fn clear_sent(&self) {
        self.state.sent.lock().clear();
    }

    /// Number of connection attempts observed.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.state.urls.lock().last().cloned()
    }
}

struct MockFactory {
    state: Arc<ServerState>,
}

impl TransportFactory for MockFactory {
    fn create(&self) -> Box<dyn Transport> {
        Box::new(MockTransport {
            state: self.state.clone(),
            listener: None,
            open: Arc::new(AtomicBool::new(false)),
        })
    }
}

struct MockTransport {
    state: Arc<ServerState>,
    listener: Option<TransportListener>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self, url: &str) -> millrace::Result<()> {
        self.state.urls.lock().push(url.to_string());
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let listener = match self.listener.clone() {
            Some(listener) => listener,
            None => return Err(MillraceError::transport("No listener installed")),
        };

        let behavior = self.state.script.lock().pop_front().unwrap_or_else(|| {
            ConnectBehavior::Open(vec![connected_frame("conn-test", "key-test")])
        });

        match behavior {
            ConnectBehavior::Refuse(reason) => Err(MillraceError::transport(reason)),
            ConnectBehavior::Open(frames) => {
                self.open.store(true, Ordering::SeqCst);
                *self.state.listener.lock() = Some(listener.clone());
                *self.state.live.lock() = Some(self.open.clone());

                listener(TransportEvent::Opened);
                for frame in frames {
                    listener(TransportEvent::Message(frame));
                }
                Ok(())
            }
        }
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
    }

    async fn send(&self, message: &ProtocolMessage) -> millrace::Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(MillraceError::transport("Transport is not open"));
        }
        self.state.sent.lock().push(message.clone());

        if self.state.auto_ack.load(Ordering::SeqCst) && message.wants_ack() {
            if let Some(serial) = message.msg_serial {
                let listener = self.state.listener.lock().clone();
                if let Some(listener) = listener {
                    listener(TransportEvent::Message(ack_frame(serial, 1)));
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_listener(&mut self, listener: TransportListener) {
        self.listener = Some(listener);
    }
}

/// Options tuned so connection timers fire within test budgets.
pub fn test_options() -> MillraceOptions {
    MillraceOptions::new("app.key:secret")
        .auto_connect(false)
        .open_timeout(Duration::from_millis(300))
        .request_timeout(Duration::from_millis(300))
        .disconnected_retry_timeout(Duration::from_millis(50))
        .suspended_retry_timeout(Duration::from_millis(50))
}

pub fn connected_frame(id: &str, key: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Connected),
        connection_id: Some(id.to_string()),
        connection_key: Some(key.to_string()),
        ..Default::default()
    }
}

pub fn attached_frame(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Attached),
        channel: Some(channel.to_string()),
        ..Default::default()
    }
}

pub fn attached_frame_with_presence(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        flags: Some(1),
        ..attached_frame(channel)
    }
}

pub fn detached_frame(channel: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Detached),
        channel: Some(channel.to_string()),
        ..Default::default()
    }
}

pub fn ack_frame(serial: i64, count: u32) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Ack),
        msg_serial: Some(serial),
        count: Some(count),
        ..Default::default()
    }
}

pub fn nack_frame(serial: i64, count: u32, error: ErrorInfo) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Nack),
        msg_serial: Some(serial),
        count: Some(count),
        error: Some(error),
        ..Default::default()
    }
}

pub fn error_frame(code: u32, status: Option<u16>, message: &str) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Error),
        error: Some(ErrorInfo::new(code, status, message)),
        ..Default::default()
    }
}

pub fn message_frame(channel: &str, name: &str, data: serde_json::Value) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Message),
        channel: Some(channel.to_string()),
        messages: Some(vec![Message::new(name, data)]),
        ..Default::default()
    }
}

pub fn presence_frame(
    channel: &str,
    action: PresenceAction,
    connection_id: &str,
    client_id: &str,
) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Presence),
        channel: Some(channel.to_string()),
        presence: Some(vec![presence_member(action, connection_id, client_id)]),
        ..Default::default()
    }
}

pub fn sync_frame(
    channel: &str,
    channel_serial: &str,
    members: Vec<PresenceMessage>,
) -> ProtocolMessage {
    ProtocolMessage {
        action: Some(Action::Sync),
        channel: Some(channel.to_string()),
        channel_serial: Some(channel_serial.to_string()),
        presence: Some(members),
        ..Default::default()
    }
}

pub fn presence_member(
    action: PresenceAction,
    connection_id: &str,
    client_id: &str,
) -> PresenceMessage {
    let mut member = PresenceMessage::new(action);
    member.connection_id = Some(connection_id.to_string());
    member.client_id = Some(client_id.to_string());
    member
}

/// Poll until the condition holds, panicking after two seconds.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Timed out waiting for {}", what);
}
