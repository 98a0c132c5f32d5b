//! Protocol message envelope and payload types.
//!
//! Every frame exchanged with the service is a [`ProtocolMessage`]: a JSON
//! object whose `action` discriminant (an integer on the wire) determines
//! which of the optional fields are meaningful. Channel messages ride in
//! `messages`, presence updates in `presence`, and errors in `error`.

use crate::error::ErrorInfo;
use serde::{Deserialize, Serialize};

/// Protocol actions, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
}

impl TryFrom<u8> for Action {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(Action::Heartbeat),
            1 => Ok(Action::Ack),
            2 => Ok(Action::Nack),
            3 => Ok(Action::Connect),
            4 => Ok(Action::Connected),
            5 => Ok(Action::Disconnect),
            6 => Ok(Action::Disconnected),
            7 => Ok(Action::Close),
            8 => Ok(Action::Closed),
            9 => Ok(Action::Error),
            10 => Ok(Action::Attach),
            11 => Ok(Action::Attached),
            12 => Ok(Action::Detach),
            13 => Ok(Action::Detached),
            14 => Ok(Action::Presence),
            15 => Ok(Action::Message),
            16 => Ok(Action::Sync),
            other => Err(format!("Unknown protocol action: {}", other)),
        }
    }
}

impl From<Action> for u8 {
    fn from(action: Action) -> u8 {
        action as u8
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Action::Heartbeat => "HEARTBEAT",
            Action::Ack => "ACK",
            Action::Nack => "NACK",
            Action::Connect => "CONNECT",
            Action::Connected => "CONNECTED",
            Action::Disconnect => "DISCONNECT",
            Action::Disconnected => "DISCONNECTED",
            Action::Close => "CLOSE",
            Action::Closed => "CLOSED",
            Action::Error => "ERROR",
            Action::Attach => "ATTACH",
            Action::Attached => "ATTACHED",
            Action::Detach => "DETACH",
            Action::Detached => "DETACHED",
            Action::Presence => "PRESENCE",
            Action::Message => "MESSAGE",
            Action::Sync => "SYNC",
        };
        write!(f, "{}", name)
    }
}

/// Presence event kinds, numbered as they appear on the wire.
///
/// `Absent` only occurs during sync reconciliation; the service uses it to
/// retract a member that entered and left while a sync was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl TryFrom<u8> for PresenceAction {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(PresenceAction::Absent),
            1 => Ok(PresenceAction::Present),
            2 => Ok(PresenceAction::Enter),
            3 => Ok(PresenceAction::Leave),
            4 => Ok(PresenceAction::Update),
            other => Err(format!("Unknown presence action: {}", other)),
        }
    }
}

impl From<PresenceAction> for u8 {
    fn from(action: PresenceAction) -> u8 {
        action as u8
    }
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PresenceAction::Absent => "absent",
            PresenceAction::Present => "present",
            PresenceAction::Enter => "enter",
            PresenceAction::Leave => "leave",
            PresenceAction::Update => "update",
        };
        write!(f, "{}", name)
    }
}

/// A channel message. Delivered to subscribers on MESSAGE frames and sent
/// to the service when publishing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Unique id assigned by the service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Event name used for subscription routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Arbitrary JSON payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Payload encoding marker, absent for plain JSON
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    /// Client id of the publisher
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Connection the message was published over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Service timestamp, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: Some(name.into()),
            data: Some(data),
            ..Default::default()
        }
    }
}

/// A presence event on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    /// Client id of the member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Connection the member is present over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Member data, carried on enter/update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Service timestamp, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction) -> Self {
        Self {
            action,
            client_id: None,
            connection_id: None,
            id: None,
            data: None,
            timestamp: None,
        }
    }

    /// Composite key identifying this member within a presence map.
    ///
    /// Two entries describe the same member only when both the connection id
    /// and the client id match, so one client connected twice counts twice.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or(""),
            self.client_id.as_deref().unwrap_or("")
        )
    }
}

/// Flag bit set on ATTACHED when the channel has presence members and a
/// SYNC will follow.
pub const FLAG_HAS_PRESENCE: u32 = 1;

/// The envelope for every frame exchanged with the service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Channel the frame applies to, for channel-scoped actions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    /// Channel attachment serial; during SYNC carries `"<serial>:<cursor>"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    /// Connection id assigned on CONNECTED
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    /// Private key for resuming this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    /// Serial of the last processed frame on this connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    /// Serial of the first message this frame acknowledges or carries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    /// Number of consecutive serials an ACK/NACK covers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    /// Service timestamp, epoch milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        Self {
            action: Some(action),
            ..Default::default()
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(Action::Heartbeat)
    }

    pub fn attach(channel: impl Into<String>) -> Self {
        Self {
            action: Some(Action::Attach),
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn detach(channel: impl Into<String>) -> Self {
        Self {
            action: Some(Action::Detach),
            channel: Some(channel.into()),
            ..Default::default()
        }
    }

    pub fn close() -> Self {
        Self::new(Action::Close)
    }

    pub fn publish(channel: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            action: Some(Action::Message),
            channel: Some(channel.into()),
            messages: Some(messages),
            ..Default::default()
        }
    }

    pub fn presence(channel: impl Into<String>, presence: Vec<PresenceMessage>) -> Self {
        Self {
            action: Some(Action::Presence),
            channel: Some(channel.into()),
            presence: Some(presence),
            ..Default::default()
        }
    }

    /// Whether the service acknowledges this frame with an ACK or NACK.
    /// Only MESSAGE and PRESENCE frames consume a message serial.
    pub fn wants_ack(&self) -> bool {
        matches!(self.action, Some(Action::Message) | Some(Action::Presence))
    }

    /// Whether an ATTACHED frame announces presence members to be synced.
    pub fn has_presence_flag(&self) -> bool {
        self.flags.unwrap_or(0) & FLAG_HAS_PRESENCE != 0
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
