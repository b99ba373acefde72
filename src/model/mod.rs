//! Payloads exchanged over the main gateway, and the typed events built from them.

pub mod voice;

use crate::id::{ChannelId, GuildId, InteractionId, MessageId, UserId};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

/// The envelope wrapping every gateway message.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GatewayPayload {
    /// Opcode, see [`Opcode`] and [`voice::VoiceOpcode`].
    pub op: u8,
    /// Opcode-specific data.
    #[serde(default)]
    pub d: Value,
    /// Sequence number of a dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    /// Event name of a dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    /// Wraps `data` under the given opcode.
    pub fn new<T: Serialize>(op: impl Into<u8>, data: &T) -> serde_json::Result<Self> {
        Ok(Self {
            op: op.into(),
            d: serde_json::to_value(data)?,
            s: None,
            t: None,
        })
    }

    /// Interprets the `d` field as `T`.
    pub fn data<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.d)
    }

    /// The gateway opcode of this payload, if it is one this crate knows.
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.op)
    }
}

/// Main gateway opcodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
#[repr(u8)]
pub enum Opcode {
    /// An event was dispatched. Received.
    Dispatch = 0,
    /// Keepalive, or a request for one. Sent and received.
    Heartbeat = 1,
    /// Starts a new session. Sent.
    Identify = 2,
    /// Updates the client's presence. Sent.
    PresenceUpdate = 3,
    /// Joins, moves between, or leaves voice channels. Sent.
    VoiceStateUpdate = 4,
    /// Resumes a previous session. Sent.
    Resume = 6,
    /// The server asks the client to reconnect and resume. Received.
    Reconnect = 7,
    /// The session was invalidated. Received.
    InvalidSession = 9,
    /// First message after connecting, with the heartbeat interval. Received.
    Hello = 10,
    /// Acknowledges a heartbeat. Received.
    HeartbeatAck = 11,
}

impl Opcode {
    /// Maps a raw opcode to a known variant.
    #[must_use]
    pub fn from_u8(op: u8) -> Option<Self> {
        Some(match op {
            0 => Self::Dispatch,
            1 => Self::Heartbeat,
            2 => Self::Identify,
            3 => Self::PresenceUpdate,
            4 => Self::VoiceStateUpdate,
            6 => Self::Resume,
            7 => Self::Reconnect,
            9 => Self::InvalidSession,
            10 => Self::Hello,
            11 => Self::HeartbeatAck,
            _ => return None,
        })
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> u8 {
        op as u8
    }
}

/// Data of a hello message.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hello {
    /// Milliseconds between heartbeats.
    pub heartbeat_interval: u64,
}

/// Connection properties reported on identify.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct IdentifyProperties {
    /// Operating system.
    pub os: String,
    /// Library name.
    pub browser: String,
    /// Library name.
    pub device: String,
}

impl Default for IdentifyProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.into(),
            browser: "gatewire".into(),
            device: "gatewire".into(),
        }
    }
}

/// Starts a fresh session.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Identify {
    /// Bot token.
    pub token: String,
    /// Gateway intents bitmask.
    pub intents: u64,
    /// Client properties.
    pub properties: IdentifyProperties,
    /// `[shard index, shard count]`.
    pub shard: [u64; 2],
    /// Initial presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Presence>,
    /// Member count above which offline members are omitted from guild data.
    pub large_threshold: u64,
}

impl std::fmt::Debug for Identify {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identify")
            .field("token", &"<secret>")
            .field("intents", &self.intents)
            .field("shard", &self.shard)
            .field("presence", &self.presence)
            .finish_non_exhaustive()
    }
}

/// Resumes an interrupted session.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Resume {
    /// Bot token.
    pub token: String,
    /// Session to resume.
    pub session_id: String,
    /// Last sequence number received.
    pub seq: Option<u64>,
}

impl std::fmt::Debug for Resume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resume")
            .field("token", &"<secret>")
            .field("session_id", &self.session_id)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Online status shown to other users.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Online.
    #[default]
    Online,
    /// Idle.
    Idle,
    /// Do not disturb.
    Dnd,
    /// Shown as offline.
    Invisible,
}

/// An activity attached to a presence.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Activity {
    /// Activity name.
    pub name: String,
    /// Activity type: 0 playing, 1 streaming, 2 listening, 3 watching, 5 competing.
    #[serde(rename = "type")]
    pub kind: u8,
}

/// The client's presence, sent on identify and with opcode 3.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Presence {
    /// Unix time (ms) since the client went idle.
    pub since: Option<u64>,
    /// Current activities.
    pub activities: Vec<Activity>,
    /// Online status.
    pub status: Status,
    /// Whether the client is AFK.
    pub afk: bool,
}

/// Requests a change of voice channel for the current user.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct VoiceStateUpdate {
    /// Guild of the voice channel.
    pub guild_id: GuildId,
    /// Channel to join, or `None` to leave.
    pub channel_id: Option<ChannelId>,
    /// Whether to mute the bot.
    pub self_mute: bool,
    /// Whether to deafen the bot.
    pub self_deaf: bool,
}

/// A Discord user.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct User {
    /// User ID.
    pub id: UserId,
    /// Username.
    #[serde(default)]
    pub username: String,
    /// Whether this is a bot account.
    #[serde(default)]
    pub bot: bool,
}

/// Data of the `READY` dispatch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ready {
    /// Session identifier, needed to resume.
    pub session_id: String,
    /// Gateway URL to use when resuming.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
    /// The bot's own user.
    pub user: User,
    /// `[shard index, shard count]`, echoed from identify.
    #[serde(default)]
    pub shard: Option<[u64; 2]>,
}

/// Data of the `MESSAGE_CREATE` dispatch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Message {
    /// Message ID.
    pub id: MessageId,
    /// Channel the message was sent in.
    pub channel_id: ChannelId,
    /// Guild the message was sent in, if any.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Author of the message.
    pub author: User,
    /// Text content.
    #[serde(default)]
    pub content: String,
}

/// Data of the `MESSAGE_REACTION_ADD` dispatch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Reaction {
    /// User who reacted.
    pub user_id: UserId,
    /// Channel of the message.
    pub channel_id: ChannelId,
    /// Message reacted to.
    pub message_id: MessageId,
    /// Guild of the message, if any.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Emoji used.
    #[serde(default)]
    pub emoji: Value,
}

/// Reference to the message a component interaction is attached to.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct MessageRef {
    /// Message ID.
    pub id: MessageId,
}

/// Data of the `INTERACTION_CREATE` dispatch: buttons, select menus, modals, commands.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Interaction {
    /// Interaction ID.
    pub id: InteractionId,
    /// Interaction type.
    #[serde(rename = "type")]
    pub kind: u8,
    /// Channel the interaction came from.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// Guild the interaction came from.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Message holding the component that was used.
    #[serde(default)]
    pub message: Option<MessageRef>,
    /// Type-specific data.
    #[serde(default)]
    pub data: Value,
    /// Continuation token for responding.
    pub token: String,
}

impl std::fmt::Debug for Interaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interaction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("channel_id", &self.channel_id)
            .field("message", &self.message)
            .field("data", &self.data)
            .finish_non_exhaustive()
    }
}

/// Data of the `VOICE_STATE_UPDATE` dispatch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct VoiceState {
    /// Guild of the voice channel.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Current channel, if connected.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// User this state belongs to.
    pub user_id: UserId,
    /// Voice session identifier.
    pub session_id: String,
}

/// Data of the `VOICE_SERVER_UPDATE` dispatch.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct VoiceServerUpdate {
    /// Guild the voice server serves.
    pub guild_id: GuildId,
    /// Voice connection token.
    pub token: String,
    /// Voice server host, or `None` while the server is being reallocated.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl std::fmt::Debug for VoiceServerUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceServerUpdate")
            .field("guild_id", &self.guild_id)
            .field("token", &"<secret>")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Data of the `GUILD_CREATE` dispatch.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GuildCreate {
    /// Guild ID.
    pub id: GuildId,
    /// Guild name.
    #[serde(default)]
    pub name: String,
    /// Whether the guild is unavailable due to an outage.
    #[serde(default)]
    pub unavailable: bool,
}

/// Kinds of dispatched event, used to register handlers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum EventType {
    /// `READY`
    Ready,
    /// `RESUMED`
    Resumed,
    /// `MESSAGE_CREATE`
    MessageCreate,
    /// `MESSAGE_REACTION_ADD`
    ReactionAdd,
    /// `INTERACTION_CREATE`
    InteractionCreate,
    /// `VOICE_STATE_UPDATE`
    VoiceStateUpdate,
    /// `VOICE_SERVER_UPDATE`
    VoiceServerUpdate,
    /// `GUILD_CREATE`
    GuildCreate,
    /// Any dispatch without a typed record.
    Unknown,
}

impl EventType {
    /// Maps a dispatch name to its type.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "READY" => Self::Ready,
            "RESUMED" => Self::Resumed,
            "MESSAGE_CREATE" => Self::MessageCreate,
            "MESSAGE_REACTION_ADD" => Self::ReactionAdd,
            "INTERACTION_CREATE" => Self::InteractionCreate,
            "VOICE_STATE_UPDATE" => Self::VoiceStateUpdate,
            "VOICE_SERVER_UPDATE" => Self::VoiceServerUpdate,
            "GUILD_CREATE" => Self::GuildCreate,
            _ => Self::Unknown,
        }
    }
}

/// Composite key matching events to a pending collector.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct CollectorKey {
    /// Channel holding the message.
    pub channel_id: ChannelId,
    /// Message being watched.
    pub message_id: MessageId,
}

/// A typed dispatch event.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// The session is established.
    Ready(Box<Ready>),
    /// A resume completed and missed events have been replayed.
    Resumed,
    /// A message was sent.
    MessageCreate(Box<Message>),
    /// A reaction was added to a message.
    ReactionAdd(Box<Reaction>),
    /// A user invoked a command or component.
    InteractionCreate(Box<Interaction>),
    /// A user's voice state changed.
    VoiceStateUpdate(Box<VoiceState>),
    /// A guild's voice server was assigned.
    VoiceServerUpdate(Box<VoiceServerUpdate>),
    /// A guild became available.
    GuildCreate(Box<GuildCreate>),
    /// Any other dispatch.
    Unknown {
        /// Event name.
        kind: String,
        /// Raw event data.
        data: Value,
    },
}

impl Event {
    /// Builds a typed event from a dispatch name and its data.
    pub fn from_dispatch(kind: &str, data: Value) -> serde_json::Result<Self> {
        Ok(match EventType::from_name(kind) {
            EventType::Ready => Self::Ready(Box::new(serde_json::from_value(data)?)),
            EventType::Resumed => Self::Resumed,
            EventType::MessageCreate => Self::MessageCreate(Box::new(serde_json::from_value(data)?)),
            EventType::ReactionAdd => Self::ReactionAdd(Box::new(serde_json::from_value(data)?)),
            EventType::InteractionCreate =>
                Self::InteractionCreate(Box::new(serde_json::from_value(data)?)),
            EventType::VoiceStateUpdate =>
                Self::VoiceStateUpdate(Box::new(serde_json::from_value(data)?)),
            EventType::VoiceServerUpdate =>
                Self::VoiceServerUpdate(Box::new(serde_json::from_value(data)?)),
            EventType::GuildCreate => Self::GuildCreate(Box::new(serde_json::from_value(data)?)),
            EventType::Unknown => Self::Unknown {
                kind: kind.to_owned(),
                data,
            },
        })
    }

    /// The handler key of this event.
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Ready(_) => EventType::Ready,
            Self::Resumed => EventType::Resumed,
            Self::MessageCreate(_) => EventType::MessageCreate,
            Self::ReactionAdd(_) => EventType::ReactionAdd,
            Self::InteractionCreate(_) => EventType::InteractionCreate,
            Self::VoiceStateUpdate(_) => EventType::VoiceStateUpdate,
            Self::VoiceServerUpdate(_) => EventType::VoiceServerUpdate,
            Self::GuildCreate(_) => EventType::GuildCreate,
            Self::Unknown { .. } => EventType::Unknown,
        }
    }

    /// The channel+message pair this event concerns, for collectors.
    #[must_use]
    pub fn collector_key(&self) -> Option<CollectorKey> {
        match self {
            Self::ReactionAdd(r) => Some(CollectorKey {
                channel_id: r.channel_id,
                message_id: r.message_id,
            }),
            Self::InteractionCreate(i) => Some(CollectorKey {
                channel_id: i.channel_id?,
                message_id: i.message?.id,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_omits_empty_dispatch_fields() {
        let payload = GatewayPayload::new(Opcode::Heartbeat, &Some(6u64)).unwrap();
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"op": 1, "d": 6})
        );
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":11}"#).unwrap();
        assert_eq!(payload.opcode(), Some(Opcode::HeartbeatAck));
        assert_eq!(payload.d, Value::Null);
    }

    #[test]
    fn dispatches_become_typed_events() {
        let event = Event::from_dispatch(
            "MESSAGE_REACTION_ADD",
            json!({
                "user_id": "1",
                "channel_id": "2",
                "message_id": "3",
                "emoji": {"name": "x"},
            }),
        )
        .unwrap();

        assert_eq!(event.event_type(), EventType::ReactionAdd);
        assert_eq!(
            event.collector_key(),
            Some(CollectorKey {
                channel_id: ChannelId(2),
                message_id: MessageId(3),
            })
        );
    }

    #[test]
    fn component_interactions_are_keyed_by_message() {
        let event = Event::from_dispatch(
            "INTERACTION_CREATE",
            json!({
                "id": "9",
                "type": 3,
                "channel_id": "2",
                "message": {"id": "3"},
                "data": {"custom_id": "ok"},
                "token": "tok",
            }),
        )
        .unwrap();

        assert_eq!(
            event.collector_key(),
            Some(CollectorKey {
                channel_id: ChannelId(2),
                message_id: MessageId(3),
            })
        );
    }

    #[test]
    fn unknown_dispatch_keeps_raw_data() {
        let event = Event::from_dispatch("TYPING_START", json!({"a": 1})).unwrap();
        assert_eq!(event.event_type(), EventType::Unknown);
        assert!(matches!(event, Event::Unknown { ref kind, .. } if kind == "TYPING_START"));
    }

    #[test]
    fn secrets_stay_out_of_debug() {
        let identify = Identify {
            token: "very-secret".into(),
            intents: 1,
            properties: IdentifyProperties::default(),
            shard: [0, 1],
            presence: None,
            large_threshold: 250,
        };
        assert!(!format!("{:?}", identify).contains("very-secret"));
    }
}
