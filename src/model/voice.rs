//! Payloads of the voice control channel.

use super::GatewayPayload;
use crate::id::{GuildId, UserId};
use serde::{de::Error as _, ser::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::{fmt, net::IpAddr};

/// Voice gateway opcodes.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
#[repr(u8)]
pub enum VoiceOpcode {
    /// Starts a voice session. Sent.
    Identify = 0,
    /// Chooses the media transport and encryption mode. Sent.
    SelectProtocol = 1,
    /// SSRC, media server address, and offered encryption modes. Received.
    Ready = 2,
    /// Keepalive carrying a nonce. Sent.
    Heartbeat = 3,
    /// Chosen encryption mode and secret key. Received.
    SessionDescription = 4,
    /// Indicates whether audio is being sent. Sent and received.
    Speaking = 5,
    /// Echoes a heartbeat nonce. Received.
    HeartbeatAck = 6,
    /// Resumes a dropped control connection. Sent.
    Resume = 7,
    /// Heartbeat interval. Received.
    Hello = 8,
    /// A resume completed. Received.
    Resumed = 9,
}

impl From<VoiceOpcode> for u8 {
    fn from(op: VoiceOpcode) -> u8 {
        op as u8
    }
}

/// Starts a voice session.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Identify {
    /// Guild of the call.
    pub server_id: GuildId,
    /// The bot's user.
    pub user_id: UserId,
    /// Voice session ID from the main gateway's voice state.
    pub session_id: String,
    /// Token from the main gateway's voice server update.
    pub token: String,
}

impl fmt::Debug for Identify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identify")
            .field("server_id", &self.server_id)
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("token", &"<secret>")
            .finish()
    }
}

/// Resumes a voice session.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct Resume {
    /// Guild of the call.
    pub server_id: GuildId,
    /// Voice session ID.
    pub session_id: String,
    /// Voice token.
    pub token: String,
}

impl fmt::Debug for Resume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resume")
            .field("server_id", &self.server_id)
            .field("session_id", &self.session_id)
            .field("token", &"<secret>")
            .finish()
    }
}

/// Transport details for [`SelectProtocol`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ProtocolData {
    /// Externally visible address of the local UDP socket.
    pub address: IpAddr,
    /// Externally visible port of the local UDP socket.
    pub port: u16,
    /// Chosen encryption mode.
    pub mode: String,
}

/// Chooses the media transport.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct SelectProtocol {
    /// Always `"udp"`.
    pub protocol: String,
    /// Transport details.
    pub data: ProtocolData,
}

/// Describes the media server.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Ready {
    /// Synchronisation source assigned to this client.
    pub ssrc: u32,
    /// Media server address.
    pub ip: IpAddr,
    /// Media server port.
    pub port: u16,
    /// Encryption modes the server accepts.
    pub modes: Vec<String>,
}

/// Final step of the voice handshake.
#[derive(Clone, Deserialize, PartialEq, Serialize)]
pub struct SessionDescription {
    /// Encryption mode in use.
    pub mode: String,
    /// Key for authenticated encryption of media packets.
    pub secret_key: Vec<u8>,
}

impl fmt::Debug for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescription")
            .field("mode", &self.mode)
            .field("secret_key", &"<secret>")
            .finish()
    }
}

/// Speaking state of an SSRC.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Speaking {
    /// Bitflags: 1 microphone, 2 soundshare, 4 priority.
    pub speaking: u8,
    /// Always 0 for bots.
    #[serde(default)]
    pub delay: u32,
    /// SSRC the state applies to.
    pub ssrc: u32,
    /// User owning the SSRC, set on received messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

/// Heartbeat interval of the voice control channel.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct Hello {
    /// Milliseconds between heartbeats. Sent as a float.
    pub heartbeat_interval: f64,
}

/// A voice control message.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Event {
    /// Opcode 0.
    Identify(Identify),
    /// Opcode 1.
    SelectProtocol(SelectProtocol),
    /// Opcode 2.
    Ready(Ready),
    /// Opcode 3, with its nonce.
    Heartbeat(u64),
    /// Opcode 4.
    SessionDescription(SessionDescription),
    /// Opcode 5.
    Speaking(Speaking),
    /// Opcode 6, echoing a nonce.
    HeartbeatAck(u64),
    /// Opcode 7.
    Resume(Resume),
    /// Opcode 8.
    Hello(Hello),
    /// Opcode 9.
    Resumed,
    /// Any other opcode.
    Unknown(u8, Value),
}

impl Event {
    /// Raw opcode of this message.
    #[must_use]
    pub fn op(&self) -> u8 {
        let op = match self {
            Self::Identify(_) => VoiceOpcode::Identify,
            Self::SelectProtocol(_) => VoiceOpcode::SelectProtocol,
            Self::Ready(_) => VoiceOpcode::Ready,
            Self::Heartbeat(_) => VoiceOpcode::Heartbeat,
            Self::SessionDescription(_) => VoiceOpcode::SessionDescription,
            Self::Speaking(_) => VoiceOpcode::Speaking,
            Self::HeartbeatAck(_) => VoiceOpcode::HeartbeatAck,
            Self::Resume(_) => VoiceOpcode::Resume,
            Self::Hello(_) => VoiceOpcode::Hello,
            Self::Resumed => VoiceOpcode::Resumed,
            Self::Unknown(op, _) => return *op,
        };

        op.into()
    }

    fn into_payload(self) -> serde_json::Result<GatewayPayload> {
        let op = self.op();
        let d = match self {
            Self::Identify(v) => serde_json::to_value(v)?,
            Self::SelectProtocol(v) => serde_json::to_value(v)?,
            Self::Ready(v) => serde_json::to_value(v)?,
            Self::Heartbeat(n) | Self::HeartbeatAck(n) => Value::from(n),
            Self::SessionDescription(v) => serde_json::to_value(v)?,
            Self::Speaking(v) => serde_json::to_value(v)?,
            Self::Resume(v) => serde_json::to_value(v)?,
            Self::Hello(v) => serde_json::to_value(v)?,
            Self::Resumed => Value::Null,
            Self::Unknown(_, v) => v,
        };

        Ok(GatewayPayload {
            op,
            d,
            s: None,
            t: None,
        })
    }

    fn from_payload(payload: GatewayPayload) -> serde_json::Result<Self> {
        let d = payload.d;
        Ok(match payload.op {
            0 => Self::Identify(serde_json::from_value(d)?),
            1 => Self::SelectProtocol(serde_json::from_value(d)?),
            2 => Self::Ready(serde_json::from_value(d)?),
            3 => Self::Heartbeat(serde_json::from_value(d)?),
            4 => Self::SessionDescription(serde_json::from_value(d)?),
            5 => Self::Speaking(serde_json::from_value(d)?),
            6 => Self::HeartbeatAck(serde_json::from_value(d)?),
            7 => Self::Resume(serde_json::from_value(d)?),
            8 => Self::Hello(serde_json::from_value(d)?),
            9 => Self::Resumed,
            op => Self::Unknown(op, d),
        })
    }
}

impl Serialize for Event {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.clone()
            .into_payload()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Event {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let payload = GatewayPayload::deserialize(deserializer)?;
        Self::from_payload(payload).map_err(D::Error::custom)
    }
}

impl From<Identify> for Event {
    fn from(v: Identify) -> Self {
        Self::Identify(v)
    }
}

impl From<SelectProtocol> for Event {
    fn from(v: SelectProtocol) -> Self {
        Self::SelectProtocol(v)
    }
}

impl From<Resume> for Event {
    fn from(v: Resume) -> Self {
        Self::Resume(v)
    }
}

impl From<Speaking> for Event {
    fn from(v: Speaking) -> Self {
        Self::Speaking(v)
    }
}
