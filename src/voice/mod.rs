//! Voice calls: joining channels, and streaming audio into them.
//!
//! A [`Call`] tracks one guild's membership through the main gateway, while
//! its [`Driver`] owns the voice server connection and the audio send loop.
//! The [`VoiceManager`] routes the gateway events each call needs.

mod call;
pub mod driver;
mod info;
mod manager;

pub use self::{
    call::Call,
    driver::{AudioFrame, CryptoMode, Driver, FrameData, PlaybackState},
    info::ConnectionInfo,
    manager::VoiceManager,
};
pub(crate) use info::ConnectionProgress;

/// Notable changes in a call's connection or playback.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum VoiceEvent {
    /// The voice handshake finished, and audio may now be sent.
    Connected {
        /// Source identifier assigned to this client's audio.
        ssrc: u32,
    },
    /// The connection was restored after a failure.
    Reconnected,
    /// The connection failed or was closed by the server.
    Disconnected(DisconnectReason),
    /// A [`FrameData::Skip`] marker was reached, ending the current song.
    SongCompleted,
    /// The call's connection was released.
    VoiceEnded,
}

/// Why a voice connection ended.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum DisconnectReason {
    /// This attempt was replaced by another, or the driver stopped.
    AttemptDiscarded,
    /// A bug or resource failure inside this library.
    Internal,
    /// A network socket failed.
    Io,
    /// The server sent something unexpected, or refused the session's parameters.
    ProtocolViolation,
    /// A connection attempt ran out of time.
    TimedOut,
    /// The voice websocket was closed, with the given close code if any.
    WsClosed(Option<u16>),
}
