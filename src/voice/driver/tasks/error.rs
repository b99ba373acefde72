use super::message::{CoreMessage, WsMessage};
use crate::ws::Error as WsError;
use audiopus::Error as OpusError;
use crypto_secretbox::aead::Error as CryptoError;
use flume::SendError;
use std::{
    error::Error as StdError,
    fmt,
    io::{Error as IoError, ErrorKind as IoErrorKind},
};

/// Background task which could not be reached.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recipient {
    /// The voice control channel task.
    AuxNetwork,
    /// The driver's core task.
    Core,
}

/// Convenience type for errors inside the driver's background tasks.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised inside the driver's background tasks.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// A packet could not be encrypted.
    Crypto(CryptoError),
    /// An Opus frame was larger than the packet can hold.
    FrameTooLarge(usize),
    /// Another task hung up.
    InterconnectFailure(Recipient),
    /// The UDP socket failed.
    Io(IoError),
    /// Raw audio could not be encoded.
    Opus(OpusError),
    /// The voice control channel failed.
    Ws(WsError),
}

impl Error {
    /// Whether this failure means the media transport must be rebuilt.
    pub(crate) fn should_trigger_connect(&self) -> bool {
        matches!(
            self,
            Error::InterconnectFailure(Recipient::AuxNetwork) | Error::Io(_)
        )
    }

    // This prevents a `WouldBlock` from triggering a full reconnect,
    // instead simply dropping the packet.
    pub(crate) fn disarm_would_block(self) -> Result<()> {
        match self {
            Self::Io(i) if i.kind() == IoErrorKind::WouldBlock => Ok(()),
            e => Err(e),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Crypto(e) => write!(f, "packet encryption failed: {}", e),
            Error::FrameTooLarge(n) => write!(f, "opus frame of {} bytes does not fit a packet", n),
            Error::InterconnectFailure(r) => write!(f, "failed to contact {:?} task", r),
            Error::Io(e) => write!(f, "voice socket error: {}", e),
            Error::Opus(e) => write!(f, "opus encoding failed: {}", e),
            Error::Ws(e) => write!(f, "voice websocket error: {}", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Opus(e) => Some(e),
            Error::Ws(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<OpusError> for Error {
    fn from(e: OpusError) -> Error {
        Error::Opus(e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl From<SendError<WsMessage>> for Error {
    fn from(_e: SendError<WsMessage>) -> Error {
        Error::InterconnectFailure(Recipient::AuxNetwork)
    }
}

impl From<SendError<CoreMessage>> for Error {
    fn from(_e: SendError<CoreMessage>) -> Error {
        Error::InterconnectFailure(Recipient::Core)
    }
}
