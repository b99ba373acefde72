//! Connection errors and convenience types.

use crate::{voice::DisconnectReason, ws::Error as WsError};
use crypto_secretbox::{cipher::InvalidLength, Error as CryptoError};
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt, io::Error as IoError};
use tokio::time::error::Elapsed;

/// Errors encountered while connecting to a Discord voice server.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The driver hung up an internal signaller, either due to another connection attempt
    /// or a crash.
    AttemptDiscarded,
    /// An error occurred during encryption of voice packets.
    Crypto(CryptoError),
    /// The session description carried a key of the wrong length.
    CryptoInvalidLength,
    /// Server did not return the expected crypto mode during negotiation.
    CryptoModeInvalid,
    /// Selected crypto mode was not offered by server.
    CryptoModeUnavailable,
    /// An indicator that an endpoint URL was invalid.
    EndpointUrl,
    /// Discord failed to correctly respond to IP discovery.
    IllegalDiscoveryResponse,
    /// Could not parse Discord's view of our IP.
    IllegalIp,
    /// Miscellaneous I/O error.
    Io(IoError),
    /// JSON (de)serialization error.
    Json(JsonError),
    /// The connection's background tasks stopped before the handshake finished.
    InterconnectFailure,
    /// Error communicating with gateway server over WebSocket.
    Ws(WsError),
    /// Connection attempt timed out.
    TimedOut,
}

impl Error {
    /// Whether a later attempt with the same session may succeed.
    ///
    /// Closes which end the voice session, and negotiation failures, need
    /// fresh connection info from the main gateway.
    #[must_use]
    pub fn should_retry(&self) -> bool {
        match self {
            Error::Ws(WsError::WsClosed(Some(code))) => !super::is_session_ending_close(*code),
            Error::CryptoModeInvalid
            | Error::CryptoModeUnavailable
            | Error::CryptoInvalidLength
            | Error::EndpointUrl
            | Error::AttemptDiscarded => false,
            _ => true,
        }
    }
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<InvalidLength> for Error {
    fn from(_e: InvalidLength) -> Self {
        Error::CryptoInvalidLength
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl<T> From<flume::SendError<T>> for Error {
    fn from(_e: flume::SendError<T>) -> Error {
        Error::InterconnectFailure
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl From<Elapsed> for Error {
    fn from(_e: Elapsed) -> Error {
        Error::TimedOut
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to connect to Discord RTP server: ")?;
        match self {
            Error::AttemptDiscarded => write!(f, "connection attempt was aborted/discarded"),
            Error::Crypto(e) => write!(f, "{}", e),
            Error::CryptoInvalidLength => write!(f, "server sent a key of invalid length"),
            Error::CryptoModeInvalid => write!(f, "server changed negotiated encryption mode"),
            Error::CryptoModeUnavailable => write!(f, "server did not offer chosen encryption mode"),
            Error::EndpointUrl => write!(f, "endpoint URL received from gateway was invalid"),
            Error::IllegalDiscoveryResponse =>
                write!(f, "IP discovery/NAT punching response was invalid"),
            Error::IllegalIp => write!(f, "IP discovery/NAT punching response had bad IP value"),
            Error::Io(e) => write!(f, "{}", e),
            Error::Json(e) => write!(f, "{}", e),
            Error::InterconnectFailure => write!(f, "failed to contact other task"),
            Error::Ws(e) => write!(f, "websocket issue ({}).", e),
            Error::TimedOut => write!(f, "connection attempt timed out"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Ws(e) => Some(e),
            _ => None,
        }
    }
}

impl From<&Error> for DisconnectReason {
    fn from(e: &Error) -> Self {
        match e {
            Error::AttemptDiscarded => Self::AttemptDiscarded,
            Error::CryptoModeInvalid
            | Error::CryptoModeUnavailable
            | Error::EndpointUrl
            | Error::IllegalDiscoveryResponse
            | Error::IllegalIp
            | Error::Json(_) => Self::ProtocolViolation,
            Error::Io(_) => Self::Io,
            Error::Crypto(_) | Error::CryptoInvalidLength | Error::InterconnectFailure =>
                Self::Internal,
            Error::Ws(ws) => ws.into(),
            Error::TimedOut => Self::TimedOut,
        }
    }
}

impl From<&WsError> for DisconnectReason {
    fn from(e: &WsError) -> Self {
        match e {
            WsError::WsClosed(code) => Self::WsClosed(*code),
            WsError::TimedOut => Self::TimedOut,
            WsError::Io(_) => Self::Io,
            _ => Self::ProtocolViolation,
        }
    }
}

/// Convenience type for Discord voice/driver connection error handling.
pub type Result<T> = std::result::Result<T, Error>;
