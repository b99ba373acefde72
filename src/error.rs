//! Shard and voice error handling.

use std::{error::Error, fmt};

#[derive(Debug)]
#[non_exhaustive]
/// Error returned when a manager or call handler is
/// unable to join, leave, or connect to a voice channel.
pub enum JoinError {
    /// Request to join was dropped, cancelled, or replaced.
    Dropped,
    /// No running shard could carry the voice state update.
    NoSender,
    /// Tried to leave a [`Call`] which was not found.
    ///
    /// [`Call`]: crate::voice::Call
    NoCall,
    /// Connection details were not received from Discord in the
    /// time given in [the client's configuration].
    ///
    /// This can occur if a message is lost by the gateway between
    /// restarts, or if Discord believes that this bot is still in the
    /// channel it attempts to join.
    ///
    /// *Users should `leave` the server on the gateway before
    /// re-attempting connection.*
    ///
    /// [the client's configuration]: crate::Config
    TimedOut,
    /// The voice connection could not be established.
    ///
    /// *Users should `leave` the server on the gateway before
    /// re-attempting connection.*
    Driver(ConnectionError),
    /// The shard rejected the voice state update.
    Shard(ShardError),
}

impl JoinError {
    /// Indicates whether this failure may have left (or been
    /// caused by) Discord's gateway state being in an
    /// inconsistent state.
    ///
    /// Failure to `leave` before rejoining may cause further
    /// timeouts.
    #[must_use]
    pub fn should_leave_server(&self) -> bool {
        matches!(self, JoinError::TimedOut)
    }

    /// Indicates whether this failure happened after connection info was
    /// received, so that reconnecting the call may succeed.
    #[must_use]
    pub fn should_reconnect_driver(&self) -> bool {
        matches!(self, JoinError::Driver(_))
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to join voice channel: ")?;
        match self {
            JoinError::Dropped => write!(f, "request was cancelled/dropped."),
            JoinError::NoSender => write!(f, "no gateway destination."),
            JoinError::NoCall => write!(f, "tried to leave a non-existent call."),
            JoinError::TimedOut => write!(f, "gateway response from Discord timed out."),
            JoinError::Driver(t) => write!(f, "voice connection error {}.", t),
            JoinError::Shard(t) => write!(f, "shard error {}.", t),
        }
    }
}

impl Error for JoinError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            JoinError::Driver(e) => Some(e),
            JoinError::Shard(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectionError> for JoinError {
    fn from(e: ConnectionError) -> Self {
        JoinError::Driver(e)
    }
}

impl From<ShardError> for JoinError {
    fn from(e: ShardError) -> Self {
        match e {
            ShardError::Closed => JoinError::NoSender,
            e => JoinError::Shard(e),
        }
    }
}

/// Convenience type for Discord gateway error handling.
pub type JoinResult<T> = Result<T, JoinError>;

/// Error returned when a command cannot be passed to a shard.
#[derive(Debug)]
#[non_exhaustive]
pub enum ShardError {
    /// The shard's runner has exited.
    Closed,
    /// The command could not be serialised.
    Json(serde_json::Error),
}

impl fmt::Display for ShardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardError::Closed => write!(f, "shard runner has stopped"),
            ShardError::Json(e) => write!(f, "failed to serialise command: {}", e),
        }
    }
}

impl Error for ShardError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShardError::Closed => None,
            ShardError::Json(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for ShardError {
    fn from(e: serde_json::Error) -> Self {
        ShardError::Json(e)
    }
}

impl<T> From<flume::SendError<T>> for ShardError {
    fn from(_e: flume::SendError<T>) -> Self {
        ShardError::Closed
    }
}

/// Convenience type for shard command handling.
pub type ShardResult<T> = Result<T, ShardError>;

pub use crate::{
    client::StartError,
    events::{HandlerError, HandlerResult},
    rest::Error as RestError,
    voice::driver::connection::error::{Error as ConnectionError, Result as ConnectionResult},
    ws::Error as WsError,
};
