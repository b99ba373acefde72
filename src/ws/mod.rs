//! Message-level websocket stream over a [`StreamSocket`].
//!
//! [`WsStream`] owns the socket, performs the HTTP upgrade, and turns frames into
//! whole messages: pings are answered, fragments are reassembled, and close
//! frames surface as [`Error::WsClosed`]. Text frames carry JSON and binary
//! frames carry ETF, whichever encoding was negotiated.

pub mod handshake;

use crate::{
    etf,
    frame::{self, Frame, OpCode},
    transport::StreamSocket,
};
use rand::random;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    collections::VecDeque,
    error::Error as StdError,
    fmt,
    io::Error as IoError,
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use self::handshake::UpgradeRequest;

/// Close code sent on an orderly shutdown.
pub const NORMAL_CLOSE: u16 = 1000;

/// Payload encoding requested in the gateway URL.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// Erlang External Term Format in binary frames.
    Etf,
}

impl Encoding {
    /// Value of the `encoding` query parameter.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Etf => "etf",
        }
    }
}

/// Per-stream behaviour, derived from the client [`Config`].
///
/// [`Config`]: crate::Config
#[derive(Clone, Copy, Debug)]
pub struct WsSettings {
    /// Encoding used for outbound messages.
    pub encoding: Encoding,
    /// Whether outbound payloads are XOR-masked with a random key.
    ///
    /// When unset, frames carry an all-zero key and the payload is sent as-is.
    pub mask_frames: bool,
    /// Longest a single I/O pass waits for readiness.
    pub poll_timeout: Duration,
    /// Longest the HTTP upgrade may take.
    pub handshake_timeout: Duration,
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            encoding: Encoding::Json,
            mask_frames: true,
            poll_timeout: Duration::from_millis(10),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
enum Message {
    Text(Vec<u8>),
    Binary(Vec<u8>),
    Close(Option<u16>),
}

/// A websocket connection carrying JSON or ETF messages.
#[derive(Debug)]
pub struct WsStream {
    socket: StreamSocket,
    settings: WsSettings,
    messages: VecDeque<Message>,
    fragments: Option<(OpCode, Vec<u8>)>,
    close_sent: bool,
}

impl WsStream {
    /// Upgrades a connected socket by sending a request for `path` on `host`.
    ///
    /// Bytes following the server's response headers are kept for frame parsing.
    #[instrument(skip(socket, settings))]
    pub async fn upgrade(
        mut socket: StreamSocket,
        host: &str,
        path: &str,
        settings: WsSettings,
    ) -> Result<Self> {
        let request = UpgradeRequest::new(host, path);
        socket.write(request.text.as_bytes());

        let deadline = Instant::now() + settings.handshake_timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }

            socket.process_io(settings.poll_timeout).await?;

            if handshake::take_response(socket.inbound_mut(), &request.key)? {
                break;
            }
        }

        debug!("Websocket upgrade to {} complete.", host);

        Ok(Self::from_upgraded(socket, settings))
    }

    /// Wraps a socket whose upgrade has already completed.
    #[must_use]
    pub fn from_upgraded(socket: StreamSocket, settings: WsSettings) -> Self {
        Self {
            socket,
            settings,
            messages: VecDeque::new(),
            fragments: None,
            close_sent: false,
        }
    }

    /// Settings this stream was created with.
    #[must_use]
    pub fn settings(&self) -> &WsSettings {
        &self.settings
    }

    /// Performs one I/O pass and moves every complete frame into the message queue.
    pub async fn poll(&mut self) -> Result<()> {
        self.socket.process_io(self.settings.poll_timeout).await?;

        loop {
            match frame::try_parse_frame(self.socket.inbound_mut()) {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => break,
                Err(frame::Error::UnknownOpCode(op)) => {
                    debug!("Skipping frame with reserved opcode {:#x}.", op);
                },
                Err(e) => return Err(e.into()),
            }
        }

        Ok(())
    }

    fn handle_frame(&mut self, frame: Frame) {
        trace!(
            "Frame {:?} (fin: {}, {} bytes).",
            frame.opcode,
            frame.fin,
            frame.payload.len()
        );

        match frame.opcode {
            OpCode::Ping => {
                let pong = frame::encode_frame(OpCode::Pong, &frame.payload, self.mask_key());
                self.socket.write(&pong);
            },
            OpCode::Pong => {},
            OpCode::Close => {
                if let Some(reason) = frame.close_reason() {
                    debug!("Peer closed with {:?}: {}.", frame.close_code, reason);
                }
                self.messages.push_back(Message::Close(frame.close_code));
            },
            OpCode::Text | OpCode::Binary if frame.fin => {
                if self.fragments.take().is_some() {
                    warn!("New message began before previous fragments finished.");
                }
                self.messages.push_back(to_message(frame.opcode, frame.payload));
            },
            OpCode::Text | OpCode::Binary => {
                self.fragments = Some((frame.opcode, frame.payload));
            },
            OpCode::Continuation => match self.fragments.as_mut() {
                Some((_, buf)) => {
                    buf.extend_from_slice(&frame.payload);

                    if frame.fin {
                        if let Some((op, buf)) = self.fragments.take() {
                            self.messages.push_back(to_message(op, buf));
                        }
                    }
                },
                None => debug!("Dropping continuation frame with no message in progress."),
            },
        }
    }

    /// Returns the next decoded message, performing one I/O pass if none is queued.
    ///
    /// `Ok(None)` means either nothing arrived within the poll timeout, or a
    /// message failed to decode and was dropped.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        if self.messages.is_empty() {
            self.poll().await?;
        }

        match self.messages.pop_front() {
            Some(Message::Text(bytes)) => Ok(serde_json::from_slice(&bytes)
                .map_err(|e| {
                    debug!(
                        "Unexpected JSON: {}. Payload: {}",
                        e,
                        String::from_utf8_lossy(&bytes)
                    );
                })
                .ok()),
            Some(Message::Binary(bytes)) => Ok(etf::from_slice(&bytes)
                .map_err(|e| debug!("Unexpected ETF: {}. {} bytes.", e, bytes.len()))
                .ok()),
            Some(Message::Close(code)) => {
                self.reply_close(code);
                Err(Error::WsClosed(code))
            },
            None => Ok(None),
        }
    }

    /// Waits until a message decodes, however long that takes.
    ///
    /// Callers bound this with [`tokio::time::timeout`].
    pub async fn recv_next<T: DeserializeOwned>(&mut self) -> Result<T> {
        loop {
            if let Some(msg) = self.recv().await? {
                return Ok(msg);
            }
        }
    }

    /// Encodes and queues a message, then performs one I/O pass to send it.
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let (opcode, body) = match self.settings.encoding {
            Encoding::Json => (OpCode::Text, serde_json::to_vec(value)?),
            Encoding::Etf => (OpCode::Binary, etf::to_vec(value)?),
        };

        let bytes = frame::encode_frame(opcode, &body, self.mask_key());
        self.socket.write(&bytes);

        self.poll().await
    }

    /// Sends a close frame with `code` and shuts the socket down.
    pub async fn close(&mut self, code: u16) -> Result<()> {
        if !self.close_sent {
            let bytes = frame::encode_close(code, self.mask_key());
            self.socket.write(&bytes);
            self.close_sent = true;
        }

        let res = self
            .socket
            .flush_all(self.settings.poll_timeout.max(Duration::from_millis(100)))
            .await;
        self.socket.close().await;

        res.map_err(Error::from)
    }

    fn reply_close(&mut self, code: Option<u16>) {
        if !self.close_sent {
            let bytes = frame::encode_close(code.unwrap_or(NORMAL_CLOSE), self.mask_key());
            self.socket.write(&bytes);
            self.close_sent = true;
        }
    }

    fn mask_key(&self) -> Option<[u8; 4]> {
        if self.settings.mask_frames {
            Some(random())
        } else {
            Some([0; 4])
        }
    }
}

fn to_message(opcode: OpCode, payload: Vec<u8>) -> Message {
    if opcode == OpCode::Binary {
        Message::Binary(payload)
    } else {
        Message::Text(payload)
    }
}

/// Errors raised by a [`WsStream`].
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// An outbound message could not be encoded as ETF.
    Etf(etf::Error),
    /// The byte stream held a frame this codec cannot accept.
    Frame(frame::Error),
    /// The HTTP upgrade was refused or malformed.
    Handshake(handshake::Error),
    /// The underlying socket failed.
    Io(IoError),
    /// An outbound message could not be encoded as JSON.
    Json(serde_json::Error),
    /// The HTTP upgrade did not finish in time.
    TimedOut,
    /// The peer sent a close frame, with its close code if present.
    WsClosed(Option<u16>),
}

impl Error {
    /// Returns whether the connection remains usable after this error.
    ///
    /// Encoding failures affect one message; everything else means the socket
    /// must be replaced.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Etf(_) | Error::Json(_))
    }

    /// Close code sent by the peer, if this error is a close.
    #[must_use]
    pub fn close_code(&self) -> Option<u16> {
        match self {
            Error::WsClosed(code) => *code,
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Etf(e) => write!(f, "failed to encode ETF message: {}", e),
            Error::Frame(e) => write!(f, "framing error: {}", e),
            Error::Handshake(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "websocket I/O error: {}", e),
            Error::Json(e) => write!(f, "failed to encode JSON message: {}", e),
            Error::TimedOut => write!(f, "websocket upgrade timed out"),
            Error::WsClosed(Some(code)) => write!(f, "websocket closed with code {}", code),
            Error::WsClosed(None) => write!(f, "websocket closed"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Etf(e) => Some(e),
            Error::Frame(e) => Some(e),
            Error::Handshake(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::TimedOut | Error::WsClosed(_) => None,
        }
    }
}

impl From<etf::Error> for Error {
    fn from(e: etf::Error) -> Self {
        Error::Etf(e)
    }
}

impl From<frame::Error> for Error {
    fn from(e: frame::Error) -> Self {
        Error::Frame(e)
    }
}

impl From<handshake::Error> for Error {
    fn from(e: handshake::Error) -> Self {
        Error::Handshake(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

/// Convenience type for websocket handling.
pub type Result<T> = std::result::Result<T, Error>;
