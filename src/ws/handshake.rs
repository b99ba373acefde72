//! HTTP/1.1 upgrade exchange preceding websocket framing.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::random;
use sha1::{Digest, Sha1};
use std::{error::Error as StdError, fmt};

use crate::constants::MAX_UPGRADE_RESPONSE;

/// GUID appended to the client key when computing the accept header.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// An upgrade request ready to be written, with the key it was built from.
#[derive(Clone, Debug)]
pub struct UpgradeRequest {
    /// `Sec-WebSocket-Key` sent to the server.
    pub key: String,
    /// Full request text, including the trailing blank line.
    pub text: String,
}

impl UpgradeRequest {
    /// Builds a request for `path` (including any query string) on `host`.
    #[must_use]
    pub fn new(host: &str, path: &str) -> Self {
        Self::with_key(host, path, generate_key())
    }

    pub(crate) fn with_key(host: &str, path: &str, key: String) -> Self {
        let text = format!(
            "GET {path} HTTP/1.1\r\n\
             Host: {host}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: {key}\r\n\
             Sec-WebSocket-Version: 13\r\n\
             User-Agent: gatewire/{ver}\r\n\
             \r\n",
            path = path,
            host = host,
            key = key,
            ver = env!("CARGO_PKG_VERSION"),
        );

        Self { key, text }
    }
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
#[must_use]
pub fn generate_key() -> String {
    STANDARD.encode(random::<[u8; 16]>())
}

/// Computes the `Sec-WebSocket-Accept` value a server must return for `key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Removes the HTTP response header block from the front of `buf`, if complete.
///
/// Returns `Ok(false)` while the blank-line terminator has not yet arrived.
/// Any bytes after the header block are left in `buf` for frame parsing.
pub fn take_response(buf: &mut Vec<u8>, key: &str) -> Result<bool> {
    let end = match buf
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
    {
        Some(pos) => pos + HEADER_TERMINATOR.len(),
        None if buf.len() > MAX_UPGRADE_RESPONSE => return Err(Error::ResponseTooLarge),
        None => return Ok(false),
    };

    let head = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.drain(..end);

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| Error::Malformed(status_line.to_owned()))?;

    if status != 101 {
        return Err(Error::Status(status));
    }

    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim().to_owned())
        .ok_or(Error::MissingAccept)?;

    if accept == accept_key(key) {
        Ok(true)
    } else {
        Err(Error::AcceptMismatch)
    }
}

/// Failures of the upgrade exchange.
#[derive(Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The server's accept header did not match the request key.
    AcceptMismatch,
    /// The status line could not be parsed.
    Malformed(String),
    /// The server did not send an accept header.
    MissingAccept,
    /// The header block exceeded the size limit.
    ResponseTooLarge,
    /// The server answered with a status other than `101 Switching Protocols`.
    Status(u16),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "websocket upgrade failed: ")?;
        match self {
            Error::AcceptMismatch => write!(f, "accept key mismatch"),
            Error::Malformed(line) => write!(f, "malformed status line {:?}", line),
            Error::MissingAccept => write!(f, "no accept header"),
            Error::ResponseTooLarge => write!(f, "response headers too large"),
            Error::Status(code) => write!(f, "server returned status {}", code),
        }
    }
}

impl StdError for Error {}

/// Convenience type for upgrade handling.
pub type Result<T> = std::result::Result<T, Error>;

/// Builds the server's side of a successful upgrade, for socket-level tests.
#[cfg(test)]
pub(crate) fn response_for(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         sec-websocket-accept: {}\r\n\r\n",
        accept_key(key)
    )
}

/// Pulls the client key out of a raw upgrade request, for socket-level tests.
#[cfg(test)]
pub(crate) fn request_key(request: &str) -> Option<&str> {
    request
        .split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("sec-websocket-key"))
        .map(|(_, value)| value.trim())
}
