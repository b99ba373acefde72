//! Shard session state and connection lifecycle stages.

use std::time::Duration;

/// Lifecycle stage of a shard connection.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum ConnectionStage {
    /// Opening the TLS stream to the gateway.
    Connecting,
    /// Exchanging the HTTP upgrade.
    Upgrading,
    /// Waiting for the server's hello.
    CollectingHello,
    /// Identify sent, waiting for the first dispatch.
    SendingIdentify,
    /// Resume sent, waiting for replayed dispatches.
    Resuming,
    /// Receiving dispatches.
    Authenticated,
    /// No connection is open.
    Disconnected,
}

impl ConnectionStage {
    /// Whether a session has been identified or resumed on this connection.
    #[must_use]
    pub fn is_connected(self) -> bool {
        self == Self::Authenticated
    }
}

/// One logical gateway connection, as it persists across sockets.
#[derive(Clone, Debug)]
pub struct ShardSession {
    /// Index of this shard.
    pub index: u64,
    /// Total shards in use by the client.
    pub count: u64,
    /// Session issued in `READY`, kept for resuming.
    pub session_id: Option<String>,
    /// Gateway URL to reconnect to when resuming.
    pub resume_gateway_url: Option<String>,
    /// Last dispatch sequence number seen.
    pub seq: Option<u64>,
    /// Heartbeat interval announced in the last hello.
    pub heartbeat_interval: Option<Duration>,
    /// Current stage.
    pub stage: ConnectionStage,
    /// Consecutive reconnect attempts since the last successful session.
    pub attempts: usize,
    /// Whether the next connection should resume rather than identify.
    pub resumable: bool,
}

impl ShardSession {
    /// A fresh session for shard `index` of `count`.
    #[must_use]
    pub fn new(index: u64, count: u64) -> Self {
        Self {
            index,
            count: count.max(1),
            session_id: None,
            resume_gateway_url: None,
            seq: None,
            heartbeat_interval: None,
            stage: ConnectionStage::Disconnected,
            attempts: 0,
            resumable: false,
        }
    }

    /// Whether the next connection will send a resume.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.resumable && self.session_id.is_some()
    }

    /// Forgets the session, so that the next connection identifies afresh.
    pub fn invalidate(&mut self) {
        self.session_id = None;
        self.resume_gateway_url = None;
        self.seq = None;
        self.resumable = false;
    }
}
