use crate::{
    constants::{API_BASE, GATEWAY_VERSION, VOICE_GATEWAY_VERSION},
    model::Presence,
    retry::Retry,
    transport::{Connector, TlsConnector},
    voice::driver::CryptoMode,
    ws::{Encoding, WsSettings},
};
use derivative::Derivative;
use std::{sync::Arc, time::Duration};

/// Configuration for shards and voice calls.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
#[non_exhaustive]
pub struct Config {
    /// Bot token used to identify shards, resume sessions, and call the REST API.
    ///
    /// Never printed by this type's `Debug` implementation.
    #[derivative(Debug(format_with = "redact"))]
    pub token: String,

    /// Gateway intents bitmask sent on identify.
    ///
    /// Voice support needs `GUILD_VOICE_STATES` (`1 << 7`).
    ///
    /// Defaults to `GUILDS | GUILD_VOICE_STATES`.
    pub intents: u64,

    /// Encoding of gateway payloads.
    ///
    /// Defaults to [`Encoding::Json`]. Voice control channels always use JSON.
    pub encoding: Encoding,

    /// Main gateway API version.
    ///
    /// Defaults to 10.
    pub gateway_version: u8,

    /// Voice gateway API version.
    ///
    /// Defaults to 4.
    pub voice_gateway_version: u8,

    /// Consecutive failed reconnects a shard tolerates before the client
    /// signals shutdown.
    ///
    /// Defaults to 10.
    pub max_reconnect_attempts: usize,

    /// Heartbeat intervals that may pass without an acknowledgement before a
    /// shard or voice connection is treated as a zombie and reconnected.
    ///
    /// Defaults to 2.
    pub missed_heartbeat_limit: u32,

    /// Longest any socket waits for readiness in one I/O pass.
    ///
    /// Defaults to 10ms.
    pub poll_timeout: Duration,

    /// Configures the amount of time to wait for Discord to reply with voice
    /// connection information after [`Call::join`] is used.
    ///
    /// Defaults to 20 seconds. If set to `None`, joins will never time out.
    ///
    /// [`Call::join`]: crate::voice::Call::join
    pub gateway_timeout: Option<Duration>,

    /// Configures the maximum amount of time to wait for an attempted voice
    /// connection to Discord.
    ///
    /// Defaults to 10 seconds. If set to `None`, connections will never time out.
    pub driver_timeout: Option<Duration>,

    /// Connection retry logic for voice connections.
    ///
    /// This controls how many times a call should retry any connections,
    /// as well as how long to wait between attempts.
    pub driver_retry: Retry,

    /// Selected tagging mode for voice packet encryption.
    ///
    /// Defaults to [`CryptoMode::Normal`].
    ///
    /// Changes to this field will not immediately apply if a call is
    /// actively connected, but will apply to subsequent sessions.
    pub crypto_mode: CryptoMode,

    /// Whether outbound websocket frames are XOR-masked with a random key.
    ///
    /// When disabled, frames carry an all-zero key and unmasked payloads,
    /// which the gateway tolerates.
    ///
    /// Defaults to `true`.
    pub mask_frames: bool,

    /// Gap between keepalive silence frames while a call has nothing to play.
    ///
    /// Defaults to 5 seconds.
    pub idle_silence_gap: Duration,

    /// Longest teardown waits for a worker to stop before escalating to the
    /// client's quit signal.
    ///
    /// Defaults to 5 seconds.
    pub shutdown_timeout: Duration,

    /// Presence sent with identify.
    pub presence: Option<Presence>,

    /// Member count above which offline members are left out of guild data.
    ///
    /// Defaults to 250.
    pub large_threshold: u64,

    /// Base URL of the REST API.
    pub api_base: String,

    /// Opens the byte stream beneath every gateway and voice websocket.
    ///
    /// Defaults to a [`TlsConnector`] trusting the bundled web PKI roots.
    #[derivative(Debug = "ignore")]
    pub connector: Arc<dyn Connector>,
}

#[allow(clippy::ptr_arg)]
fn redact(_: &String, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str("<secret>")
}

/// `GUILDS | GUILD_VOICE_STATES`.
pub const DEFAULT_INTENTS: u64 = 1 | (1 << 7);

impl Default for Config {
    fn default() -> Self {
        Self {
            token: String::new(),
            intents: DEFAULT_INTENTS,
            encoding: Encoding::Json,
            gateway_version: GATEWAY_VERSION,
            voice_gateway_version: VOICE_GATEWAY_VERSION,
            max_reconnect_attempts: 10,
            missed_heartbeat_limit: 2,
            poll_timeout: Duration::from_millis(10),
            gateway_timeout: Some(Duration::from_secs(20)),
            driver_timeout: Some(Duration::from_secs(10)),
            driver_retry: Retry::default(),
            crypto_mode: CryptoMode::Normal,
            mask_frames: true,
            idle_silence_gap: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            presence: None,
            large_threshold: 250,
            api_base: API_BASE.into(),
            connector: Arc::new(TlsConnector::new()),
        }
    }
}

impl Config {
    /// Creates a default configuration using the given bot token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::default().token(token)
    }

    /// Sets this `Config`'s bot token.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Sets this `Config`'s gateway intents.
    #[must_use]
    pub fn intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    /// Sets this `Config`'s gateway payload encoding.
    #[must_use]
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sets this `Config`'s main gateway version.
    #[must_use]
    pub fn gateway_version(mut self, gateway_version: u8) -> Self {
        self.gateway_version = gateway_version;
        self
    }

    /// Sets this `Config`'s voice gateway version.
    #[must_use]
    pub fn voice_gateway_version(mut self, voice_gateway_version: u8) -> Self {
        self.voice_gateway_version = voice_gateway_version;
        self
    }

    /// Sets this `Config`'s shard reconnect limit.
    #[must_use]
    pub fn max_reconnect_attempts(mut self, max_reconnect_attempts: usize) -> Self {
        self.max_reconnect_attempts = max_reconnect_attempts;
        self
    }

    /// Sets this `Config`'s zombie connection threshold.
    #[must_use]
    pub fn missed_heartbeat_limit(mut self, missed_heartbeat_limit: u32) -> Self {
        self.missed_heartbeat_limit = missed_heartbeat_limit.max(1);
        self
    }

    /// Sets this `Config`'s socket poll timeout.
    #[must_use]
    pub fn poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Sets this `Config`'s timeout for joining a voice channel.
    #[must_use]
    pub fn gateway_timeout(mut self, gateway_timeout: Option<Duration>) -> Self {
        self.gateway_timeout = gateway_timeout;
        self
    }

    /// Sets this `Config`'s timeout for establishing a voice connection.
    #[must_use]
    pub fn driver_timeout(mut self, driver_timeout: Option<Duration>) -> Self {
        self.driver_timeout = driver_timeout;
        self
    }

    /// Sets this `Config`'s voice connection retry configuration.
    #[must_use]
    pub fn driver_retry(mut self, driver_retry: Retry) -> Self {
        self.driver_retry = driver_retry;
        self
    }

    /// Sets this `Config`'s chosen cryptographic tagging scheme.
    #[must_use]
    pub fn crypto_mode(mut self, crypto_mode: CryptoMode) -> Self {
        self.crypto_mode = crypto_mode;
        self
    }

    /// Sets whether this `Config`'s websocket frames are masked.
    #[must_use]
    pub fn mask_frames(mut self, mask_frames: bool) -> Self {
        self.mask_frames = mask_frames;
        self
    }

    /// Sets this `Config`'s keepalive silence gap.
    #[must_use]
    pub fn idle_silence_gap(mut self, idle_silence_gap: Duration) -> Self {
        self.idle_silence_gap = idle_silence_gap;
        self
    }

    /// Sets this `Config`'s worker shutdown timeout.
    #[must_use]
    pub fn shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }

    /// Sets this `Config`'s initial presence.
    #[must_use]
    pub fn presence(mut self, presence: Presence) -> Self {
        self.presence = Some(presence);
        self
    }

    /// Sets this `Config`'s large guild threshold.
    #[must_use]
    pub fn large_threshold(mut self, large_threshold: u64) -> Self {
        self.large_threshold = large_threshold;
        self
    }

    /// Sets this `Config`'s REST API base URL.
    #[must_use]
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Sets this `Config`'s stream connector.
    #[must_use]
    pub fn connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Websocket settings for the main gateway.
    pub(crate) fn gateway_ws(&self) -> WsSettings {
        WsSettings {
            encoding: self.encoding,
            mask_frames: self.mask_frames,
            poll_timeout: self.poll_timeout,
            handshake_timeout: self.driver_timeout.unwrap_or(Duration::from_secs(10)),
        }
    }

    /// Websocket settings for voice control channels, which only speak JSON.
    pub(crate) fn voice_ws(&self) -> WsSettings {
        WsSettings {
            encoding: Encoding::Json,
            ..self.gateway_ws()
        }
    }

    /// This is used to prevent changes which would invalidate the current session.
    pub(crate) fn make_safe(&mut self, previous: &Config, connected: bool) {
        if connected {
            self.crypto_mode = previous.crypto_mode;
        }
    }
}
