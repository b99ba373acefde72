//! Runner for a voice connection.
//!
//! The driver is a mixed-sync system, using:
//!  * Asynchronous connection management and control channel heartbeating.
//!  * A synchronous, dedicated thread for frame pacing, encoding, and packet generation.
//!
//! This splits up work according to its IO/compute bound nature, preventing packet
//! generation from being slowed down past its deadline, or from affecting other
//! asynchronous tasks your bot must handle.

pub mod connection;
pub mod crypto;
pub mod discovery;
mod pacer;
pub mod sender;
pub(crate) mod tasks;

use connection::error::{Error, Result};
pub use crypto::{CryptoMode, CryptoState};
pub use sender::{AudioFrame, FrameData, FrameEncoder, OpusEncoder, PacketBuilder, PlaybackState};

use super::{ConnectionInfo, VoiceEvent};
use crate::{client::QuitSignal, Config};
use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};
use flume::{r#async::RecvFut, Receiver, SendError, Sender};
use parking_lot::RwLock;
use std::sync::Arc;
use tasks::{message::CoreMessage, DriverParts};
use tracing::{instrument, warn};

/// The control object for a Discord voice connection, handling connection,
/// pacing, encoding, and encryption.
///
/// Audio is handed over as [`AudioFrame`]s through [`Driver::frames`], and
/// sent one per 20ms tick.
#[derive(Debug)]
pub struct Driver {
    config: Config,
    self_mute: bool,
    paused: bool,
    sender: Sender<CoreMessage>,
    frames_tx: Sender<AudioFrame>,
    frames_rx: Receiver<AudioFrame>,
    events: Sender<VoiceEvent>,
    state: Arc<RwLock<PlaybackState>>,
    quit: QuitSignal,
}

impl Driver {
    /// Creates a new voice driver, reporting to `events`.
    ///
    /// This will create the core voice tasks in the background, and so must be
    /// called from within a Tokio runtime. Should a worker fail to stop when
    /// the driver is dropped, `quit` is triggered.
    pub fn new(config: Config, events: Sender<VoiceEvent>, quit: QuitSignal) -> Self {
        let (frames_tx, frames_rx) = flume::unbounded();
        let state = Arc::new(RwLock::new(PlaybackState::default()));

        let mut driver = Driver {
            sender: flume::unbounded().0,
            config,
            self_mute: false,
            paused: false,
            frames_tx,
            frames_rx,
            events,
            state,
            quit,
        };
        driver.sender = driver.start_inner();

        driver
    }

    fn start_inner(&self) -> Sender<CoreMessage> {
        let (tx, rx) = flume::unbounded();

        tasks::start(self.config.clone(), DriverParts {
            rx,
            tx: tx.clone(),
            frames: self.frames_rx.clone(),
            events: self.events.clone(),
            state: self.state.clone(),
            quit: self.quit.clone(),
        });

        tx
    }

    fn restart_inner(&mut self) {
        warn!("Driver tasks were not running; restarting them.");
        self.sender = self.start_inner();

        let _ = self.sender.send(CoreMessage::Mute(self.self_mute));
        let _ = self.sender.send(CoreMessage::SetPaused(self.paused));
    }

    /// Connects to a voice channel using the specified server.
    ///
    /// This method instantly contacts the driver tasks, and its
    /// does not need to be `await`ed to start the actual connection.
    #[instrument(skip(self))]
    pub fn connect(&mut self, info: ConnectionInfo) -> Connect {
        let (tx, rx) = flume::bounded(1);

        self.raw_connect(info, tx);

        Connect {
            inner: rx.into_recv_async(),
        }
    }

    /// Connects to a voice channel using the specified server.
    #[instrument(skip(self))]
    pub(crate) fn raw_connect(&mut self, info: ConnectionInfo, tx: Sender<Result<()>>) {
        self.send(CoreMessage::ConnectWithResult(info, tx));
    }

    /// Leaves the current voice channel, disconnecting from it.
    ///
    /// Queued frames are discarded. This does *not* forget settings, like
    /// whether to be muted or paused.
    #[instrument(skip(self))]
    pub fn leave(&mut self) {
        self.send(CoreMessage::Disconnect);
    }

    /// Sets whether the current connection is to be muted.
    ///
    /// Muted calls keep consuming frames at the usual rate, but send nothing.
    /// If there is no live voice connection, then this only acts as a settings
    /// update for future connections.
    #[instrument(skip(self))]
    pub fn mute(&mut self, mute: bool) {
        self.self_mute = mute;
        self.send(CoreMessage::Mute(mute));
    }

    /// Returns whether the driver is muted (i.e., consumes audio internally
    /// but submits none).
    #[must_use]
    pub fn is_mute(&self) -> bool {
        self.self_mute
    }

    /// Stops taking frames from the queue until [`Driver::play`] is called.
    #[instrument(skip(self))]
    pub fn pause(&mut self) {
        self.set_paused(true);
    }

    /// Resumes taking frames from the queue.
    #[instrument(skip(self))]
    pub fn play(&mut self) {
        self.set_paused(false);
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
        self.send(CoreMessage::SetPaused(paused));
    }

    /// Returns a handle for queueing audio frames.
    ///
    /// Frames are played in the order they were sent, and a
    /// [`FrameData::Skip`] frame ends the current song.
    #[must_use]
    pub fn frames(&self) -> Sender<AudioFrame> {
        self.frames_tx.clone()
    }

    /// Number of frames waiting to be sent.
    #[must_use]
    pub fn queued_frames(&self) -> usize {
        self.frames_rx.len()
    }

    /// Returns what the send loop is currently doing.
    #[must_use]
    pub fn playback_state(&self) -> PlaybackState {
        *self.state.read()
    }

    /// Sets the configuration for this driver.
    ///
    /// Settings which would invalidate a live session apply from the next connection.
    #[instrument(skip(self))]
    pub fn set_config(&mut self, config: Config) {
        self.config = config.clone();
        self.send(CoreMessage::SetConfig(config))
    }

    /// Returns a view of this driver's configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sends a message to the inner tasks, restarting it if necessary.
    fn send(&mut self, status: CoreMessage) {
        // Restart thread if it errored.
        if let Err(SendError(status)) = self.sender.send(status) {
            self.restart_inner();

            let _ = self.sender.send(status);
        }
    }
}

impl Drop for Driver {
    /// Leaves the current connected voice channel, if connected to one, and
    /// stops the driver's tasks.
    fn drop(&mut self) {
        let _ = self.sender.send(CoreMessage::Disconnect);
        let _ = self.sender.send(CoreMessage::Poison);
    }
}

/// Future for a call to [`Driver::connect`].
///
/// This future awaits the *result* of a connection; the driver
/// is messaged at the time of the call.
///
/// [`Driver::connect`]: Driver::connect
pub struct Connect {
    inner: RecvFut<'static, Result<()>>,
}

impl Future for Connect {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(r) => Poll::Ready(r.map_err(|_| Error::AttemptDiscarded).and_then(|x| x)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        connection::test_util::{connector, discovery_server, serve_handshake},
        crypto::{Cipher, KEY_SIZE},
        *,
    };
    use crate::id::{ChannelId, GuildId, UserId};
    use crypto_secretbox::KeyInit;
    use discortp::{rtp::MutableRtpPacket, Packet};
    use std::time::Duration;
    use tokio::time::timeout;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            channel_id: ChannelId(3),
            endpoint: "voice.test".into(),
            guild_id: GuildId(1),
            session_id: "sess".into(),
            token: "tok".into(),
            user_id: UserId(2),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn queued_frame_reaches_the_voice_server() {
        let (connector, servers, _hosts) = connector();
        let config = Config::default()
            .connector(connector)
            .idle_silence_gap(Duration::from_secs(60));
        let (events_tx, events) = flume::unbounded();
        let mut driver = Driver::new(config, events_tx, QuitSignal::new());
        let (udp, udp_port) = discovery_server().await;

        let conn = driver.connect(info());
        let mut server = servers.recv_async().await.unwrap();
        serve_handshake(&mut server, &udp, udp_port).await;
        timeout(Duration::from_secs(5), conn).await.unwrap().unwrap();

        assert_eq!(
            events.recv_async().await.unwrap(),
            VoiceEvent::Connected { ssrc: 99 }
        );

        let opus = vec![0xF8, 0xFF, 0xFE, 0x01];
        driver
            .frames()
            .send(AudioFrame::encoded(UserId(2), opus.clone()))
            .unwrap();

        let mut buf = [0u8; 1460];
        let (len, _) = timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let mut pkt = MutableRtpPacket::new(&mut buf[..len]).unwrap();
        assert_eq!(pkt.get_ssrc(), 99);
        let cipher = Cipher::new_from_slice(&[1u8; KEY_SIZE]).unwrap();
        let (start, end) = CryptoMode::Normal.decrypt_in_place(&mut pkt, &cipher).unwrap();
        let payload = pkt.payload();
        assert_eq!(&payload[start..payload.len() - end], &opus[..]);

        driver.leave();
        loop {
            let evt = timeout(Duration::from_secs(2), events.recv_async())
                .await
                .unwrap()
                .unwrap();
            if evt == VoiceEvent::VoiceEnded {
                break;
            }
        }
        assert_eq!(driver.queued_frames(), 0);
    }

    #[tokio::test]
    async fn settings_survive_as_local_state() {
        let (events_tx, _events) = flume::unbounded();
        let mut driver = Driver::new(Config::default(), events_tx, QuitSignal::new());

        driver.mute(true);
        driver.pause();
        assert!(driver.is_mute());
        assert_eq!(driver.queued_frames(), 0);

        driver.frames().send(AudioFrame::skip(UserId(1))).unwrap();
        // Paused, and with no connection: nothing consumes the frame.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(driver.queued_frames(), 1);
    }
}
