//! The audio send loop.
//!
//! One dedicated thread per driver takes [`AudioFrame`]s from the call's queue,
//! encodes raw audio, packs each frame into an encrypted RTP packet, and sends
//! it over UDP on a 20ms grid kept by the [`Pacer`].

use super::{
    crypto::{Cipher, CryptoMode, CryptoState, TAG_SIZE},
    pacer::Pacer,
    tasks::{
        error::{Error, Result},
        message::*,
        Interconnect,
    },
};
use crate::{
    constants::*,
    id::UserId,
    voice::VoiceEvent,
    Config,
};
use audiopus::{coder::Encoder as AudiopusEncoder, Application, Channels};
use discortp::{
    rtp::{MutableRtpPacket, RtpPacket},
    MutablePacket,
};
use flume::{Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use rand::random;
use std::{
    fmt,
    net::UdpSocket,
    num::Wrapping,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Contents of one 20ms audio frame.
#[derive(Clone, Debug, Default, PartialEq)]
#[non_exhaustive]
pub enum FrameData {
    /// No audio: treated like an empty queue.
    #[default]
    Unset,
    /// An Opus packet, sent as-is.
    Encoded(Vec<u8>),
    /// Interleaved stereo PCM at 48kHz, encoded before sending.
    Raw(Vec<f32>),
    /// Marks the end of the current song.
    Skip,
}

/// One unit of audio handed to a call's send loop.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioFrame {
    /// Guild member on whose behalf the frame is played.
    pub owner: UserId,
    /// The audio itself.
    pub data: FrameData,
}

impl AudioFrame {
    /// A frame holding an already-encoded Opus packet.
    #[must_use]
    pub fn encoded(owner: UserId, opus: Vec<u8>) -> Self {
        Self {
            owner,
            data: FrameData::Encoded(opus),
        }
    }

    /// A frame holding `STEREO_FRAME_SIZE` interleaved PCM samples.
    #[must_use]
    pub fn raw(owner: UserId, pcm: Vec<f32>) -> Self {
        Self {
            owner,
            data: FrameData::Raw(pcm),
        }
    }

    /// The end-of-song marker.
    #[must_use]
    pub fn skip(owner: UserId) -> Self {
        Self {
            owner,
            data: FrameData::Skip,
        }
    }
}

/// Playback state of a call's send loop.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum PlaybackState {
    /// No media transport is available yet.
    #[default]
    Connecting,
    /// Connected, with no song in progress.
    Stopped,
    /// Connected, with the queue left untouched.
    Paused,
    /// Sending audio.
    Playing,
    /// The send loop has ended. Terminal.
    Exiting,
}

/// Turns raw PCM into Opus.
pub trait FrameEncoder: Send {
    /// Encodes one frame of interleaved stereo samples into `out`, returning its length.
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize>;
}

/// [`FrameEncoder`] backed by libopus.
pub struct OpusEncoder {
    inner: AudiopusEncoder,
}

impl OpusEncoder {
    /// Creates a stereo, 48kHz encoder at the default bitrate.
    pub fn new() -> Result<Self> {
        let mut inner = AudiopusEncoder::new(SAMPLE_RATE, Channels::Stereo, Application::Audio)?;
        inner.set_bitrate(DEFAULT_BITRATE)?;

        Ok(Self { inner })
    }
}

impl fmt::Debug for OpusEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpusEncoder")
    }
}

impl FrameEncoder for OpusEncoder {
    fn encode(&mut self, pcm: &[f32], out: &mut [u8]) -> Result<usize> {
        let len = pcm.len().min(STEREO_FRAME_SIZE);
        self.inner.encode_float(&pcm[..len], out).map_err(Into::into)
    }
}

/// Builds consecutive encrypted RTP packets for one SSRC.
pub struct PacketBuilder {
    packet: [u8; VOICE_PACKET_MAX],
    crypto_state: CryptoState,
    cipher: Cipher,
    sequence: Wrapping<u16>,
    timestamp: Wrapping<u32>,
}

impl PacketBuilder {
    /// Creates a builder whose counters start at random values.
    #[must_use]
    pub fn new(ssrc: u32, mode: CryptoMode, cipher: Cipher) -> Self {
        Self::with_counters(ssrc, mode, cipher, random(), random())
    }

    /// Creates a builder whose first packet carries `sequence` and `timestamp`.
    #[must_use]
    pub fn with_counters(
        ssrc: u32,
        mode: CryptoMode,
        cipher: Cipher,
        sequence: u16,
        timestamp: u32,
    ) -> Self {
        let mut packet = [0u8; VOICE_PACKET_MAX];

        let mut rtp = MutableRtpPacket::new(&mut packet[..]).expect(
            "FATAL: Too few bytes in self.packet for RTP header.\
                (Blame: VOICE_PACKET_MAX?)",
        );
        rtp.set_version(RTP_VERSION);
        rtp.set_payload_type(RTP_PROFILE_TYPE);
        rtp.set_ssrc(ssrc);

        Self {
            packet,
            crypto_state: mode.into(),
            cipher,
            sequence: Wrapping(sequence),
            timestamp: Wrapping(timestamp),
        }
    }

    /// Sequence number of the next packet.
    #[must_use]
    pub fn sequence(&self) -> u16 {
        self.sequence.0
    }

    /// RTP timestamp of the next packet.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.timestamp.0
    }

    /// Builds the next packet around an Opus frame.
    pub fn build(&mut self, opus: &[u8]) -> Result<&[u8]> {
        self.build_with(|space| {
            let dest = space
                .get_mut(..opus.len())
                .ok_or(Error::FrameTooLarge(opus.len()))?;
            dest.copy_from_slice(opus);
            Ok(opus.len())
        })
    }

    /// Builds the next packet, letting `fill` write the Opus frame into the
    /// packet's payload area and return its length.
    pub fn build_with<F>(&mut self, fill: F) -> Result<&[u8]>
    where
        F: FnOnce(&mut [u8]) -> Result<usize>,
    {
        let mode = self.crypto_state.kind();

        let len = {
            let mut rtp = MutableRtpPacket::new(&mut self.packet[..]).expect(
                "FATAL: Too few bytes in self.packet for RTP header.\
                    (Blame: VOICE_PACKET_MAX?)",
            );
            rtp.set_sequence(self.sequence.0.into());
            rtp.set_timestamp(self.timestamp.0.into());

            let payload = rtp.payload_mut();
            let space_end = payload.len() - mode.payload_suffix_len();
            let opus_len = fill(&mut payload[TAG_SIZE..space_end])?;

            let final_payload_size = self
                .crypto_state
                .write_packet_nonce(&mut rtp, TAG_SIZE + opus_len);
            mode.encrypt_in_place(&mut rtp, &self.cipher, final_payload_size)?;

            RtpPacket::minimum_packet_size() + final_payload_size
        };

        self.sequence += Wrapping(1);
        self.timestamp += Wrapping(MONO_FRAME_SIZE as u32);

        Ok(&self.packet[..len])
    }
}

impl fmt::Debug for PacketBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketBuilder")
            .field("crypto_state", &self.crypto_state)
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

/// Media transport handed to the send loop once a handshake completes.
#[derive(Debug)]
pub(crate) struct SenderConnection {
    pub(crate) udp: UdpSocket,
    pub(crate) builder: PacketBuilder,
}

enum Outgoing {
    Audio(FrameData),
    Silence,
    Nothing,
}

pub(crate) struct AudioSender {
    rx: Receiver<SenderMessage>,
    frames: Receiver<AudioFrame>,
    interconnect: Interconnect,
    conn: Option<SenderConnection>,
    ws: Option<Sender<WsMessage>>,
    encoder: Box<dyn FrameEncoder>,
    pacer: Pacer,
    state: Arc<RwLock<PlaybackState>>,
    idle_silence_gap: Duration,
    last_sent: Instant,
    silence_frames: u8,
    speaking: bool,
    muted: bool,
    paused: bool,
}

impl AudioSender {
    pub(crate) fn new(
        rx: Receiver<SenderMessage>,
        frames: Receiver<AudioFrame>,
        interconnect: Interconnect,
        encoder: Box<dyn FrameEncoder>,
        state: Arc<RwLock<PlaybackState>>,
        config: &Config,
    ) -> Self {
        let now = Instant::now();

        Self {
            rx,
            frames,
            interconnect,
            conn: None,
            ws: None,
            encoder,
            pacer: Pacer::new(now),
            state,
            idle_silence_gap: config.idle_silence_gap,
            last_sent: now,
            silence_frames: 0,
            speaking: false,
            muted: false,
            paused: false,
        }
    }

    #[instrument(skip(self))]
    pub(crate) fn run(&mut self) {
        'runner: loop {
            if self.conn.is_some() {
                loop {
                    match self.rx.try_recv() {
                        Ok(m) =>
                            if self.handle_message(m) {
                                break 'runner;
                            },
                        Err(TryRecvError::Disconnected) => break 'runner,
                        Err(TryRecvError::Empty) => break,
                    }
                }

                // The above may have dropped the connection.
                if self.conn.is_some() {
                    if let Err(e) = self.cycle() {
                        debug!("Audio send cycle: {}.", e);

                        if e.should_trigger_connect() {
                            self.conn = None;
                            self.set_state(PlaybackState::Connecting);

                            if self.interconnect.core.send(CoreMessage::FullReconnect).is_err() {
                                break;
                            }
                        }
                    }
                }
            } else {
                match self.rx.recv() {
                    Ok(m) =>
                        if self.handle_message(m) {
                            break 'runner;
                        },
                    Err(_) => break 'runner,
                }
            }
        }

        self.conn = None;
        self.set_state(PlaybackState::Exiting);
    }

    fn handle_message(&mut self, msg: SenderMessage) -> bool {
        match msg {
            SenderMessage::SetConn(conn) => {
                info!("Audio sender using {:?}.", conn.udp.peer_addr().ok());
                self.conn = Some(conn);
                self.pacer.reset(Instant::now());
                self.last_sent = Instant::now();
                self.silence_frames = 0;
                self.speaking = false;
                self.set_state(if self.paused {
                    PlaybackState::Paused
                } else {
                    PlaybackState::Stopped
                });
            },
            SenderMessage::DropConn => {
                self.conn = None;
                self.set_state(PlaybackState::Connecting);
            },
            SenderMessage::Ws(ws) => {
                self.ws = ws;
            },
            SenderMessage::SetConfig(config) => {
                self.idle_silence_gap = config.idle_silence_gap;
            },
            SenderMessage::SetPaused(paused) => {
                self.paused = paused;
                if self.conn.is_some() {
                    self.set_state(if paused {
                        PlaybackState::Paused
                    } else {
                        PlaybackState::Stopped
                    });
                }
            },
            SenderMessage::Mute(muted) => {
                self.muted = muted;
            },
            SenderMessage::Poison => return true,
        }

        false
    }

    fn set_state(&self, state: PlaybackState) {
        let mut current = self.state.write();
        if *current != state {
            trace!("Playback state {:?} -> {:?}.", *current, state);
            *current = state;
        }
    }

    fn next_outgoing(&mut self, now: Instant) -> Outgoing {
        let frame = if self.paused {
            None
        } else {
            self.frames.try_recv().ok()
        };

        match frame.map(|f| f.data) {
            Some(FrameData::Skip) => {
                self.end_song(now);
            },
            Some(data @ (FrameData::Encoded(_) | FrameData::Raw(_))) if !self.muted => {
                self.set_state(PlaybackState::Playing);
                self.silence_frames = TRAILING_SILENCE_FRAMES;
                return Outgoing::Audio(data);
            },
            _ => {},
        }

        if self.silence_frames > 0 {
            Outgoing::Silence
        } else if now.saturating_duration_since(self.last_sent) >= self.idle_silence_gap {
            trace!("Sending keepalive silence.");
            Outgoing::Silence
        } else {
            Outgoing::Nothing
        }
    }

    fn end_song(&mut self, now: Instant) {
        debug!("Song completed.");
        self.set_state(PlaybackState::Stopped);
        self.pacer.reset(now);
        drop(self.interconnect.events.send(VoiceEvent::SongCompleted));
    }

    fn cycle(&mut self) -> Result<()> {
        let outgoing = self.next_outgoing(Instant::now());
        let sends = !matches!(outgoing, Outgoing::Nothing);

        self.pacer.wait();
        let work_start = Instant::now();

        let res = match outgoing {
            Outgoing::Audio(data) => {
                self.set_speaking(true)?;
                self.send_frame(&data)
            },
            Outgoing::Silence => {
                let res = self.send_frame(&FrameData::Encoded(SILENT_FRAME.to_vec()));

                if self.silence_frames > 0 {
                    self.silence_frames -= 1;

                    // Speaking ends only once the trailing silence is out.
                    if self.silence_frames == 0 {
                        self.set_speaking(false)?;
                    }
                }

                res
            },
            Outgoing::Nothing => Ok(()),
        };

        let now = Instant::now();
        if sends {
            self.pacer.record_work(now - work_start);
        }
        self.pacer.advance(now);

        res
    }

    fn set_speaking(&mut self, speaking: bool) -> Result<()> {
        if self.speaking != speaking {
            self.speaking = speaking;
            if let Some(ws) = &self.ws {
                ws.send(WsMessage::Speaking(speaking))?;
            }
        }

        Ok(())
    }

    fn send_frame(&mut self, data: &FrameData) -> Result<()> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(());
        };

        let encoder = &mut self.encoder;
        let packet = match data {
            FrameData::Encoded(opus) => conn.builder.build(opus)?,
            FrameData::Raw(pcm) => conn.builder.build_with(|space| encoder.encode(pcm, space))?,
            FrameData::Unset | FrameData::Skip => return Ok(()),
        };

        let res = conn.udp.send(packet).map(|_| ()).map_err(Error::from);
        self.last_sent = Instant::now();

        res.or_else(Error::disarm_would_block)
    }
}

/// Spawns the send loop on its own thread.
///
/// The returned receiver yields once the thread has finished.
pub(crate) fn start(
    rx: Receiver<SenderMessage>,
    frames: Receiver<AudioFrame>,
    interconnect: Interconnect,
    state: Arc<RwLock<PlaybackState>>,
    config: &Config,
) -> Receiver<()> {
    let (done_tx, done_rx) = flume::bounded(1);
    let config = config.clone();

    std::thread::spawn(move || {
        trace!("Audio sender started.");

        match OpusEncoder::new() {
            Ok(encoder) => {
                let mut sender =
                    AudioSender::new(rx, frames, interconnect, Box::new(encoder), state, &config);
                sender.run();
            },
            Err(e) => {
                warn!("Audio sender could not create an Opus encoder: {}.", e);
                *state.write() = PlaybackState::Exiting;
            },
        }

        trace!("Audio sender finished.");
        drop(done_tx.send(()));
    });

    done_rx
}
