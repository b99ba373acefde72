//! Constants affecting gateway, driver, and wire-format handling.

use audiopus::{Bitrate, SampleRate};
use discortp::rtp::RtpType;
use std::time::Duration;

/// The main gateway version used by the library.
pub const GATEWAY_VERSION: u8 = 10;

/// The voice gateway version used by the library.
pub const VOICE_GATEWAY_VERSION: u8 = 4;

/// Port used for all secure websocket connections.
pub const WSS_PORT: u16 = 443;

/// Gateway used when none has been discovered over REST.
pub const GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// Minimum spacing between identifies in one concurrency bucket.
pub const IDENTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Close code asking the gateway to keep the session open for a resume.
pub const RESUMABLE_CLOSE: u16 = 4000;

/// Default REST API base used for gateway discovery.
pub const API_BASE: &str = "https://discord.com/api/v10";

/// Sample rate of audio to be sent to Discord.
pub const SAMPLE_RATE: SampleRate = SampleRate::Hz48000;

/// Sample rate of audio to be sent to Discord.
pub const SAMPLE_RATE_RAW: usize = 48_000;

/// Number of audio frames/packets to be sent per second.
pub const AUDIO_FRAME_RATE: usize = 50;

/// Length of time between any two audio frames.
pub const TIMESTEP_LENGTH: Duration = Duration::from_millis(1000 / AUDIO_FRAME_RATE as u64);

/// Default bitrate for audio.
pub const DEFAULT_BITRATE: Bitrate = Bitrate::BitsPerSecond(128_000);

/// Number of samples in one complete frame of audio per channel.
///
/// This is also the RTP timestamp increment between two consecutive frames.
pub const MONO_FRAME_SIZE: usize = SAMPLE_RATE_RAW / AUDIO_FRAME_RATE;

/// Number of individual samples in one complete frame of stereo audio.
pub const STEREO_FRAME_SIZE: usize = 2 * MONO_FRAME_SIZE;

/// Maximum packet size for a voice packet.
///
/// Set a safe amount below the Ethernet MTU to avoid fragmentation/rejection.
pub const VOICE_PACKET_MAX: usize = 1460;

/// Size of the RTP header prepended to every voice packet.
pub const RTP_HEADER_LEN: usize = 12;

/// Size of an IP discovery request or response.
pub const IP_DISCOVERY_LEN: usize = 74;

/// Value placed in the length field of an IP discovery request.
pub const IP_DISCOVERY_BODY_LEN: u16 = 70;

/// Wait for an IP discovery reply before the request is sent again.
pub const IP_DISCOVERY_RESEND: Duration = Duration::from_millis(500);

/// Number of IP discovery requests sent before giving up.
pub const IP_DISCOVERY_ATTEMPTS: usize = 6;

/// Delay between sends of UDP keepalive frames.
pub const UDP_KEEPALIVE_GAP: Duration = Duration::from_secs(5);

/// Opus silent frame, used to signal speech start and end (and prevent audio glitching).
pub const SILENT_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

/// Number of silent frames sent after audio ends, before speaking is unset.
pub const TRAILING_SILENCE_FRAMES: u8 = 5;

/// The one (and only) RTP version.
pub const RTP_VERSION: u8 = 2;

/// Profile type used by Discord's Opus audio traffic.
pub const RTP_PROFILE_TYPE: RtpType = RtpType::Dynamic(120);

/// Amount of time before a deadline at which the audio pacer stops sleeping
/// and begins to spin.
pub const PACER_SPIN_WINDOW: Duration = Duration::from_micros(1_000);

/// Size of a single read or write performed by a transport socket per I/O pass.
pub const SOCKET_CHUNK_SIZE: usize = 16 * 1024;

/// Upper bound on the HTTP upgrade response header block.
pub const MAX_UPGRADE_RESPONSE: usize = 8 * 1024;

/// Lower bound of the jittered wait after an invalid session.
pub const INVALID_SESSION_MIN_WAIT: Duration = Duration::from_millis(1_000);

/// Upper bound of the jittered wait after an invalid session.
pub const INVALID_SESSION_MAX_WAIT: Duration = Duration::from_millis(5_000);
