#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
//! Gatewire is an async client for Discord's gateway and voice protocols, written in Rust.
//!
//! The library offers:
//!  * Sharded gateway connections over its own websocket stack, speaking JSON or
//!  ETF, which heartbeat, resume, and reconnect on their own. Dispatched events
//!  reach handlers registered on an [`EventRouter`], in the order received.
//!  * Voice calls: a [`VoiceManager`] joins channels through the shards, and each
//!  [`Call`]'s [`Driver`] runs the voice control channel and a paced, encrypted
//!  RTP send loop on a dedicated thread.
//!  * A small REST interface for gateway discovery and raw API requests.
//!
//! ## Intents
//! Voice functionality requires the `GUILD_VOICE_STATES` intent, which the
//! default [`Config`] requests.
//!
//! ## Audio
//! Audio is queued as 20ms [`AudioFrame`]s, either Opus packets or raw stereo
//! samples encoded with [audiopus] (an FFI wrapper for libopus).
//!
//! ```no_run
//! use gatewire::{Client, Config};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = Client::new(Config::new("my-token"));
//! client.start_autosharded().await?;
//! client.wait_for_quit().await;
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! [`EventRouter`]: events::EventRouter
//! [`VoiceManager`]: voice::VoiceManager
//! [`Call`]: voice::Call
//! [`Driver`]: voice::Driver
//! [`AudioFrame`]: voice::AudioFrame
//! [audiopus]: https://github.com/lakelezz/audiopus

#![warn(clippy::pedantic)]
#![allow(
    // Allowed as they are too pedantic
    clippy::module_name_repetitions,
    clippy::wildcard_imports,
    clippy::too_many_lines,
    clippy::cast_lossless,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc,
)]

pub mod client;
mod config;
pub mod constants;
pub mod error;
pub mod etf;
pub mod events;
pub mod frame;
pub mod id;
pub mod model;
pub mod rest;
pub mod retry;
pub mod shard;
pub mod transport;
pub mod voice;
pub mod ws;

pub use discortp as packet;

pub use crate::{
    client::{Client, QuitSignal},
    config::{Config, DEFAULT_INTENTS},
    events::{EventContext, EventHandler, EventRouter},
    model::{Event, EventType},
    voice::{Call, ConnectionInfo, Driver, VoiceEvent, VoiceManager},
    ws::Encoding,
};
