//! Connections to the main gateway.
//!
//! Each shard is a [`ShardCore`] state machine driven by an async [`runner`],
//! and controlled through a cheap, cloneable [`ShardHandle`].

pub mod core;
pub(crate) mod runner;
pub mod session;

pub use self::{
    core::{is_fatal_close, is_session_ending_close, ShardAction, ShardCore},
    session::{ConnectionStage, ShardSession},
};

use crate::{
    error::ShardResult,
    id::{ChannelId, GuildId},
    model::{GatewayPayload, Opcode, Presence, VoiceStateUpdate},
};
use flume::Sender;
use tracing::instrument;

/// Commands accepted by a running shard.
#[derive(Debug)]
pub(crate) enum ShardRunnerMessage {
    /// Forward a payload to the gateway.
    Send(GatewayPayload),
    /// Record a presence for future identifies, and send it.
    SetPresence(Presence),
    /// Close the socket, and resume on a new one.
    Reconnect,
    /// Close the socket and stop.
    Shutdown,
}

/// Sends commands to one shard's runner.
#[derive(Clone, Debug)]
pub struct ShardHandle {
    index: u64,
    tx: Sender<ShardRunnerMessage>,
}

impl ShardHandle {
    pub(crate) fn new(index: u64, tx: Sender<ShardRunnerMessage>) -> Self {
        Self { index, tx }
    }

    /// Index of the shard this handle controls.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether the shard's runner is still accepting commands.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.tx.is_disconnected()
    }

    /// Queues a raw payload for the gateway.
    pub fn send(&self, payload: GatewayPayload) -> ShardResult<()> {
        self.tx.send(ShardRunnerMessage::Send(payload))?;
        Ok(())
    }

    /// Changes this shard's presence (opcode 3).
    ///
    /// The presence is kept, and restored should the shard need to identify again.
    #[instrument(skip(self))]
    pub fn update_presence(&self, presence: Presence) -> ShardResult<()> {
        self.tx.send(ShardRunnerMessage::SetPresence(presence))?;
        Ok(())
    }

    /// Joins, moves between, or leaves (`channel_id: None`) a voice channel
    /// in the given guild (opcode 4).
    #[instrument(skip(self))]
    pub fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
        self_deaf: bool,
        self_mute: bool,
    ) -> ShardResult<()> {
        let payload = GatewayPayload::new(Opcode::VoiceStateUpdate, &VoiceStateUpdate {
            guild_id,
            channel_id,
            self_mute,
            self_deaf,
        })?;

        self.send(payload)
    }

    /// Asks the shard to drop its socket and resume on a new one.
    pub fn reconnect(&self) -> ShardResult<()> {
        self.tx.send(ShardRunnerMessage::Reconnect)?;
        Ok(())
    }

    /// Asks the shard to close its socket and stop.
    pub fn shutdown(&self) -> ShardResult<()> {
        self.tx.send(ShardRunnerMessage::Shutdown)?;
        Ok(())
    }
}

/// Index of the shard which carries events for `guild_id`.
#[must_use]
pub fn shard_id(guild_id: GuildId, shard_count: u64) -> u64 {
    (guild_id.0 >> 22) % shard_count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShardError;

    #[test]
    fn voice_state_update_is_opcode_4() {
        let (tx, rx) = flume::unbounded();
        let handle = ShardHandle::new(0, tx);

        handle
            .update_voice_state(GuildId(41), Some(ChannelId(42)), true, false)
            .unwrap();

        match rx.try_recv().unwrap() {
            ShardRunnerMessage::Send(p) => {
                assert_eq!(p.op, 4);
                assert_eq!(p.d["guild_id"], "41");
                assert_eq!(p.d["channel_id"], "42");
                assert_eq!(p.d["self_deaf"], true);
                assert_eq!(p.d["self_mute"], false);
            },
            other => panic!("unexpected {:?}", other),
        }

        handle
            .update_voice_state(GuildId(41), None, false, false)
            .unwrap();
        match rx.try_recv().unwrap() {
            ShardRunnerMessage::Send(p) => assert!(p.d["channel_id"].is_null()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stopped_shard_refuses_commands() {
        let (tx, rx) = flume::unbounded();
        let handle = ShardHandle::new(3, tx);
        drop(rx);

        assert!(!handle.is_running());
        assert!(matches!(handle.reconnect(), Err(ShardError::Closed)));
    }

    #[test]
    fn guilds_map_onto_shards() {
        let guild = GuildId((5 << 22) | 12345);
        assert_eq!(shard_id(guild, 4), 1);
        assert_eq!(shard_id(guild, 1), 0);
        assert_eq!(shard_id(guild, 0), 0);
    }
}
