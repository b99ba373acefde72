use super::Call;
use crate::{
    client::QuitSignal,
    error::{JoinError, JoinResult},
    id::{ChannelId, GuildId, UserId},
    model::Event,
    shard::{shard_id, ShardHandle},
    Config,
};
use dashmap::DashMap;
use parking_lot::RwLock as PRwLock;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    OnceLock,
};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

/// A shard-aware struct responsible for managing [`Call`]s.
///
/// This manager transparently maps guild state and a source of shard information
/// into individual calls, and forwards state updates which affect call state.
#[derive(Debug)]
pub struct VoiceManager {
    user_id: OnceLock<UserId>,
    shard_count: AtomicU64,
    shards: DashMap<u64, ShardHandle>,
    calls: DashMap<GuildId, Arc<Mutex<Call>>>,
    config: PRwLock<Config>,
    quit: QuitSignal,
}

impl VoiceManager {
    /// Creates a manager for `shard_count` shards, whose calls are built from `config`.
    ///
    /// The bot's user ID is learned from the first `READY` passed to
    /// [`process`], unless given sooner through [`set_user_id`].
    ///
    /// [`process`]: VoiceManager::process
    /// [`set_user_id`]: VoiceManager::set_user_id
    #[must_use]
    pub fn new(shard_count: u64, config: Config, quit: QuitSignal) -> Self {
        Self {
            user_id: OnceLock::new(),
            shard_count: AtomicU64::new(shard_count.max(1)),
            shards: DashMap::new(),
            calls: DashMap::new(),
            config: PRwLock::new(config),
            quit,
        }
    }

    /// Sets the user ID voice connections are made as.
    ///
    /// Has no effect once an ID is known.
    pub fn set_user_id<U: Into<UserId>>(&self, user_id: U) {
        let _ = self.user_id.set(user_id.into());
    }

    /// The bot's user ID, if known.
    #[must_use]
    pub fn user_id(&self) -> Option<UserId> {
        self.user_id.get().copied()
    }

    pub(crate) fn set_shard_count(&self, shard_count: u64) {
        self.shard_count.store(shard_count.max(1), Ordering::Relaxed);
    }

    /// Makes a shard available for carrying voice state updates.
    pub fn register_shard(&self, handle: ShardHandle) {
        debug!("Registered shard handle {}.", handle.index());
        self.shards.insert(handle.index(), handle);
    }

    /// Removes a shard, so that no new calls are routed through it.
    pub fn deregister_shard(&self, index: u64) {
        self.shards.remove(&index);
        debug!("Deregistered shard handle {}.", index);
    }

    /// Retrieves a [`Call`] for the given guild, if one already exists.
    pub fn get<G: Into<GuildId>>(&self, guild_id: G) -> Option<Arc<Mutex<Call>>> {
        self.calls
            .get(&guild_id.into())
            .map(|mapref| Arc::clone(&mapref))
    }

    /// Retrieves a [`Call`] for the given guild, creating a new one if
    /// none is found.
    ///
    /// This will not join any calls, or cause connection state to change.
    /// Creation fails until the bot's user ID is known and the guild's shard
    /// has been registered.
    pub fn get_or_insert<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<Arc<Mutex<Call>>> {
        let guild_id = guild_id.into();

        if let Some(call) = self.get(guild_id) {
            return Ok(call);
        }

        let user_id = self.user_id().ok_or(JoinError::NoSender)?;
        let shard = shard_id(guild_id, self.shard_count.load(Ordering::Relaxed));
        let shard_handle = self
            .shards
            .get(&shard)
            .map(|h| h.clone())
            .ok_or(JoinError::NoSender)?;

        let call = self
            .calls
            .entry(guild_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Call::new(
                    guild_id,
                    shard_handle,
                    user_id,
                    self.config.read().clone(),
                    self.quit.clone(),
                )))
            })
            .clone();

        Ok(call)
    }

    /// Number of [`Call`]s currently managed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Whether no [`Call`]s are managed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Guilds which currently have a [`Call`].
    #[must_use]
    pub fn guilds(&self) -> Vec<GuildId> {
        self.calls.iter().map(|x| *x.key()).collect()
    }

    /// Sets a shared configuration for all drivers created from this
    /// manager.
    ///
    /// Changes made here will apply to new Call and Driver instances only.
    pub fn set_config(&self, new_config: Config) {
        let mut config = self.config.write();
        *config = new_config;
    }

    /// Connects to a target by retrieving its relevant [`Call`] and
    /// connecting, or creating the handler if required.
    ///
    /// This can also switch to the given channel, if a handler already exists
    /// for the target and the current connected channel is not equal to the
    /// given channel.
    ///
    /// The provided channel ID is used as a connection target. The
    /// channel _must_ be in the provided guild. This is _not_ checked by the
    /// library, and will result in an error.
    ///
    /// Users *must* ensure that [`process`] keeps being called on another
    /// task while this is awaited: the shard runners in this crate do so.
    ///
    /// NOTE: an `Err(..)` value will still create a [`Call`] accessible via [`get`].
    ///
    /// [`get`]: VoiceManager::get
    /// [`process`]: VoiceManager::process
    #[instrument(skip(self))]
    pub async fn join<C, G>(&self, guild_id: G, channel_id: C) -> JoinResult<Arc<Mutex<Call>>>
    where
        C: Into<ChannelId> + std::fmt::Debug,
        G: Into<GuildId> + std::fmt::Debug,
    {
        let call = self.get_or_insert(guild_id)?;

        let stage_1 = {
            let mut handler = call.lock().await;
            handler.join(channel_id)
        };

        stage_1?.await.map(|()| call)
    }

    /// Retrieves the [handler][`Call`] for the given target and leaves the
    /// associated voice channel, if connected.
    ///
    /// This will _not_ drop the handler, and will preserve it and its settings.
    /// If you do not need to reuse configuration or the frame queue,
    /// *consider calling [`remove`]* to release tasks, threads, and memory.
    ///
    /// [`remove`]: VoiceManager::remove
    pub async fn leave<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<()> {
        if let Some(call) = self.get(guild_id) {
            let mut handler = call.lock().await;
            handler.leave()
        } else {
            Err(JoinError::NoCall)
        }
    }

    /// Retrieves the [`Call`] for the given target and leaves the associated
    /// voice channel, if connected.
    ///
    /// The handler is then dropped, removing settings for the target.
    ///
    /// An Err(...) value implies that the gateway could not be contacted,
    /// and that leaving should be attempted again later (i.e., after reconnect).
    pub async fn remove<G: Into<GuildId>>(&self, guild_id: G) -> JoinResult<()> {
        let guild_id = guild_id.into();
        self.leave(guild_id).await?;
        self.calls.remove(&guild_id);
        Ok(())
    }

    /// Leaves every call and drops its driver.
    pub(crate) async fn clear(&self) {
        for guild_id in self.guilds() {
            if let Some((_, call)) = self.calls.remove(&guild_id) {
                let mut handler = call.lock().await;
                // The shard may already be gone at shutdown.
                let _ = handler.leave();
            }
        }
    }

    /// Handle events received on the gateway.
    ///
    /// This must see every inbound `READY`, `VOICE_STATE_UPDATE` and
    /// `VOICE_SERVER_UPDATE`; shard runners created by this crate's
    /// [`Client`] call it before dispatching to handlers.
    ///
    /// [`Client`]: crate::Client
    pub async fn process(&self, event: &Event) {
        match event {
            Event::Ready(ready) => {
                self.set_user_id(ready.user.id);
            },
            Event::VoiceServerUpdate(v) => {
                if let Some(call) = self.get(v.guild_id) {
                    let mut handler = call.lock().await;
                    if let Some(endpoint) = &v.endpoint {
                        handler.update_server(endpoint.clone(), v.token.clone());
                    }
                }
            },
            Event::VoiceStateUpdate(v) => {
                if self.user_id().map_or(true, |id| v.user_id != id) {
                    return;
                }

                if let Some(call) = v.guild_id.and_then(|id| self.get(id)) {
                    let mut handler = call.lock().await;
                    handler.update_state(v.session_id.clone(), v.channel_id);
                }
            },
            _ => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::{Ready, User, VoiceServerUpdate, VoiceState},
        shard::ShardRunnerMessage,
    };

    const BOT: UserId = UserId(7);

    fn manager() -> (VoiceManager, flume::Receiver<ShardRunnerMessage>) {
        let (tx, rx) = flume::unbounded();
        let manager = VoiceManager::new(1, Config::default(), QuitSignal::new());
        manager.register_shard(ShardHandle::new(0, tx));
        (manager, rx)
    }

    fn ready() -> Event {
        Event::Ready(Box::new(Ready {
            session_id: "main".into(),
            resume_gateway_url: None,
            user: User {
                id: BOT,
                username: "bot".into(),
                bot: true,
            },
            shard: None,
        }))
    }

    fn state(user_id: UserId, channel_id: Option<ChannelId>) -> Event {
        Event::VoiceStateUpdate(Box::new(VoiceState {
            guild_id: Some(GuildId(1)),
            channel_id,
            user_id,
            session_id: format!("sess-{}", user_id),
        }))
    }

    fn server() -> Event {
        Event::VoiceServerUpdate(Box::new(VoiceServerUpdate {
            guild_id: GuildId(1),
            token: "tok".into(),
            endpoint: Some("voice.test".into()),
        }))
    }

    #[tokio::test]
    async fn calls_need_a_known_user() {
        let (manager, _rx) = manager();
        assert!(matches!(manager.get_or_insert(GuildId(1)), Err(JoinError::NoSender)));

        manager.process(&ready()).await;
        assert_eq!(manager.user_id(), Some(BOT));
        assert!(manager.get_or_insert(GuildId(1)).is_ok());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn voice_events_complete_the_call() {
        let (manager, rx) = manager();
        manager.process(&ready()).await;

        let call = manager.get_or_insert(GuildId(1)).unwrap();
        let _join = call.lock().await.join(ChannelId(3)).unwrap();
        assert!(matches!(rx.try_recv(), Ok(ShardRunnerMessage::Send(_))));

        // Other members' states are not ours.
        manager.process(&state(UserId(99), Some(ChannelId(3)))).await;
        manager.process(&server()).await;
        assert!(call.lock().await.current_connection().is_none());

        manager.process(&state(BOT, Some(ChannelId(3)))).await;
        let handler = call.lock().await;
        let info = handler.current_connection().unwrap();
        assert_eq!(info.session_id, "sess-7");
        assert_eq!(info.endpoint, "voice.test");
    }

    #[tokio::test]
    async fn remove_leaves_and_forgets() {
        let (manager, rx) = manager();
        manager.set_user_id(BOT);

        assert!(matches!(manager.leave(GuildId(1)).await, Err(JoinError::NoCall)));

        manager.get_or_insert(GuildId(1)).unwrap();
        manager.remove(GuildId(1)).await.unwrap();

        assert!(manager.is_empty());
        match rx.try_recv() {
            Ok(ShardRunnerMessage::Send(p)) => assert!(p.d["channel_id"].is_null()),
            other => panic!("expected a leave, got {:?}", other),
        }
    }
}
