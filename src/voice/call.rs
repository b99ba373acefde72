use super::{driver::Driver, ConnectionInfo, ConnectionProgress, VoiceEvent};
use crate::{
    client::QuitSignal,
    error::{ConnectionResult, JoinError, JoinResult},
    id::{ChannelId, GuildId, UserId},
    shard::ShardHandle,
    Config,
};
use flume::{Receiver, Sender};
use std::{
    fmt::Debug,
    future::{Future, IntoFuture},
    ops::{Deref, DerefMut},
    pin::Pin,
    time::Duration,
};
use tracing::instrument;

// Two channels: first indicates "gateway connection" was successful,
// second indicates that the driver successfully connected.
// The first is needed to cancel a timeout as the driver can/should
// have separate connection timing/retry config.
#[derive(Clone, Debug)]
struct Return {
    gateway: Sender<()>,
    driver: Sender<ConnectionResult<()>>,
}

/// The Call handler is responsible for a single voice connection, acting
/// as a clean API above the inner state and gateway message management.
///
/// A Call exposes all control methods of [`Driver`] via `Deref(Mut)`.
#[derive(Debug)]
pub struct Call {
    connection: Option<(ConnectionProgress, Return)>,

    /// The internal controller of the voice connection monitor thread.
    driver: Driver,
    events: Receiver<VoiceEvent>,

    guild_id: GuildId,
    /// Whether the current handler is set to deafen voice connections.
    self_deaf: bool,
    /// Whether the current handler is set to mute voice connections.
    self_mute: bool,
    user_id: UserId,
    /// Will be set when a `Call` is made via the [`new`]
    /// method.
    ///
    /// When set via [`standalone`](`Call::standalone`), it will not be
    /// present.
    ///
    /// [`new`]: Call::new
    /// [`standalone`]: Call::standalone
    ws: Option<ShardHandle>,
}

impl Call {
    /// Creates a new Call, which will send out voice state updates via
    /// the given shard.
    #[instrument(skip(quit))]
    pub fn new<G, U>(
        guild_id: G,
        ws: ShardHandle,
        user_id: U,
        config: Config,
        quit: QuitSignal,
    ) -> Self
    where
        G: Into<GuildId> + Debug,
        U: Into<UserId> + Debug,
    {
        Self::new_raw_cfg(guild_id.into(), Some(ws), user_id.into(), config, quit)
    }

    /// Creates a new, standalone Call which is not connected to the Gateway.
    ///
    /// Actions such as muting, deafening, and switching channels will not
    /// function through this Call and must be done through some other
    /// method, as the values will only be internally updated.
    ///
    /// For most use cases you do not want this.
    #[instrument(skip(quit))]
    pub fn standalone<G, U>(guild_id: G, user_id: U, config: Config, quit: QuitSignal) -> Self
    where
        G: Into<GuildId> + Debug,
        U: Into<UserId> + Debug,
    {
        Self::new_raw_cfg(guild_id.into(), None, user_id.into(), config, quit)
    }

    fn new_raw_cfg(
        guild_id: GuildId,
        ws: Option<ShardHandle>,
        user_id: UserId,
        config: Config,
        quit: QuitSignal,
    ) -> Self {
        let (events_tx, events) = flume::unbounded();

        Call {
            connection: None,
            driver: Driver::new(config, events_tx, quit),
            events,
            guild_id,
            self_deaf: false,
            self_mute: false,
            user_id,
            ws,
        }
    }

    #[instrument(skip(self))]
    fn do_connect(&mut self) {
        if let Some((progress, ret)) = &self.connection {
            if let Some(info) = progress.info() {
                // It's okay if the receiver hung up.
                let _ = ret.gateway.send(());

                let (info, tx) = (info.clone(), ret.driver.clone());
                self.driver.raw_connect(info, tx);
            }
        }
    }

    /// Sets whether the current connection is to be deafened.
    ///
    /// If there is no live voice connection, then this only acts as a settings
    /// update for future connections.
    ///
    /// **Note**: If the `Call` was created via [`standalone`], then this
    /// will _only_ update whether the connection is internally deafened.
    ///
    /// [`standalone`]: Call::standalone
    #[instrument(skip(self))]
    pub fn deafen(&mut self, deaf: bool) -> JoinResult<()> {
        self.self_deaf = deaf;

        self.update()
    }

    /// Returns whether the current connection is self-deafened in this server.
    ///
    /// This is purely cosmetic.
    #[must_use]
    pub fn is_deaf(&self) -> bool {
        self.self_deaf
    }

    /// Connect or switch to the given voice channel by its Id.
    ///
    /// This acts in two stages:
    /// * Calling this sends the request over the gateway.
    /// * Awaiting the returned [`Join`] waits for Discord's reply, and then
    ///   the driver's connection attempt. To prevent deadlock, any mutexes
    ///   around this Call *must* be released before it is awaited.
    ///
    /// When using [`VoiceManager::join`], this pattern is correctly handled for you.
    ///
    /// [`VoiceManager::join`]: super::VoiceManager::join
    #[instrument(skip(self))]
    pub fn join<C>(&mut self, channel_id: C) -> JoinResult<Join>
    where
        C: Into<ChannelId> + Debug,
    {
        let channel_id = channel_id.into();
        let (tx, rx) = flume::unbounded();
        let (gw_tx, gw_rx) = flume::unbounded();

        let (in_progress, current) = match &self.connection {
            Some((progress, _)) => (progress.in_progress(), Some(progress.channel_id())),
            None => (false, None),
        };

        if in_progress {
            self.leave()?;
        }

        let in_channel = !in_progress && current == Some(channel_id);

        if in_channel {
            // Skipping the gateway connection implies that the current connection is complete
            // AND the channel is a match.
            //
            // Send a polite request to the driver, which should only *actually* reconnect
            // if it had a problem earlier.
            let _ = gw_tx.send(());
            if let Some(info) = self.current_connection().cloned() {
                self.driver.raw_connect(info, tx);
            }

            return Ok(Join::new(rx, gw_rx, None));
        }

        self.connection = Some((
            ConnectionProgress::new(self.guild_id, self.user_id, channel_id),
            Return {
                gateway: gw_tx,
                driver: tx,
            },
        ));

        let timeout = self.driver.config().gateway_timeout;

        self.update().map(|()| Join::new(rx, gw_rx, timeout))
    }

    /// Returns the current voice connection details for this Call,
    /// if available.
    #[must_use]
    pub fn current_connection(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref().and_then(|(progress, _)| progress.info())
    }

    /// Returns `id` of the channel, if connected or connecting to any.
    ///
    /// This remains set after a connection failure, to allow for reconnection
    /// as needed. This will change if moved into another voice channel by an
    /// admin, and will be unset if kicked from a voice channel.
    #[must_use]
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.connection
            .as_ref()
            .map(|(progress, _)| progress.channel_id())
    }

    /// ID of the guild this call belongs to.
    #[must_use]
    pub fn guild_id(&self) -> GuildId {
        self.guild_id
    }

    /// Leaves the current voice channel, disconnecting from it.
    ///
    /// This does _not_ forget settings, like whether to be self-deafened or
    /// self-muted.
    ///
    /// **Note**: If the `Call` was created via [`standalone`], then this
    /// will _only_ update whether the connection is internally connected to a
    /// voice channel.
    ///
    /// [`standalone`]: Call::standalone
    #[instrument(skip(self))]
    pub fn leave(&mut self) -> JoinResult<()> {
        self.leave_local();

        self.update()
    }

    fn leave_local(&mut self) {
        self.connection = None;
        self.driver.leave();
    }

    /// Sets whether the current connection is to be muted.
    ///
    /// If there is no live voice connection, then this only acts as a settings
    /// update for future connections.
    ///
    /// **Note**: If the `Call` was created via [`standalone`], then this
    /// will _only_ update whether the connection is internally muted.
    ///
    /// [`standalone`]: Call::standalone
    #[instrument(skip(self))]
    pub fn mute(&mut self, mute: bool) -> JoinResult<()> {
        self.self_mute = mute;
        self.driver.mute(mute);

        self.update()
    }

    /// Returns whether the current connection is self-muted in this server.
    #[must_use]
    pub fn is_mute(&self) -> bool {
        self.self_mute
    }

    /// Returns a receiver for this call's [`VoiceEvent`]s.
    ///
    /// Every clone competes for the same events.
    #[must_use]
    pub fn events(&self) -> Receiver<VoiceEvent> {
        self.events.clone()
    }

    /// Updates the voice server data.
    ///
    /// You should only need to use this if you initialized the `Call` via
    /// [`standalone`].
    ///
    /// [`standalone`]: Call::standalone
    #[instrument(skip(self, token))]
    pub fn update_server(&mut self, endpoint: String, token: String) {
        let try_conn = if let Some((ref mut progress, _)) = self.connection.as_mut() {
            progress.apply_server_update(endpoint, token)
        } else {
            false
        };

        if try_conn {
            self.do_connect();
        }
    }

    /// Updates the internal voice state of the current user.
    ///
    /// You should only need to use this if you initialized the `Call` via
    /// [`standalone`].
    ///
    /// [`standalone`]: Call::standalone
    #[instrument(skip(self))]
    pub fn update_state<C>(&mut self, session_id: String, channel_id: Option<C>)
    where
        C: Into<ChannelId> + Debug,
    {
        if let Some(channel_id) = channel_id.map(Into::into) {
            let try_conn = if let Some((ref mut progress, _)) = self.connection.as_mut() {
                progress.apply_state_update(session_id, channel_id)
            } else {
                false
            };

            if try_conn {
                self.do_connect();
            }
        } else {
            // Likely that we were disconnected by an admin.
            self.leave_local();
        }
    }

    /// Send an update for the current session over WS.
    ///
    /// Does nothing if initialized via [`standalone`].
    ///
    /// [`standalone`]: Call::standalone
    fn update(&mut self) -> JoinResult<()> {
        if let Some(ws) = self.ws.as_ref() {
            ws.update_voice_state(
                self.guild_id,
                self.connection.as_ref().map(|c| c.0.channel_id()),
                self.self_deaf,
                self.self_mute,
            )
            .map_err(JoinError::from)
        } else {
            Err(JoinError::NoSender)
        }
    }
}

impl Deref for Call {
    type Target = Driver;

    fn deref(&self) -> &Self::Target {
        &self.driver
    }
}

impl DerefMut for Call {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.driver
    }
}

/// Pending result of [`Call::join`].
///
/// Awaiting this waits for Discord's reply on the gateway, subject to
/// [`Config::gateway_timeout`], and then for the driver to connect, subject to
/// [`Config::driver_timeout`].
///
/// This ***must not*** be `await`ed while holding the lock around a [`Call`].
#[derive(Debug)]
#[must_use = "joins report their outcome only when awaited"]
pub struct Join {
    driver: Receiver<ConnectionResult<()>>,
    gateway: Receiver<()>,
    timeout: Option<Duration>,
}

impl Join {
    fn new(
        driver: Receiver<ConnectionResult<()>>,
        gateway: Receiver<()>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            driver,
            gateway,
            timeout,
        }
    }
}

impl IntoFuture for Join {
    type Output = JoinResult<()>;
    type IntoFuture = Pin<Box<dyn Future<Output = JoinResult<()>> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move {
            let gateway = self.gateway.recv_async();
            let gateway = match self.timeout {
                Some(t) => tokio::time::timeout(t, gateway)
                    .await
                    .map_err(|_| JoinError::TimedOut)?,
                None => gateway.await,
            };
            gateway.map_err(|_| JoinError::Dropped)?;

            self.driver
                .recv_async()
                .await
                .map_err(|_| JoinError::Dropped)?
                .map_err(JoinError::Driver)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::GatewayPayload, shard::ShardRunnerMessage};

    fn call() -> (Call, flume::Receiver<ShardRunnerMessage>) {
        let (tx, rx) = flume::unbounded();
        let shard = ShardHandle::new(0, tx);
        let config = Config::default().gateway_timeout(Some(Duration::from_millis(50)));
        let call = Call::new(GuildId(1), shard, UserId(2), config, QuitSignal::new());
        (call, rx)
    }

    fn sent(rx: &flume::Receiver<ShardRunnerMessage>) -> GatewayPayload {
        match rx.try_recv() {
            Ok(ShardRunnerMessage::Send(p)) => p,
            other => panic!("expected a payload, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_requests_channel_over_gateway() {
        let (mut call, rx) = call();

        let _join = call.join(ChannelId(3)).unwrap();
        let p = sent(&rx);
        assert_eq!(p.op, 4);
        assert_eq!(p.d["channel_id"], "3");
        assert_eq!(call.current_channel(), Some(ChannelId(3)));
        assert!(call.current_connection().is_none());
    }

    #[tokio::test]
    async fn missing_server_update_times_out() {
        let (mut call, _rx) = call();

        let join = call.join(ChannelId(3)).unwrap();
        call.update_state("sess".into(), Some(ChannelId(3)));

        let res = join.await;
        assert!(matches!(res, Err(JoinError::TimedOut)));
        assert!(res.unwrap_err().should_leave_server());
    }

    #[tokio::test]
    async fn both_halves_complete_connection_info() {
        let (mut call, _rx) = call();

        let _join = call.join(ChannelId(3)).unwrap();
        call.update_server("voice.test".into(), "tok".into());
        assert!(call.current_connection().is_none());
        call.update_state("sess".into(), Some(ChannelId(3)));

        let info = call.current_connection().unwrap();
        assert_eq!(info.endpoint, "voice.test");
        assert_eq!(info.session_id, "sess");
        assert_eq!(info.guild_id, GuildId(1));
        assert_eq!(info.user_id, UserId(2));
    }

    #[tokio::test]
    async fn kicked_from_channel_leaves_locally() {
        let (mut call, rx) = call();

        let _join = call.join(ChannelId(3)).unwrap();
        let _ = sent(&rx);
        call.update_state::<ChannelId>("sess".into(), None);

        assert_eq!(call.current_channel(), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_sends_null_channel() {
        let (mut call, rx) = call();

        let _join = call.join(ChannelId(3)).unwrap();
        let _ = sent(&rx);
        call.mute(true).unwrap();
        let _ = sent(&rx);
        call.leave().unwrap();

        let p = sent(&rx);
        assert!(p.d["channel_id"].is_null());
        assert_eq!(p.d["self_mute"], true);
        assert!(call.is_mute());
    }

    #[tokio::test]
    async fn standalone_calls_have_no_sender() {
        let mut call = Call::standalone(GuildId(1), UserId(2), Config::default(), QuitSignal::new());
        assert!(matches!(call.deafen(true), Err(JoinError::NoSender)));
        assert!(call.is_deaf());
    }
}
