use crate::id::{ChannelId, GuildId, UserId};
use std::fmt;

/// Connection details gathered for one call.
///
/// The voice state and voice server halves arrive as separate gateway events,
/// in either order; [`ConnectionInfo`] is only built once both are present.
#[derive(Clone)]
pub(crate) struct ConnectionProgress {
    guild_id: GuildId,
    user_id: UserId,
    channel_id: ChannelId,
    session_id: Option<String>,
    server: Option<(String, String)>,
    info: Option<ConnectionInfo>,
}

impl ConnectionProgress {
    pub(crate) fn new(guild_id: GuildId, user_id: UserId, channel_id: ChannelId) -> Self {
        Self {
            guild_id,
            user_id,
            channel_id,
            session_id: None,
            server: None,
            info: None,
        }
    }

    pub(crate) fn info(&self) -> Option<&ConnectionInfo> {
        self.info.as_ref()
    }

    pub(crate) fn in_progress(&self) -> bool {
        self.info.is_none()
    }

    pub(crate) fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// Applies the voice state half. Returns whether the driver should (re)connect.
    pub(crate) fn apply_state_update(&mut self, session_id: String, channel_id: ChannelId) -> bool {
        if self.channel_id != channel_id {
            // Moved by someone else: the old server assignment no longer holds.
            self.channel_id = channel_id;
            self.server = None;
            self.info = None;
        }

        let changed = self.session_id.as_deref() != Some(session_id.as_str());
        self.session_id = Some(session_id);

        self.refresh(changed)
    }

    /// Applies the voice server half. Returns whether the driver should (re)connect.
    pub(crate) fn apply_server_update(&mut self, endpoint: String, token: String) -> bool {
        let server = (endpoint, token);
        let changed = self.server.as_ref() != Some(&server);
        self.server = Some(server);

        self.refresh(changed)
    }

    /// Rebuilds the complete info. A first completion always connects; a live
    /// connection only reconnects when a half actually changed.
    fn refresh(&mut self, changed: bool) -> bool {
        let was_complete = self.info.is_some();

        self.info = match (&self.session_id, &self.server) {
            (Some(session_id), Some((endpoint, token))) => Some(ConnectionInfo {
                channel_id: self.channel_id,
                endpoint: endpoint.clone(),
                guild_id: self.guild_id,
                session_id: session_id.clone(),
                token: token.clone(),
                user_id: self.user_id,
            }),
            _ => None,
        };

        self.info.is_some() && (!was_complete || changed)
    }
}

impl fmt::Debug for ConnectionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionProgress")
            .field("guild_id", &self.guild_id)
            .field("channel_id", &self.channel_id)
            .field("session_id", &self.session_id)
            .field("endpoint", &self.server.as_ref().map(|(e, _)| e))
            .field("complete", &self.info.is_some())
            .finish()
    }
}

/// Parameters needed to start communicating with Discord's voice servers.
#[derive(Clone, Eq, Hash, PartialEq)]
pub struct ConnectionInfo {
    /// Voice channel being joined.
    pub channel_id: ChannelId,
    /// Host, and optionally port, of the voice websocket server assigned to this call.
    pub endpoint: String,
    /// Guild owning the channel.
    pub guild_id: GuildId,
    /// Session issued with the bot's voice state.
    pub session_id: String,
    /// Ephemeral secret authenticating the session on the voice server.
    pub token: String,
    /// The bot's user.
    pub user_id: UserId,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("channel_id", &self.channel_id)
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("token", &"<secret>")
            .field("user_id", &self.user_id)
            .finish()
    }
}
