//! Top-level owner of shards, event routing, and voice calls.

use crate::{
    constants::{GATEWAY_URL, IDENTIFY_INTERVAL},
    events::EventRouter,
    rest::{self, RestClient},
    shard::{runner::ShardRunner, ShardCore, ShardHandle},
    voice::VoiceManager,
    Config,
};
use std::{
    error::Error as StdError,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Process-wide request to stop, raised when a worker cannot recover.
///
/// Exhausted shard reconnects and voice workers which ignore teardown both
/// trigger it. Applications wait on it with [`QuitSignal::wait`] or
/// [`Client::wait_for_quit`].
#[derive(Clone, Debug, Default)]
pub struct QuitSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl QuitSignal {
    /// A signal which has not been raised.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal, waking every waiter.
    pub fn trigger(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            warn!("Quit signal raised.");
        }
        self.notify.notify_waiters();
    }

    /// Whether the signal has been raised.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Waits until the signal is raised.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// Errors raised while starting a [`Client`]'s shards.
#[derive(Debug)]
#[non_exhaustive]
pub enum StartError {
    /// Shards are already running.
    AlreadyStarted,
    /// The gateway URL could not be parsed.
    Url(url::ParseError),
    /// Gateway discovery failed.
    Rest(rest::Error),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartError::AlreadyStarted => write!(f, "shards are already running"),
            StartError::Url(e) => write!(f, "invalid gateway URL: {}", e),
            StartError::Rest(e) => write!(f, "gateway discovery failed: {}", e),
        }
    }
}

impl StdError for StartError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            StartError::AlreadyStarted => None,
            StartError::Url(e) => Some(e),
            StartError::Rest(e) => Some(e),
        }
    }
}

impl From<url::ParseError> for StartError {
    fn from(e: url::ParseError) -> Self {
        StartError::Url(e)
    }
}

impl From<rest::Error> for StartError {
    fn from(e: rest::Error) -> Self {
        StartError::Rest(e)
    }
}

/// A bot connection: shards, their event handlers, and voice calls.
///
/// Every shard runs on its own task; events are passed to the
/// [`VoiceManager`] and then to the [`EventRouter`] in the order they arrive.
#[derive(Debug)]
pub struct Client {
    config: Config,
    router: Arc<EventRouter>,
    voice: Arc<VoiceManager>,
    rest: RestClient,
    shards: Vec<(ShardHandle, JoinHandle<()>)>,
    quit: QuitSignal,
}

impl Client {
    /// Creates a client with no running shards.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let quit = QuitSignal::new();

        Self {
            router: Arc::new(EventRouter::new()),
            voice: Arc::new(VoiceManager::new(1, config.clone(), quit.clone())),
            rest: RestClient::new(&config),
            shards: Vec::new(),
            config,
            quit,
        }
    }

    /// Handler registry shared by all shards.
    #[must_use]
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Voice calls, routed over this client's shards.
    #[must_use]
    pub fn voice(&self) -> &Arc<VoiceManager> {
        &self.voice
    }

    /// REST interface authenticated with this client's token.
    #[must_use]
    pub fn rest(&self) -> &RestClient {
        &self.rest
    }

    /// Configuration used for new shards and calls.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The signal raised when some worker gives up.
    #[must_use]
    pub fn quit_signal(&self) -> QuitSignal {
        self.quit.clone()
    }

    /// Handle to a running shard.
    #[must_use]
    pub fn shard(&self, index: u64) -> Option<ShardHandle> {
        self.shards
            .iter()
            .map(|(handle, _)| handle)
            .find(|handle| handle.index() == index)
            .cloned()
    }

    /// Number of shards started.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Starts `shard_count` shards on the default gateway.
    pub fn start(&mut self, shard_count: u64) -> Result<(), StartError> {
        let gateway = Url::parse(GATEWAY_URL)?;
        self.start_with_gateway(gateway, shard_count, 1)
    }

    /// Asks the REST API for the gateway URL and shard count, then starts
    /// that many shards.
    #[instrument(skip(self))]
    pub async fn start_autosharded(&mut self) -> Result<(), StartError> {
        let bot = self.rest.gateway_bot().await?;
        let concurrency = bot
            .session_start_limit
            .map_or(1, |limit| limit.max_concurrency);

        info!(
            "Gateway recommends {} shards at {} (concurrency {}).",
            bot.shards, bot.url, concurrency
        );

        let gateway = Url::parse(&bot.url)?;
        self.start_with_gateway(gateway, bot.shards, concurrency)
    }

    /// Starts `shard_count` shards on `gateway`.
    ///
    /// Identifies are spaced so that at most `concurrency` begin per interval.
    pub fn start_with_gateway(
        &mut self,
        gateway: Url,
        shard_count: u64,
        concurrency: u64,
    ) -> Result<(), StartError> {
        if !self.shards.is_empty() {
            return Err(StartError::AlreadyStarted);
        }

        let shard_count = shard_count.max(1);
        let concurrency = concurrency.max(1);
        self.voice.set_shard_count(shard_count);

        for index in 0..shard_count {
            let (tx, rx) = flume::unbounded();
            let handle = ShardHandle::new(index, tx);
            let runner = ShardRunner::new(
                ShardCore::new(index, shard_count, &self.config),
                gateway.clone(),
                self.config.clone(),
                rx,
                self.router.clone(),
                self.voice.clone(),
                self.quit.clone(),
            );

            let bucket = u32::try_from(index / concurrency).unwrap_or(u32::MAX);
            let stagger = IDENTIFY_INTERVAL.saturating_mul(bucket);
            let task = tokio::spawn(async move {
                if !stagger.is_zero() {
                    sleep(stagger).await;
                }
                runner.run().await;
            });

            self.voice.register_shard(handle.clone());
            self.shards.push((handle, task));
        }

        debug!("Started {} shards.", shard_count);

        Ok(())
    }

    /// Waits until a worker raises the quit signal.
    pub async fn wait_for_quit(&self) {
        self.quit.wait().await;
    }

    /// Leaves all calls, stops every shard, and waits for them to finish.
    ///
    /// Shards which fail to stop within the configured shutdown timeout are
    /// aborted, and the quit signal is raised.
    #[instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        self.voice.clear().await;

        for (handle, _) in &self.shards {
            // Stopped shards have nothing to shut down.
            let _ = handle.shutdown();
        }

        for (handle, task) in self.shards.drain(..) {
            let abort = task.abort_handle();
            if timeout(self.config.shutdown_timeout, task).await.is_err() {
                warn!("Shard {} did not stop in time; aborting.", handle.index());
                abort.abort();
                self.quit.trigger();
            }
            self.voice.deregister_shard(handle.index());
        }

        info!("Client shut down.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::voice::driver::connection::test_util::connector;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn quit_wakes_every_waiter() {
        let quit = QuitSignal::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = quit.clone();
                tokio::spawn(async move { q.wait().await })
            })
            .collect();

        tokio::task::yield_now().await;
        assert!(!quit.is_triggered());
        quit.trigger();

        for w in waiters {
            timeout(Duration::from_secs(1), w).await.unwrap().unwrap();
        }
        // Already raised: returns at once.
        quit.wait().await;
    }

    #[tokio::test]
    async fn shards_register_and_shut_down() {
        let (connector, servers, hosts) = connector();
        let config = Config::new("token")
            .connector(connector)
            .shutdown_timeout(Duration::from_secs(5));
        let mut client = Client::new(config);

        client
            .start_with_gateway(Url::parse("wss://gateway.test:8443").unwrap(), 2, 2)
            .unwrap();
        assert!(matches!(client.start(1), Err(StartError::AlreadyStarted)));
        assert_eq!(client.shard_count(), 2);
        assert!(client.shard(1).is_some());
        assert_eq!(hosts.recv_async().await.unwrap().1, 8443);

        let mut identified = Vec::new();
        for _ in 0..2 {
            let mut server = servers.recv_async().await.unwrap();
            server.accept().await;
            server
                .send_json(&json!({"op": 10, "d": {"heartbeat_interval": 45_000}}))
                .await;
            assert_eq!(server.next_json().await["op"], 2);
            identified.push(server);
        }

        client.shutdown().await;
        assert_eq!(client.shard_count(), 0);
        assert!(!client.quit_signal().is_triggered());
    }

    #[tokio::test]
    async fn stalled_shards_are_aborted_and_raise_quit() {
        let (connector, servers, _hosts) = connector();
        let config = Config::new("token")
            .connector(connector)
            .shutdown_timeout(Duration::from_millis(100));
        let mut client = Client::new(config);

        client
            .start_with_gateway(Url::parse("wss://gateway.test").unwrap(), 1, 1)
            .unwrap();

        // The upgrade is never answered, so the shard cannot see its shutdown.
        let _silent = servers.recv_async().await.unwrap();

        client.shutdown().await;
        assert_eq!(client.shard_count(), 0);
        assert!(client.quit_signal().is_triggered());
    }
}
