//! Async task carrying out a [`ShardCore`]'s decisions on a real socket.

use super::{ConnectionStage, ShardAction, ShardCore, ShardRunnerMessage};
use crate::{
    client::QuitSignal,
    constants::{RESUMABLE_CLOSE, WSS_PORT},
    events::{EventContext, EventRouter},
    model::{GatewayPayload, Opcode},
    retry::Retry,
    transport::StreamSocket,
    voice::VoiceManager,
    ws::{self, WsStream, NORMAL_CLOSE},
    Config,
};
use flume::{Receiver, TryRecvError};
use std::{sync::Arc, time::Duration};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

/// Why one websocket session ended.
#[derive(Debug, PartialEq)]
enum Exit {
    Reconnect {
        resumable: bool,
        delay: Option<Duration>,
    },
    Fatal(u16),
    Shutdown,
}

pub(crate) struct ShardRunner {
    core: ShardCore,
    gateway: Url,
    config: Config,
    rx: Receiver<ShardRunnerMessage>,
    router: Arc<EventRouter>,
    voice: Arc<VoiceManager>,
    quit: QuitSignal,
}

impl ShardRunner {
    pub(crate) fn new(
        core: ShardCore,
        gateway: Url,
        config: Config,
        rx: Receiver<ShardRunnerMessage>,
        router: Arc<EventRouter>,
        voice: Arc<VoiceManager>,
        quit: QuitSignal,
    ) -> Self {
        Self {
            core,
            gateway,
            config,
            rx,
            router,
            voice,
            quit,
        }
    }

    fn index(&self) -> u64 {
        self.core.session().index
    }

    /// Connects, runs sessions, and reconnects until shut down or out of attempts.
    #[instrument(skip(self), fields(shard = self.index()))]
    pub(crate) async fn run(mut self) {
        info!("Shard runner started.");

        loop {
            if self.quit.is_triggered() {
                debug!("Quit signalled, stopping.");
                break;
            }

            let exit = match self.connect().await {
                Ok(ws) => self.session(ws).await,
                Err(e) => {
                    warn!("Gateway connection failed: {}.", e);
                    Exit::Reconnect {
                        resumable: self.core.session().resumable,
                        delay: None,
                    }
                },
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Fatal(code) => {
                    error!("Gateway refused this shard with close code {}; stopping.", code);
                    break;
                },
                Exit::Reconnect { resumable, delay } => {
                    self.core.reset_for_reconnect(resumable);

                    if let Some(delay) = delay {
                        sleep(delay).await;
                    }

                    if !self.backoff().await {
                        break;
                    }
                },
            }
        }

        self.core.set_stage(ConnectionStage::Disconnected);
        self.voice.deregister_shard(self.index());
        info!("Shard runner stopped.");
    }

    /// Waits out the retry backoff. Returns `false` once attempts are exhausted,
    /// having raised the quit signal.
    async fn backoff(&mut self) -> bool {
        let policy = Retry::with_limit(Some(self.config.max_reconnect_attempts));

        match self.core.next_retry(&policy) {
            Some(wait) => {
                info!(
                    "Reconnecting in {:?} (attempt {}).",
                    wait,
                    self.core.session().attempts
                );
                sleep(wait).await;
                true
            },
            None => {
                error!(
                    "Gave up after {} reconnect attempts; signalling shutdown.",
                    self.config.max_reconnect_attempts
                );
                self.quit.trigger();
                false
            },
        }
    }

    /// Where the next socket should go: the session's resume URL if it is
    /// resuming, else the discovered gateway.
    fn target(&self) -> Url {
        let session = self.core.session();

        if session.can_resume() {
            if let Some(raw) = &session.resume_gateway_url {
                match Url::parse(raw) {
                    Ok(url) => return url,
                    Err(e) => debug!("Ignoring unusable resume URL {:?}: {}.", raw, e),
                }
            }
        }

        self.gateway.clone()
    }

    async fn connect(&mut self) -> ws::Result<WsStream> {
        let url = self.target();
        let host = url.host_str().unwrap_or_default().to_owned();
        let port = url.port().unwrap_or(WSS_PORT);
        let path = format!(
            "/?v={}&encoding={}",
            self.config.gateway_version,
            self.config.encoding.as_str()
        );
        let settings = self.config.gateway_ws();

        self.core.set_stage(ConnectionStage::Connecting);
        let socket = timeout(
            settings.handshake_timeout,
            StreamSocket::connect(&*self.config.connector, &host, port),
        )
        .await
        .map_err(|_| ws::Error::TimedOut)??;

        self.core.set_stage(ConnectionStage::Upgrading);
        WsStream::upgrade(socket, &host, &path, settings).await
    }

    /// Drives one websocket until it must be replaced, then closes it.
    async fn session(&mut self, mut ws: WsStream) -> Exit {
        self.core.on_upgraded();

        let exit = loop {
            if let Some(action) = self.core.poll_heartbeat(Instant::now().into_std()) {
                if let Some(exit) = self.act(&mut ws, action).await {
                    break exit;
                }
            }

            if let Some(exit) = self.handle_commands(&mut ws).await {
                break exit;
            }

            match ws.recv::<GatewayPayload>().await {
                Ok(Some(payload)) => {
                    let actions = self.core.on_payload(payload, Instant::now().into_std());
                    if let Some(exit) = self.act_all(&mut ws, actions).await {
                        break exit;
                    }
                },
                Ok(None) => {},
                Err(e) if e.is_recoverable() => debug!("Dropped inbound message: {}.", e),
                Err(e) => {
                    warn!("Gateway connection lost: {}.", e);
                    break match self.core.on_close(e.close_code()) {
                        ShardAction::Fatal(code) => Exit::Fatal(code),
                        ShardAction::Reconnect { resumable, delay } =>
                            Exit::Reconnect { resumable, delay },
                        _ => Exit::Reconnect {
                            resumable: true,
                            delay: None,
                        },
                    };
                },
            }
        };

        let code = match exit {
            Exit::Reconnect {
                resumable: true, ..
            } => RESUMABLE_CLOSE,
            _ => NORMAL_CLOSE,
        };
        if let Err(e) = ws.close(code).await {
            debug!("Error while closing gateway socket: {}.", e);
        }

        exit
    }

    async fn handle_commands(&mut self, ws: &mut WsStream) -> Option<Exit> {
        loop {
            let msg = match self.rx.try_recv() {
                Ok(msg) => msg,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => return Some(Exit::Shutdown),
            };

            match msg {
                ShardRunnerMessage::Send(payload) => {
                    if let Some(exit) = self.send(ws, &payload).await {
                        return Some(exit);
                    }
                },
                ShardRunnerMessage::SetPresence(presence) => {
                    self.core.set_presence(presence.clone());

                    match GatewayPayload::new(Opcode::PresenceUpdate, &presence) {
                        Ok(payload) =>
                            if let Some(exit) = self.send(ws, &payload).await {
                                return Some(exit);
                            },
                        Err(e) => warn!("Presence could not be encoded: {}.", e),
                    }
                },
                ShardRunnerMessage::Reconnect => {
                    info!("Reconnect requested.");
                    return Some(Exit::Reconnect {
                        resumable: true,
                        delay: None,
                    });
                },
                ShardRunnerMessage::Shutdown => return Some(Exit::Shutdown),
            }
        }
    }

    async fn act_all(&mut self, ws: &mut WsStream, actions: Vec<ShardAction>) -> Option<Exit> {
        for action in actions {
            if let Some(exit) = self.act(ws, action).await {
                return Some(exit);
            }
        }

        None
    }

    async fn act(&mut self, ws: &mut WsStream, action: ShardAction) -> Option<Exit> {
        match action {
            ShardAction::Send(payload) => self.send(ws, &payload).await,
            ShardAction::Dispatch(event) => {
                self.voice.process(&event).await;
                self.router
                    .dispatch(&EventContext::new(self.index()), &event);
                None
            },
            ShardAction::Reconnect { resumable, delay } =>
                Some(Exit::Reconnect { resumable, delay }),
            ShardAction::Fatal(code) => Some(Exit::Fatal(code)),
        }
    }

    async fn send(&mut self, ws: &mut WsStream, payload: &GatewayPayload) -> Option<Exit> {
        match ws.send(payload).await {
            Ok(()) => None,
            Err(e) if e.is_recoverable() => {
                warn!("Dropped outbound op {}: {}.", payload.op, e);
                None
            },
            Err(e) => {
                warn!("Gateway send failed: {}.", e);
                Some(Exit::Reconnect {
                    resumable: true,
                    delay: None,
                })
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::UserId,
        model::{Event, EventType},
        shard::ShardHandle,
        voice::driver::connection::test_util::connector,
    };
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn runner(
        config: Config,
    ) -> (ShardRunner, ShardHandle, Arc<EventRouter>, Arc<VoiceManager>, QuitSignal) {
        let (tx, rx) = flume::unbounded();
        let quit = QuitSignal::new();
        let router = Arc::new(EventRouter::new());
        let voice = Arc::new(VoiceManager::new(1, config.clone(), quit.clone()));
        let runner = ShardRunner::new(
            ShardCore::new(0, 1, &config),
            Url::parse("wss://gateway.test").unwrap(),
            config,
            rx,
            router.clone(),
            voice.clone(),
            quit.clone(),
        );

        (runner, ShardHandle::new(0, tx), router, voice, quit)
    }

    #[tokio::test]
    async fn identifies_and_dispatches_ready() {
        let (connector, servers, hosts) = connector();
        let config = Config::new("token").connector(connector);
        let (runner, handle, router, voice, _quit) = runner(config);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        router.register(EventType::Ready, move |_: &EventContext, _: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let task = tokio::spawn(runner.run());

        let mut server = servers.recv_async().await.unwrap();
        assert_eq!(
            hosts.recv_async().await.unwrap(),
            ("gateway.test".to_owned(), 443)
        );
        server.accept().await;
        server
            .send_json(&json!({"op": 10, "d": {"heartbeat_interval": 45_000}}))
            .await;

        let identify = server.next_json().await;
        assert_eq!(identify["op"], 2);
        assert_eq!(identify["d"]["token"], "token");
        assert_eq!(identify["d"]["shard"], json!([0, 1]));

        server
            .send_json(&json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {
                    "session_id": "sess",
                    "resume_gateway_url": "wss://resume.test",
                    "user": {"id": "7", "username": "bot", "bot": true},
                },
            }))
            .await;

        while voice.user_id().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().unwrap();
        let close = server.next_frame().await;
        assert_eq!(close.close_code, Some(NORMAL_CLOSE));
        task.await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(voice.user_id(), Some(UserId(7)));
    }

    #[tokio::test]
    async fn requested_reconnect_resumes_on_the_resume_url() {
        let (connector, servers, hosts) = connector();
        let config = Config::new("token").connector(connector);
        let (runner, handle, _router, _voice, quit) = runner(config);

        let task = tokio::spawn(runner.run());

        let mut server = servers.recv_async().await.unwrap();
        assert_eq!(hosts.recv_async().await.unwrap().0, "gateway.test");
        server.accept().await;
        server
            .send_json(&json!({"op": 10, "d": {"heartbeat_interval": 45_000}}))
            .await;
        assert_eq!(server.next_json().await["op"], 2);

        server
            .send_json(&json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {
                    "session_id": "sess",
                    "resume_gateway_url": "wss://resume.test:9443",
                    "user": {"id": "7", "username": "bot", "bot": true},
                },
            }))
            .await;
        server
            .send_json(&json!({"op": 0, "s": 2, "t": "TYPING_START", "d": {}}))
            .await;
        server.send_json(&json!({"op": 7, "d": null})).await;

        let close = server.next_frame().await;
        assert_eq!(close.close_code, Some(RESUMABLE_CLOSE));

        let mut resumed = servers.recv_async().await.unwrap();
        assert_eq!(
            hosts.recv_async().await.unwrap(),
            ("resume.test".to_owned(), 9443)
        );
        resumed.accept().await;
        resumed
            .send_json(&json!({"op": 10, "d": {"heartbeat_interval": 45_000}}))
            .await;

        let resume = resumed.next_json().await;
        assert_eq!(resume["op"], 6);
        assert_eq!(resume["d"]["token"], "token");
        assert_eq!(resume["d"]["session_id"], "sess");
        assert_eq!(resume["d"]["seq"], 2);

        handle.shutdown().unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!quit.is_triggered());
    }

    #[tokio::test]
    async fn fatal_close_stops_without_retrying() {
        let (connector, servers, _hosts) = connector();
        let config = Config::new("bad-token").connector(connector);
        let (runner, _handle, _router, _voice, quit) = runner(config);

        let task = tokio::spawn(runner.run());

        let mut server = servers.recv_async().await.unwrap();
        server.accept().await;
        server
            .send_raw(&crate::frame::encode_close(4004, None))
            .await;

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(servers.is_empty());
        assert!(!quit.is_triggered());
    }

    #[tokio::test]
    async fn exhausted_reconnects_raise_quit() {
        let (connector, servers, _hosts) = connector();
        let config = Config::new("token")
            .connector(connector)
            .max_reconnect_attempts(0);
        let (runner, _handle, _router, _voice, quit) = runner(config);

        // Nobody answers the upgrade: hanging up fails the attempt.
        let task = tokio::spawn(runner.run());
        drop(servers.recv_async().await.unwrap());

        tokio::time::timeout(Duration::from_secs(15), task)
            .await
            .unwrap()
            .unwrap();
        assert!(quit.is_triggered());
    }
}
