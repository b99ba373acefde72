#![allow(missing_docs)]

pub mod error;
pub(crate) mod message;
pub(crate) mod ws;

use super::{
    connection::Connection,
    sender::{self, AudioFrame, PlaybackState},
};
use crate::{
    client::QuitSignal,
    retry::RetryState,
    voice::{ConnectionInfo, DisconnectReason, VoiceEvent},
    Config,
};
use flume::{Receiver, RecvError, Sender};
use message::*;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::{
    spawn,
    time::{sleep, timeout},
};
use tracing::{error, info, instrument, trace, warn};

/// Channels shared by the driver's background tasks.
#[derive(Clone, Debug)]
pub(crate) struct Interconnect {
    pub(crate) core: Sender<CoreMessage>,
    pub(crate) events: Sender<VoiceEvent>,
    pub(crate) sender: Sender<SenderMessage>,
}

/// Handles given to the core task by its [`Driver`].
///
/// [`Driver`]: super::Driver
pub(crate) struct DriverParts {
    pub(crate) rx: Receiver<CoreMessage>,
    pub(crate) tx: Sender<CoreMessage>,
    pub(crate) frames: Receiver<AudioFrame>,
    pub(crate) events: Sender<VoiceEvent>,
    pub(crate) state: Arc<RwLock<PlaybackState>>,
    pub(crate) quit: QuitSignal,
}

pub(crate) fn start(config: Config, parts: DriverParts) {
    spawn(async move {
        trace!("Driver started.");
        runner(config, parts).await;
        trace!("Driver finished.");
    });
}

#[instrument(skip(config, parts))]
async fn runner(mut config: Config, parts: DriverParts) {
    let DriverParts {
        rx,
        tx,
        frames,
        events,
        state,
        quit,
    } = parts;

    let (sender_tx, sender_rx) = flume::unbounded();
    let interconnect = Interconnect {
        core: tx,
        events,
        sender: sender_tx,
    };
    let sender_done = sender::start(
        sender_rx,
        frames.clone(),
        interconnect.clone(),
        state,
        &config,
    );

    let mut connection: Option<Connection> = None;

    loop {
        match rx.recv_async().await {
            Ok(CoreMessage::ConnectWithResult(info, tx)) => {
                if connection.take().is_some() {
                    let _ = interconnect.sender.send(SenderMessage::DropConn);
                }

                connection = match Connection::new(info, &interconnect, &config).await {
                    Ok(connection) => {
                        // Other side may not be listening: this is fine.
                        let _ = tx.send(Ok(()));

                        let _ = interconnect.events.send(VoiceEvent::Connected {
                            ssrc: connection.ssrc,
                        });

                        Some(connection)
                    },
                    Err(why) => {
                        let reason = DisconnectReason::from(&why);

                        // See above.
                        let _ = tx.send(Err(why));
                        let _ = interconnect
                            .events
                            .send(VoiceEvent::Disconnected(reason));

                        None
                    },
                };
            },
            Ok(CoreMessage::Disconnect) => {
                teardown(&mut connection, &interconnect, &frames, None);
            },
            Ok(CoreMessage::SetConfig(mut new_config)) => {
                new_config.make_safe(&config, connection.is_some());
                let _ = interconnect
                    .sender
                    .send(SenderMessage::SetConfig(new_config.clone()));
                config = new_config;
            },
            Ok(CoreMessage::SetPaused(p)) => {
                let _ = interconnect.sender.send(SenderMessage::SetPaused(p));
            },
            Ok(CoreMessage::Mute(m)) => {
                let _ = interconnect.sender.send(SenderMessage::Mute(m));
            },
            Ok(CoreMessage::Reconnect) => {
                if let Some(mut conn) = connection.take() {
                    match conn.reconnect(&config).await {
                        Ok(()) => {
                            connection = Some(conn);
                            let _ = interconnect.events.send(VoiceEvent::Reconnected);
                        },
                        Err(e) => {
                            warn!("Voice resume failed ({}); starting a new session.", e);
                            let info = conn.info.clone();
                            drop(conn);

                            connection =
                                full_reconnect(info, &interconnect, &frames, &config, &quit).await;
                        },
                    }
                }
            },
            Ok(CoreMessage::FullReconnect) => {
                if let Some(conn) = connection.take() {
                    let info = conn.info.clone();
                    drop(conn);

                    connection = full_reconnect(info, &interconnect, &frames, &config, &quit).await;
                }
            },
            Ok(CoreMessage::SignalWsClosure(code)) => {
                info!("Voice session ended by server (code {:?}).", code);
                teardown(
                    &mut connection,
                    &interconnect,
                    &frames,
                    Some(DisconnectReason::WsClosed(code)),
                );
            },
            Err(RecvError::Disconnected) | Ok(CoreMessage::Poison) => {
                break;
            },
        }
    }

    trace!("Main thread exited");
    teardown(&mut connection, &interconnect, &frames, None);
    let _ = interconnect.sender.send(SenderMessage::Poison);

    if timeout(config.shutdown_timeout, sender_done.recv_async())
        .await
        .is_err()
    {
        error!(
            "Audio sender did not stop within {:?}; requesting shutdown.",
            config.shutdown_timeout
        );
        quit.trigger();
    }
}

/// Builds a new session from scratch, backing off between failed attempts.
async fn full_reconnect(
    info: ConnectionInfo,
    interconnect: &Interconnect,
    frames: &Receiver<AudioFrame>,
    config: &Config,
    quit: &QuitSignal,
) -> Option<Connection> {
    let _ = interconnect.sender.send(SenderMessage::DropConn);
    let mut retry = RetryState::default();

    loop {
        match Connection::new(info.clone(), interconnect, config).await {
            Ok(conn) => {
                let _ = interconnect.events.send(VoiceEvent::Reconnected);
                return Some(conn);
            },
            Err(e) => {
                let retryable = e.should_retry();
                let delay = if retryable {
                    retry.next_delay(&config.driver_retry)
                } else {
                    None
                };

                match delay {
                    Some(d) => {
                        info!(
                            "Voice reconnect attempt {} failed ({}); retrying in {:?}.",
                            retry.attempts(),
                            e,
                            d
                        );
                        sleep(d).await;
                    },
                    None => {
                        error!("Catastrophic connection failure. Stopping. {:?}", e);
                        teardown(
                            &mut None,
                            interconnect,
                            frames,
                            Some(DisconnectReason::from(&e)),
                        );

                        if retryable {
                            quit.trigger();
                        }

                        return None;
                    },
                }
            },
        }
    }
}

/// Releases the media transport, and discards anything still queued for it.
///
/// Dropping the [`Connection`] hangs up the control channel.
fn teardown(
    connection: &mut Option<Connection>,
    interconnect: &Interconnect,
    frames: &Receiver<AudioFrame>,
    reason: Option<DisconnectReason>,
) {
    let had_connection = connection.take().is_some();

    let _ = interconnect.sender.send(SenderMessage::DropConn);
    let _ = interconnect.sender.send(SenderMessage::Ws(None));

    let dropped = frames.drain().count();
    if dropped > 0 {
        trace!("Discarded {} queued frames.", dropped);
    }

    if let Some(reason) = reason {
        let _ = interconnect.events.send(VoiceEvent::Disconnected(reason));
    }

    if had_connection || reason.is_some() {
        let _ = interconnect.events.send(VoiceEvent::VoiceEnded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        id::{ChannelId, GuildId, UserId},
        retry::{Retry, Strategy},
        voice::driver::connection::test_util::connector,
    };
    use std::time::Duration;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            channel_id: ChannelId(3),
            endpoint: "voice.test:8443".into(),
            guild_id: GuildId(1),
            session_id: "sess".into(),
            token: "tok".into(),
            user_id: UserId(2),
        }
    }

    fn interconnect() -> (Interconnect, Receiver<VoiceEvent>) {
        let (core, _core_rx) = flume::unbounded();
        let (events, events_rx) = flume::unbounded();
        let (sender, _sender_rx) = flume::unbounded();
        (
            Interconnect {
                core,
                events,
                sender,
            },
            events_rx,
        )
    }

    #[tokio::test]
    async fn exhausted_reconnects_raise_quit() {
        let (connector, servers, _hosts) = connector();
        let config = Config::default()
            .connector(connector)
            .driver_timeout(Some(Duration::from_secs(1)))
            .driver_retry(Retry {
                strategy: Strategy::Every(Duration::from_millis(5)),
                retry_limit: Some(2),
            });
        let (ic, events_rx) = interconnect();
        let (_frames_tx, frames_rx) = flume::unbounded();
        let quit = QuitSignal::new();

        // Every server hangs up before the upgrade completes.
        let refusals = tokio::spawn(async move {
            let mut attempts = 0;
            while let Ok(server) = servers.recv_async().await {
                drop(server);
                attempts += 1;
            }
            attempts
        });

        let conn = full_reconnect(info(), &ic, &frames_rx, &config, &quit).await;
        drop(config);

        assert!(conn.is_none());
        assert!(quit.is_triggered());
        assert_eq!(refusals.await.unwrap(), 3);

        let events: Vec<_> = events_rx.drain().collect();
        assert!(matches!(events[0], VoiceEvent::Disconnected(_)));
        assert_eq!(events[1], VoiceEvent::VoiceEnded);
    }

    #[tokio::test]
    async fn hopeless_reconnect_ends_call_without_quitting() {
        let config = Config::default().driver_retry(Retry::with_limit(Some(5)));
        let (ic, events_rx) = interconnect();
        let (_frames_tx, frames_rx) = flume::unbounded();
        let quit = QuitSignal::new();

        let mut bad = info();
        bad.endpoint = "not a host".into();

        let conn = full_reconnect(bad, &ic, &frames_rx, &config, &quit).await;

        assert!(conn.is_none());
        assert!(!quit.is_triggered());
        assert_eq!(
            events_rx.drain().collect::<Vec<_>>(),
            vec![
                VoiceEvent::Disconnected(DisconnectReason::ProtocolViolation),
                VoiceEvent::VoiceEnded,
            ]
        );
    }

    #[test]
    fn teardown_drains_frames_and_reports() {
        let (core, _core_rx) = flume::unbounded();
        let (events, events_rx) = flume::unbounded();
        let (sender, sender_rx) = flume::unbounded();
        let ic = Interconnect {
            core,
            events,
            sender,
        };
        let (frames_tx, frames_rx) = flume::unbounded();
        for _ in 0..3 {
            frames_tx.send(AudioFrame::skip(UserId(2))).unwrap();
        }

        teardown(
            &mut None,
            &ic,
            &frames_rx,
            Some(DisconnectReason::WsClosed(Some(4014))),
        );

        assert!(frames_rx.is_empty());
        assert!(matches!(sender_rx.try_recv(), Ok(SenderMessage::DropConn)));
        assert!(matches!(sender_rx.try_recv(), Ok(SenderMessage::Ws(None))));
        assert_eq!(
            events_rx.drain().collect::<Vec<_>>(),
            vec![
                VoiceEvent::Disconnected(DisconnectReason::WsClosed(Some(4014))),
                VoiceEvent::VoiceEnded,
            ]
        );
    }
}
