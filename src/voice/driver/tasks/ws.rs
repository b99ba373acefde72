use super::{super::connection::is_session_ending_close, message::*, Interconnect};
use crate::{
    model::voice::{Event as VoiceGatewayEvent, Speaking},
    voice::ConnectionInfo,
    ws::{Error as WsError, WsStream, NORMAL_CLOSE},
};
use flume::Receiver;
use rand::random;
use std::time::Duration;
use tokio::{
    select,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, instrument, trace, warn};

/// Speaking flag for ordinary microphone audio.
const MICROPHONE: u8 = 1;

pub(crate) struct AuxNetwork {
    rx: Receiver<WsMessage>,
    ws_client: WsStream,
    dont_send: bool,

    ssrc: u32,
    heartbeat_interval: Duration,

    speaking: bool,
    last_heartbeat_nonce: Option<u64>,
    missed_acks: u32,
    missed_heartbeat_limit: u32,

    info: ConnectionInfo,
}

impl AuxNetwork {
    pub(crate) fn new(
        evt_rx: Receiver<WsMessage>,
        ws_client: WsStream,
        ssrc: u32,
        heartbeat_interval: f64,
        missed_heartbeat_limit: u32,
        info: ConnectionInfo,
    ) -> Self {
        Self {
            rx: evt_rx,
            ws_client,
            dont_send: false,

            ssrc,
            heartbeat_interval: Duration::from_secs_f64(heartbeat_interval / 1000.0),

            speaking: false,
            last_heartbeat_nonce: None,
            missed_acks: 0,
            missed_heartbeat_limit: missed_heartbeat_limit.max(1),

            info,
        }
    }

    #[instrument(skip(self, interconnect), fields(guild = %self.info.guild_id))]
    async fn run(&mut self, interconnect: &Interconnect) {
        let mut next_heartbeat = self.next_heartbeat();

        loop {
            let mut ws_error = false;
            let mut should_reconnect = false;
            let mut ws_reason = None;

            let hb = sleep_until(next_heartbeat);

            select! {
                () = hb, if !self.dont_send => {
                    if self.is_zombie() {
                        warn!(
                            "Voice heartbeat unacknowledged for {} intervals; reconnecting.",
                            self.missed_acks
                        );
                        ws_error = true;
                        should_reconnect = true;
                    } else if let Err(e) = self.send_heartbeat().await {
                        should_reconnect = ws_error_is_not_final(&e);
                        ws_reason = e.close_code();
                        ws_error = true;
                    }

                    next_heartbeat = self.next_heartbeat();
                }
                ws_msg = self.ws_client.recv::<VoiceGatewayEvent>(), if !self.dont_send => {
                    match ws_msg {
                        Err(e) => {
                            should_reconnect = ws_error_is_not_final(&e);
                            ws_reason = e.close_code();
                            ws_error = true;
                        },
                        Ok(Some(msg)) => self.process_ws(msg),
                        Ok(None) => {},
                    }
                }
                inner_msg = self.rx.recv_async() => {
                    match inner_msg {
                        Ok(WsMessage::Ws(data)) => {
                            self.ws_client = *data;
                            self.last_heartbeat_nonce = None;
                            self.missed_acks = 0;
                            self.dont_send = false;
                            next_heartbeat = self.next_heartbeat();
                        },
                        Ok(WsMessage::SetKeepalive(keepalive)) => {
                            self.heartbeat_interval = Duration::from_secs_f64(keepalive / 1000.0);
                            next_heartbeat = self.next_heartbeat();
                        },
                        Ok(WsMessage::Speaking(is_speaking)) => {
                            if self.speaking != is_speaking && !self.dont_send {
                                self.speaking = is_speaking;
                                info!("Changing speaking state to {}.", is_speaking);

                                let ssu_status = self.ws_client
                                    .send(&VoiceGatewayEvent::from(Speaking {
                                        speaking: if is_speaking { MICROPHONE } else { 0 },
                                        delay: 0,
                                        ssrc: self.ssrc,
                                        user_id: None,
                                    }))
                                    .await;

                                if let Err(e) = ssu_status {
                                    should_reconnect = ws_error_is_not_final(&e);
                                    ws_reason = e.close_code();
                                    ws_error = true;
                                }
                            }
                        },
                        Err(flume::RecvError::Disconnected) => {
                            break;
                        },
                    }
                }
            }

            if ws_error {
                self.dont_send = true;

                if should_reconnect {
                    drop(interconnect.core.send(CoreMessage::Reconnect));
                } else {
                    drop(interconnect.core.send(CoreMessage::SignalWsClosure(ws_reason)));
                    break;
                }
            }
        }

        if !self.dont_send {
            if let Err(e) = self.ws_client.close(NORMAL_CLOSE).await {
                debug!("Voice websocket did not close cleanly: {}.", e);
            }
        }
    }

    fn next_heartbeat(&self) -> Instant {
        Instant::now() + self.heartbeat_interval
    }

    fn is_zombie(&mut self) -> bool {
        if self.last_heartbeat_nonce.is_some() {
            self.missed_acks += 1;
        }

        self.missed_acks >= self.missed_heartbeat_limit
    }

    async fn send_heartbeat(&mut self) -> Result<(), WsError> {
        let nonce = random::<u64>();
        self.last_heartbeat_nonce = Some(nonce);

        trace!("Sent heartbeat {}.", nonce);

        self.ws_client
            .send(&VoiceGatewayEvent::Heartbeat(nonce))
            .await
    }

    fn process_ws(&mut self, value: VoiceGatewayEvent) {
        match value {
            VoiceGatewayEvent::HeartbeatAck(ack) => {
                if let Some(nonce) = self.last_heartbeat_nonce.take() {
                    if ack == nonce {
                        trace!("Heartbeat ACK received.");
                    } else {
                        warn!("Heartbeat nonce mismatch! Expected {}, saw {}.", nonce, ack);
                    }
                }
                self.missed_acks = 0;
            },
            VoiceGatewayEvent::Speaking(ev) => {
                trace!("Peer speaking state: {:?}", ev);
            },
            other => {
                trace!("Received other websocket data: {:?}", other);
            },
        }
    }
}

#[instrument(skip(interconnect, aux))]
pub(crate) async fn runner(interconnect: Interconnect, mut aux: AuxNetwork) {
    trace!("WS thread started.");
    aux.run(&interconnect).await;
    trace!("WS thread finished.");
}

fn ws_error_is_not_final(err: &WsError) -> bool {
    match err {
        WsError::WsClosed(Some(code)) => !is_session_ending_close(*code),
        e => {
            debug!("Error sending/receiving ws {:?}.", e);
            true
        },
    }
}
