//! Sans-IO shard state machine.
//!
//! [`ShardCore`] never touches a socket or a clock: the runner feeds it decoded
//! payloads and the current [`Instant`], and carries out the [`ShardAction`]s it
//! returns. This keeps heartbeat and resume behaviour testable without time.

use super::session::{ConnectionStage, ShardSession};
use crate::{
    constants::{INVALID_SESSION_MAX_WAIT, INVALID_SESSION_MIN_WAIT},
    model::{Event, GatewayPayload, Hello, Identify, IdentifyProperties, Opcode, Presence, Resume},
    retry::{Retry, RetryState},
    Config,
};
use rand::Rng;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Something the runner must do on behalf of the state machine.
#[derive(Clone, Debug, PartialEq)]
pub enum ShardAction {
    /// Send this payload to the gateway.
    Send(GatewayPayload),
    /// Hand this event to voice handling and the router.
    Dispatch(Event),
    /// Close the socket and connect again.
    Reconnect {
        /// Whether the session survives, so the next connection resumes.
        resumable: bool,
        /// Required wait before reconnecting, beyond the retry backoff.
        delay: Option<Duration>,
    },
    /// Stop this shard: the gateway will not accept it again.
    Fatal(u16),
}

/// Close codes after which reconnecting cannot succeed.
///
/// Authentication failed, invalid shard, sharding required, invalid API
/// version, invalid intents, disallowed intents.
#[must_use]
pub fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

/// Close codes after which the session cannot be resumed.
///
/// Invalid sequence, session timed out.
#[must_use]
pub fn is_session_ending_close(code: u16) -> bool {
    matches!(code, 4007 | 4009)
}

/// State machine for a single shard's gateway connection.
#[derive(Clone, Debug)]
pub struct ShardCore {
    session: ShardSession,
    identify: Identify,
    missed_heartbeat_limit: u32,
    next_heartbeat: Option<Instant>,
    ack_pending: bool,
    missed_acks: u32,
    retry: RetryState,
}

impl ShardCore {
    /// Creates a disconnected shard `index` of `count`.
    #[must_use]
    pub fn new(index: u64, count: u64, config: &Config) -> Self {
        let session = ShardSession::new(index, count);

        Self {
            identify: Identify {
                token: config.token.clone(),
                intents: config.intents,
                properties: IdentifyProperties::default(),
                shard: [session.index, session.count],
                presence: config.presence.clone(),
                large_threshold: config.large_threshold,
            },
            session,
            missed_heartbeat_limit: config.missed_heartbeat_limit.max(1),
            next_heartbeat: None,
            ack_pending: false,
            missed_acks: 0,
            retry: RetryState::default(),
        }
    }

    /// The session this machine maintains.
    #[must_use]
    pub fn session(&self) -> &ShardSession {
        &self.session
    }

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> ConnectionStage {
        self.session.stage
    }

    /// Records the latest presence, so reidentifying restores it.
    pub fn set_presence(&mut self, presence: Presence) {
        self.identify.presence = Some(presence);
    }

    /// Moves to a new stage, logging the transition.
    pub fn set_stage(&mut self, stage: ConnectionStage) {
        if self.session.stage != stage {
            debug!(
                "Shard {}: {:?} -> {:?}.",
                self.session.index, self.session.stage, stage
            );
            self.session.stage = stage;
        }
    }

    /// The socket has been upgraded: wait for hello.
    pub fn on_upgraded(&mut self) {
        self.next_heartbeat = None;
        self.ack_pending = false;
        self.missed_acks = 0;
        self.set_stage(ConnectionStage::CollectingHello);
    }

    /// Builds the payload opening a session: a resume if the previous session
    /// survives, else an identify.
    pub fn begin_session(&mut self) -> GatewayPayload {
        if self.session.can_resume() {
            self.set_stage(ConnectionStage::Resuming);
            info!(
                "Shard {}: resuming session at seq {:?}.",
                self.session.index, self.session.seq
            );

            envelope(
                Opcode::Resume,
                to_data(&Resume {
                    token: self.identify.token.clone(),
                    session_id: self.session.session_id.clone().unwrap_or_default(),
                    seq: self.session.seq,
                }),
            )
        } else {
            self.session.invalidate();
            self.set_stage(ConnectionStage::SendingIdentify);
            info!("Shard {}: identifying.", self.session.index);

            envelope(Opcode::Identify, to_data(&self.identify))
        }
    }

    /// Builds a heartbeat carrying the last sequence number.
    #[must_use]
    pub fn heartbeat(&self) -> GatewayPayload {
        envelope(
            Opcode::Heartbeat,
            self.session.seq.map_or(Value::Null, Value::from),
        )
    }

    /// Processes one payload received from the gateway.
    pub fn on_payload(&mut self, payload: GatewayPayload, now: Instant) -> Vec<ShardAction> {
        let mut actions = Vec::new();

        match payload.opcode() {
            Some(Opcode::Dispatch) => {
                if let Some(seq) = payload.s {
                    self.session.seq = Some(seq);
                }

                if matches!(
                    self.session.stage,
                    ConnectionStage::SendingIdentify | ConnectionStage::Resuming
                ) {
                    self.set_stage(ConnectionStage::Authenticated);
                    self.retry.reset();
                    self.session.attempts = 0;
                }

                let Some(kind) = payload.t else {
                    debug!("Dispatch without an event name.");
                    return actions;
                };

                match Event::from_dispatch(&kind, payload.d) {
                    Ok(event) => {
                        if let Event::Ready(ready) = &event {
                            self.session.session_id = Some(ready.session_id.clone());
                            self.session
                                .resume_gateway_url
                                .clone_from(&ready.resume_gateway_url);
                            self.session.resumable = true;
                            info!(
                                "Shard {}: ready as {}.",
                                self.session.index, ready.user.username
                            );
                        }

                        actions.push(ShardAction::Dispatch(event));
                    },
                    Err(e) => debug!("Malformed {} dispatch dropped: {}.", kind, e),
                }
            },
            Some(Opcode::Heartbeat) => {
                trace!("Heartbeat requested by gateway.");
                self.ack_pending = true;
                actions.push(ShardAction::Send(self.heartbeat()));
            },
            Some(Opcode::Reconnect) => {
                info!("Shard {}: gateway requested reconnect.", self.session.index);
                actions.push(ShardAction::Reconnect {
                    resumable: true,
                    delay: None,
                });
            },
            Some(Opcode::InvalidSession) => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                let wait = rand::thread_rng().gen_range(
                    INVALID_SESSION_MIN_WAIT.as_millis() as u64
                        ..=INVALID_SESSION_MAX_WAIT.as_millis() as u64,
                );

                warn!(
                    "Shard {}: session invalidated (resumable: {}).",
                    self.session.index, resumable
                );
                actions.push(ShardAction::Reconnect {
                    resumable,
                    delay: Some(Duration::from_millis(wait)),
                });
            },
            Some(Opcode::Hello) => match payload.data::<Hello>() {
                Ok(hello) => {
                    let interval = Duration::from_millis(hello.heartbeat_interval.max(1));
                    self.session.heartbeat_interval = Some(interval);
                    self.next_heartbeat = Some(now + interval);
                    self.ack_pending = false;
                    self.missed_acks = 0;
                    debug!("Shard {}: heartbeat every {:?}.", self.session.index, interval);

                    if self.session.stage == ConnectionStage::CollectingHello {
                        actions.push(ShardAction::Send(self.begin_session()));
                    }
                },
                Err(e) => debug!("Malformed hello dropped: {}.", e),
            },
            Some(Opcode::HeartbeatAck) => {
                trace!("Heartbeat ACK received.");
                self.ack_pending = false;
                self.missed_acks = 0;
            },
            _ => debug!("Unexpected gateway opcode {}.", payload.op),
        }

        actions
    }

    /// Sends a heartbeat if one is due, or reports a zombie connection.
    ///
    /// A connection is a zombie once the configured number of consecutive
    /// intervals elapse without an acknowledgement. Detection disarms the
    /// timer, so each zombie yields exactly one reconnect.
    pub fn poll_heartbeat(&mut self, now: Instant) -> Option<ShardAction> {
        let due = self.next_heartbeat?;
        if now < due {
            return None;
        }

        let interval = self.session.heartbeat_interval?;

        if self.ack_pending {
            self.missed_acks += 1;

            if self.missed_acks >= self.missed_heartbeat_limit {
                warn!(
                    "Shard {}: {} heartbeats unacknowledged, reconnecting.",
                    self.session.index, self.missed_acks
                );
                self.next_heartbeat = None;
                return Some(ShardAction::Reconnect {
                    resumable: true,
                    delay: None,
                });
            }
        }

        self.ack_pending = true;
        let next = due + interval;
        self.next_heartbeat = Some(if next <= now { now + interval } else { next });

        Some(ShardAction::Send(self.heartbeat()))
    }

    /// Instant the next heartbeat falls due, if the timer is armed.
    #[must_use]
    pub fn next_heartbeat(&self) -> Option<Instant> {
        self.next_heartbeat
    }

    /// Interprets a close frame from the gateway.
    pub fn on_close(&mut self, code: Option<u16>) -> ShardAction {
        match code {
            Some(code) if is_fatal_close(code) => ShardAction::Fatal(code),
            Some(code) if is_session_ending_close(code) => ShardAction::Reconnect {
                resumable: false,
                delay: None,
            },
            _ => ShardAction::Reconnect {
                resumable: true,
                delay: None,
            },
        }
    }

    /// Tears the connection state down ahead of a new socket.
    pub fn reset_for_reconnect(&mut self, resumable: bool) {
        self.set_stage(ConnectionStage::Disconnected);
        self.next_heartbeat = None;
        self.ack_pending = false;
        self.missed_acks = 0;

        if resumable {
            self.session.resumable = true;
        } else {
            self.session.invalidate();
        }
    }

    /// Counts a reconnect attempt, returning the backoff before it.
    ///
    /// Returns `None` when the attempt budget is exhausted.
    pub fn next_retry(&mut self, policy: &Retry) -> Option<Duration> {
        let delay = self.retry.next_delay(policy);
        self.session.attempts = self.retry.attempts();
        delay
    }
}

fn envelope(op: Opcode, d: Value) -> GatewayPayload {
    GatewayPayload {
        op: op.into(),
        d,
        s: None,
        t: None,
    }
}

fn to_data<T: serde::Serialize>(data: &T) -> Value {
    // Plain structs of strings and integers cannot fail to serialise.
    serde_json::to_value(data).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const INTERVAL: Duration = Duration::from_millis(10);

    fn payload(value: Value) -> GatewayPayload {
        serde_json::from_value(value).unwrap()
    }

    fn hello(ms: u64) -> GatewayPayload {
        payload(json!({"op": 10, "d": {"heartbeat_interval": ms}}))
    }

    fn ack() -> GatewayPayload {
        payload(json!({"op": 11}))
    }

    fn ready(seq: u64) -> GatewayPayload {
        payload(json!({
            "op": 0,
            "s": seq,
            "t": "READY",
            "d": {
                "session_id": "sess-1",
                "resume_gateway_url": "wss://resume.example",
                "user": {"id": "7", "username": "bot", "bot": true},
            },
        }))
    }

    fn dispatch(seq: u64) -> GatewayPayload {
        payload(json!({
            "op": 0,
            "s": seq,
            "t": "GUILD_CREATE",
            "d": {"id": "123", "name": "guild"},
        }))
    }

    fn core() -> ShardCore {
        ShardCore::new(0, 1, &Config::new("token"))
    }

    fn sent_ops(actions: &[ShardAction]) -> Vec<u8> {
        actions
            .iter()
            .filter_map(|a| match a {
                ShardAction::Send(p) => Some(p.op),
                _ => None,
            })
            .collect()
    }

    /// Drives a core through hello, identify and ready.
    fn authenticated(start: Instant) -> ShardCore {
        let mut core = core();
        core.on_upgraded();
        let actions = core.on_payload(hello(INTERVAL.as_millis() as u64), start);
        assert_eq!(sent_ops(&actions), vec![Opcode::Identify as u8]);
        core.on_payload(ready(5), start);
        assert_eq!(core.stage(), ConnectionStage::Authenticated);
        core
    }

    #[test]
    fn hello_sends_identify_without_session() {
        let mut core = core();
        core.on_upgraded();

        let actions = core.on_payload(hello(41_250), Instant::now());
        match &actions[..] {
            [ShardAction::Send(p)] => {
                assert_eq!(p.op, 2);
                assert_eq!(p.d["shard"], json!([0, 1]));
                assert_eq!(p.d["token"], json!("token"));
            },
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(core.stage(), ConnectionStage::SendingIdentify);
    }

    #[test]
    fn heartbeats_follow_interval_and_acks() {
        let start = Instant::now();
        let mut core = authenticated(start);

        assert_eq!(core.poll_heartbeat(start), None);

        let beat = core.poll_heartbeat(start + INTERVAL).unwrap();
        assert_eq!(beat, ShardAction::Send(payload(json!({"op": 1, "d": 5}))));

        core.on_payload(ack(), start + INTERVAL);
        let beat = core.poll_heartbeat(start + INTERVAL * 2).unwrap();
        assert!(matches!(beat, ShardAction::Send(ref p) if p.op == 1));
    }

    #[test]
    fn missed_acks_trigger_exactly_one_reconnect() {
        let start = Instant::now();
        let mut core = authenticated(start);

        // First beat is acknowledged.
        assert!(matches!(
            core.poll_heartbeat(start + INTERVAL),
            Some(ShardAction::Send(_))
        ));
        core.on_payload(ack(), start + INTERVAL);

        // Second beat goes unanswered for two full intervals.
        assert!(matches!(
            core.poll_heartbeat(start + INTERVAL * 2),
            Some(ShardAction::Send(_))
        ));
        assert!(matches!(
            core.poll_heartbeat(start + INTERVAL * 3),
            Some(ShardAction::Send(_))
        ));

        let reconnects: Vec<_> = (4..20)
            .filter_map(|i| core.poll_heartbeat(start + INTERVAL * i))
            .collect();

        assert_eq!(
            reconnects,
            vec![ShardAction::Reconnect {
                resumable: true,
                delay: None,
            }]
        );
    }

    #[test]
    fn resumable_reconnect_keeps_session() {
        let start = Instant::now();
        let mut core = authenticated(start);
        core.on_payload(dispatch(6), start);

        core.reset_for_reconnect(true);
        assert_eq!(core.session().session_id.as_deref(), Some("sess-1"));
        assert_eq!(core.session().seq, Some(6));

        core.on_upgraded();
        let actions = core.on_payload(hello(10), start);
        match &actions[..] {
            [ShardAction::Send(p)] => {
                assert_eq!(p.op, Opcode::Resume as u8);
                assert_eq!(p.d["session_id"], json!("sess-1"));
                assert_eq!(p.d["seq"], json!(6));
            },
            other => panic!("unexpected actions {:?}", other),
        }
        assert_eq!(core.stage(), ConnectionStage::Resuming);
    }

    #[test]
    fn non_resumable_reconnect_clears_session() {
        let start = Instant::now();
        let mut core = authenticated(start);

        core.reset_for_reconnect(false);
        assert_eq!(core.session().session_id, None);
        assert_eq!(core.session().seq, None);
        assert_eq!(core.session().resume_gateway_url, None);
    }

    #[test]
    fn invalid_session_after_long_run_forces_identify() {
        let start = Instant::now();
        let mut core = authenticated(start);
        assert_eq!(core.session().seq, Some(5));

        let actions = core.on_payload(dispatch(6), start);
        assert!(matches!(actions[..], [ShardAction::Dispatch(Event::GuildCreate(_))]));
        assert_eq!(core.session().seq, Some(6));

        let later = start + Duration::from_secs(600);
        let actions = core.on_payload(payload(json!({"op": 9, "d": false})), later);
        let resumable = match &actions[..] {
            [ShardAction::Reconnect {
                resumable,
                delay: Some(delay),
            }] => {
                assert!(*delay >= Duration::from_millis(1000));
                assert!(*delay <= Duration::from_millis(5000));
                *resumable
            },
            other => panic!("unexpected actions {:?}", other),
        };
        assert!(!resumable);

        core.reset_for_reconnect(resumable);
        assert_eq!(core.session().session_id, None);

        core.on_upgraded();
        let actions = core.on_payload(hello(10), later);
        assert_eq!(sent_ops(&actions), vec![Opcode::Identify as u8]);
    }

    #[test]
    fn gateway_reconnect_request_is_resumable() {
        let start = Instant::now();
        let mut core = authenticated(start);

        let actions = core.on_payload(payload(json!({"op": 7, "d": null})), start);
        assert_eq!(
            actions,
            vec![ShardAction::Reconnect {
                resumable: true,
                delay: None,
            }]
        );
    }

    #[test]
    fn requested_heartbeat_is_sent_immediately() {
        let start = Instant::now();
        let mut core = authenticated(start);

        let actions = core.on_payload(payload(json!({"op": 1, "d": null})), start);
        assert_eq!(sent_ops(&actions), vec![1]);
    }

    #[test]
    fn close_codes_are_classified() {
        let mut core = core();
        assert_eq!(core.on_close(Some(4004)), ShardAction::Fatal(4004));
        assert_eq!(core.on_close(Some(4014)), ShardAction::Fatal(4014));
        assert_eq!(
            core.on_close(Some(4009)),
            ShardAction::Reconnect {
                resumable: false,
                delay: None,
            }
        );
        assert_eq!(
            core.on_close(None),
            ShardAction::Reconnect {
                resumable: true,
                delay: None,
            }
        );
    }

    #[test]
    fn retry_budget_is_reset_by_a_session() {
        let start = Instant::now();
        let mut core = core();
        let policy = Retry::with_limit(Some(2));

        assert!(core.next_retry(&policy).is_some());
        assert!(core.next_retry(&policy).is_some());
        assert_eq!(core.session().attempts, 2);
        assert_eq!(core.next_retry(&policy), None);

        core.on_upgraded();
        core.on_payload(hello(10), start);
        core.on_payload(ready(1), start);
        assert_eq!(core.session().attempts, 0);
        assert!(core.next_retry(&policy).is_some());
    }
}
