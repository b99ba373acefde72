//! The voice handshake: control channel, IP discovery, protocol selection.

pub mod error;

use super::{
    crypto::{Cipher, CryptoMode},
    discovery,
    sender::{PacketBuilder, SenderConnection},
    tasks::{
        message::*,
        ws::{self as ws_task, AuxNetwork},
        Interconnect,
    },
};
use crate::{
    constants::{IP_DISCOVERY_ATTEMPTS, IP_DISCOVERY_LEN, IP_DISCOVERY_RESEND, WSS_PORT},
    model::voice::{
        Event as VoiceGatewayEvent,
        Hello,
        Identify,
        ProtocolData,
        Ready,
        Resume,
        SelectProtocol,
    },
    transport::{DatagramSocket, StreamSocket},
    voice::ConnectionInfo,
    ws::WsStream,
    Config,
};
use crypto_secretbox::KeyInit;
use error::{Error, Result};
use flume::Sender;
use std::{future::Future, net::SocketAddr};
use tokio::{spawn, time::timeout};
use tracing::{debug, info, instrument};
use url::Url;

/// Voice close codes after which the session cannot be resumed.
///
/// Authentication failed, session no longer valid, session timed out,
/// disconnected (kicked, moved, or channel deleted).
#[must_use]
pub fn is_session_ending_close(code: u16) -> bool {
    matches!(code, 4004 | 4006 | 4009 | 4014)
}

pub(crate) struct Connection {
    pub(crate) info: ConnectionInfo,
    pub(crate) ssrc: u32,
    pub(crate) ws: Sender<WsMessage>,
}

impl Connection {
    pub(crate) async fn new(
        info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
    ) -> Result<Connection> {
        with_timeout(
            config,
            Connection::new_inner(info, interconnect, config),
        )
        .await
    }

    #[instrument(skip(interconnect, config))]
    async fn new_inner(
        info: ConnectionInfo,
        interconnect: &Interconnect,
        config: &Config,
    ) -> Result<Connection> {
        let mut client = open_ws(&info.endpoint, config).await?;

        client
            .send(&VoiceGatewayEvent::from(Identify {
                server_id: info.guild_id,
                user_id: info.user_id,
                session_id: info.session_id.clone(),
                token: info.token.clone(),
            }))
            .await?;

        let mut hello = None;
        let mut ready = None;

        let (hello, ready) = loop {
            match client.recv_next().await? {
                VoiceGatewayEvent::Ready(r) => ready = Some(r),
                VoiceGatewayEvent::Hello(h) => hello = Some(h),
                other => debug!("Expected ready/hello; got: {:?}", other),
            }

            if let (Some(h), Some(r)) = (hello.as_ref(), ready.as_ref()) {
                break (h.clone(), r.clone());
            }
        };

        if !has_valid_mode(&ready.modes, config.crypto_mode) {
            return Err(Error::CryptoModeUnavailable);
        }

        let udp = discover_and_select(&mut client, &ready, config.crypto_mode).await?;
        let cipher = init_cipher(&mut client, config.crypto_mode).await?;

        info!("Connected to: {}", info.endpoint);
        info!("WS heartbeat duration {}ms.", hello.heartbeat_interval);

        let (ws_msg_tx, ws_msg_rx) = flume::unbounded();

        interconnect
            .sender
            .send(SenderMessage::Ws(Some(ws_msg_tx.clone())))?;
        interconnect.sender.send(SenderMessage::SetConn(SenderConnection {
            udp: udp.into_std()?,
            builder: PacketBuilder::new(ready.ssrc, config.crypto_mode, cipher),
        }))?;

        let ws_state = AuxNetwork::new(
            ws_msg_rx,
            client,
            ready.ssrc,
            hello.heartbeat_interval,
            config.missed_heartbeat_limit,
            info.clone(),
        );

        spawn(ws_task::runner(interconnect.clone(), ws_state));

        Ok(Connection {
            info,
            ssrc: ready.ssrc,
            ws: ws_msg_tx,
        })
    }

    /// Resumes the control channel, keeping the media transport.
    pub(crate) async fn reconnect(&mut self, config: &Config) -> Result<()> {
        with_timeout(config, self.reconnect_inner(config)).await
    }

    #[instrument(skip(self, config))]
    async fn reconnect_inner(&mut self, config: &Config) -> Result<()> {
        let mut client = open_ws(&self.info.endpoint, config).await?;

        client
            .send(&VoiceGatewayEvent::from(Resume {
                server_id: self.info.guild_id,
                session_id: self.info.session_id.clone(),
                token: self.info.token.clone(),
            }))
            .await?;

        let mut hello: Option<Hello> = None;
        let mut resumed = false;

        let hello = loop {
            match client.recv_next().await? {
                VoiceGatewayEvent::Resumed => resumed = true,
                VoiceGatewayEvent::Hello(h) => hello = Some(h),
                other => debug!("Expected resumed/hello; got: {:?}", other),
            }

            if let (Some(h), true) = (hello.as_ref(), resumed) {
                break h.clone();
            }
        };

        self.ws
            .send(WsMessage::SetKeepalive(hello.heartbeat_interval))?;
        self.ws.send(WsMessage::Ws(Box::new(client)))?;

        info!("Reconnected to: {}", &self.info.endpoint);
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        info!("Disconnected from {}.", self.info.endpoint);
    }
}

async fn with_timeout<T>(config: &Config, fut: impl Future<Output = Result<T>>) -> Result<T> {
    if let Some(t) = config.driver_timeout {
        timeout(t, fut).await?
    } else {
        fut.await
    }
}

async fn open_ws(endpoint: &str, config: &Config) -> Result<WsStream> {
    let url = generate_url(endpoint, config.voice_gateway_version)?;
    let host = url.host_str().ok_or(Error::EndpointUrl)?;
    let port = url.port().unwrap_or(WSS_PORT);
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_owned(),
    };

    let socket = StreamSocket::connect(&*config.connector, host, port).await?;
    Ok(WsStream::upgrade(socket, host, &path, config.voice_ws()).await?)
}

fn generate_url(endpoint: &str, version: u8) -> Result<Url> {
    // Discord hands out ":80" endpoints which are only reachable over TLS on 443.
    let endpoint = endpoint.strip_suffix(":80").unwrap_or(endpoint);

    Url::parse(&format!("wss://{}/?v={}", endpoint, version)).or(Err(Error::EndpointUrl))
}

async fn discover_and_select(
    client: &mut WsStream,
    ready: &Ready,
    mode: CryptoMode,
) -> Result<DatagramSocket> {
    let udp = DatagramSocket::connect(&ready.ip.to_string(), ready.port).await?;

    // Follow Discord's IP Discovery procedures, in case NAT tunnelling is needed.
    let external = discover(&udp, ready.ssrc).await?;
    debug!("External address is {}.", external);

    client
        .send(&VoiceGatewayEvent::from(SelectProtocol {
            protocol: "udp".into(),
            data: ProtocolData {
                address: external.ip(),
                port: external.port(),
                mode: mode.to_request_str().into(),
            },
        }))
        .await?;

    Ok(udp)
}

/// Asks the voice server for our external address, resending the request
/// while replies go missing.
async fn discover(udp: &DatagramSocket, ssrc: u32) -> Result<SocketAddr> {
    let request = discovery::request(ssrc);
    let mut bytes = [0u8; IP_DISCOVERY_LEN];

    for attempt in 1..=IP_DISCOVERY_ATTEMPTS {
        udp.write(&request).await?;

        if let Some(len) = udp.read(&mut bytes, IP_DISCOVERY_RESEND).await? {
            return discovery::parse_response(&bytes[..len]);
        }

        debug!("No IP discovery reply after attempt {}.", attempt);
    }

    Err(Error::TimedOut)
}

async fn init_cipher(client: &mut WsStream, mode: CryptoMode) -> Result<Cipher> {
    loop {
        match client.recv_next().await? {
            VoiceGatewayEvent::SessionDescription(desc) => {
                if desc.mode != mode.to_request_str() {
                    return Err(Error::CryptoModeInvalid);
                }

                return Ok(Cipher::new_from_slice(&desc.secret_key)?);
            },
            other => {
                debug!("Expected ready for key; got: op{}/v{:?}", other.op(), other);
            },
        }
    }
}

fn has_valid_mode<T, It>(modes: It, mode: CryptoMode) -> bool
where
    T: AsRef<str>,
    It: IntoIterator<Item = T>,
{
    modes.into_iter().any(|s| s.as_ref() == mode.to_request_str())
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::{
        constants::IP_DISCOVERY_BODY_LEN,
        transport::{AsyncStream, Connector},
        voice::driver::crypto::KEY_SIZE,
        ws::test_util::FakeServer,
    };
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::io::Result as IoResult;
    use tokio::net::UdpSocket;

    /// Hands out one end of an in-memory stream per connection, passing the
    /// other end to the test.
    pub(crate) struct DuplexConnector {
        pub(crate) servers: flume::Sender<FakeServer>,
        pub(crate) hosts: flume::Sender<(String, u16)>,
    }

    #[async_trait]
    impl Connector for DuplexConnector {
        async fn connect(&self, host: &str, port: u16) -> IoResult<Box<dyn AsyncStream>> {
            let (near, far) = tokio::io::duplex(1 << 16);
            drop(self.hosts.send((host.to_owned(), port)));
            drop(self.servers.send(FakeServer::new(far)));
            Ok(Box::new(near))
        }
    }

    pub(crate) fn connector() -> (
        DuplexConnector,
        flume::Receiver<FakeServer>,
        flume::Receiver<(String, u16)>,
    ) {
        let (servers, server_rx) = flume::unbounded();
        let (hosts, host_rx) = flume::unbounded();
        (DuplexConnector { servers, hosts }, server_rx, host_rx)
    }

    pub(crate) async fn discovery_server() -> (UdpSocket, u16) {
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = udp.local_addr().unwrap().port();
        (udp, port)
    }

    /// Answers a single IP discovery request, claiming the client is at 203.0.113.9:4321.
    pub(crate) async fn answer_discovery(udp: &UdpSocket) {
        let mut buf = [0u8; IP_DISCOVERY_LEN];
        let (len, from) = udp.recv_from(&mut buf).await.unwrap();
        assert_eq!(len, IP_DISCOVERY_LEN);
        assert_eq!(&buf[..2], &[0, 1]);

        let mut reply = [0u8; IP_DISCOVERY_LEN];
        reply[..2].copy_from_slice(&[0, 2]);
        reply[2..4].copy_from_slice(&IP_DISCOVERY_BODY_LEN.to_be_bytes());
        reply[4..8].copy_from_slice(&buf[4..8]);
        reply[8..19].copy_from_slice(b"203.0.113.9");
        reply[72..].copy_from_slice(&4321u16.to_be_bytes());
        udp.send_to(&reply, from).await.unwrap();
    }

    /// Plays the server side of a full voice handshake.
    pub(crate) async fn serve_handshake(server: &mut FakeServer, udp: &UdpSocket, udp_port: u16) {
        serve_lossy_handshake(server, udp, udp_port, 0).await;
    }

    /// As [`serve_handshake`], ignoring the first `lost` discovery requests.
    pub(crate) async fn serve_lossy_handshake(
        server: &mut FakeServer,
        udp: &UdpSocket,
        udp_port: u16,
        lost: usize,
    ) {
        server.accept().await;

        let identify = server.next_json().await;
        assert_eq!(identify["op"], 0);

        server
            .send_json(&json!({"op": 8, "d": {"heartbeat_interval": 41250.0}}))
            .await;
        server
            .send_json(&json!({"op": 2, "d": {
                "ssrc": 99,
                "ip": "127.0.0.1",
                "port": udp_port,
                "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_lite"],
            }}))
            .await;

        let mut buf = [0u8; IP_DISCOVERY_LEN];
        for _ in 0..lost {
            udp.recv_from(&mut buf).await.unwrap();
        }
        answer_discovery(udp).await;

        let select: Value = server.next_json().await;
        assert_eq!(select["op"], 1);
        assert_eq!(select["d"]["data"]["address"], "203.0.113.9");
        assert_eq!(select["d"]["data"]["port"], 4321);

        server
            .send_json(&json!({"op": 4, "d": {
                "mode": select["d"]["data"]["mode"],
                "secret_key": vec![1u8; KEY_SIZE],
            }}))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::{test_util::*, *};
    use crate::id::{ChannelId, GuildId, UserId};
    use serde_json::json;
    use std::time::Duration;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            channel_id: ChannelId(3),
            endpoint: "voice.test:80".into(),
            guild_id: GuildId(1),
            session_id: "sess".into(),
            token: "tok".into(),
            user_id: UserId(2),
        }
    }

    #[test]
    fn endpoint_port_80_is_dropped() {
        let url = generate_url("voice.test:80", 4).unwrap();
        assert_eq!(url.host_str(), Some("voice.test"));
        assert_eq!(url.port(), None);
        assert_eq!(url.query(), Some("v=4"));

        let url = generate_url("voice.test:8443", 4).unwrap();
        assert_eq!(url.port(), Some(8443));
    }

    #[test]
    fn session_ending_closes() {
        for code in [4004, 4006, 4009, 4014] {
            assert!(is_session_ending_close(code));
        }
        for code in [1000, 1006, 4015, 4005] {
            assert!(!is_session_ending_close(code));
        }
    }

    #[test]
    fn offered_modes_are_checked() {
        assert!(has_valid_mode(["xsalsa20_poly1305"], CryptoMode::Normal));
        assert!(!has_valid_mode(vec!["xsalsa20_poly1305".to_owned()], CryptoMode::Lite));
    }

    fn interconnect() -> (
        Interconnect,
        flume::Receiver<SenderMessage>,
        flume::Receiver<CoreMessage>,
    ) {
        let (core, core_rx) = flume::unbounded();
        let (events, _events_rx) = flume::unbounded();
        let (sender, sender_rx) = flume::unbounded();
        (
            Interconnect {
                core,
                events,
                sender,
            },
            sender_rx,
            core_rx,
        )
    }

    #[tokio::test]
    async fn full_handshake_hands_transport_to_sender() {
        let (connector, servers, hosts) = connector();
        let config = Config::default()
            .connector(connector)
            .crypto_mode(CryptoMode::Lite)
            .driver_timeout(Some(Duration::from_secs(5)));
        let (ic, sender_rx, _core_rx) = interconnect();
        let (udp, udp_port) = discovery_server().await;

        let server_task = tokio::spawn(async move {
            let mut server = servers.recv_async().await.unwrap();
            serve_handshake(&mut server, &udp, udp_port).await;
            server
        });

        let conn = Connection::new(info(), &ic, &config).await.unwrap();
        let _server = server_task.await.unwrap();

        assert_eq!(conn.ssrc, 99);
        assert_eq!(hosts.try_recv().unwrap(), ("voice.test".to_owned(), 443));
        assert!(matches!(sender_rx.try_recv(), Ok(SenderMessage::Ws(Some(_)))));
        match sender_rx.try_recv() {
            Ok(SenderMessage::SetConn(c)) => {
                assert_eq!(c.udp.peer_addr().unwrap().port(), udp_port);
            },
            _ => panic!("expected a media transport"),
        }
    }

    #[tokio::test]
    async fn lost_discovery_reply_is_requested_again() {
        let (connector, servers, _hosts) = connector();
        let config = Config::default()
            .connector(connector)
            .driver_timeout(Some(Duration::from_secs(5)));
        let (ic, sender_rx, _core_rx) = interconnect();
        let (udp, udp_port) = discovery_server().await;

        let server_task = tokio::spawn(async move {
            let mut server = servers.recv_async().await.unwrap();
            serve_lossy_handshake(&mut server, &udp, udp_port, 1).await;
            server
        });

        let conn = Connection::new(info(), &ic, &config).await.unwrap();
        let _server = server_task.await.unwrap();

        assert_eq!(conn.ssrc, 99);
        assert!(matches!(sender_rx.try_recv(), Ok(SenderMessage::Ws(Some(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_discovery_gives_up() {
        let (_server, port) = discovery_server().await;
        let udp = DatagramSocket::connect("127.0.0.1", port).await.unwrap();

        let started = tokio::time::Instant::now();
        let res = discover(&udp, 7).await;

        assert!(matches!(res, Err(Error::TimedOut)));
        assert!(started.elapsed() >= IP_DISCOVERY_RESEND * IP_DISCOVERY_ATTEMPTS as u32);
    }

    #[tokio::test]
    async fn unoffered_mode_fails_handshake() {
        let (connector, servers, _hosts) = connector();
        let config = Config::default()
            .connector(connector)
            .crypto_mode(CryptoMode::Suffix);
        let (ic, _sender_rx, _core_rx) = interconnect();

        let server_task = tokio::spawn(async move {
            let mut server = servers.recv_async().await.unwrap();
            server.accept().await;
            let _identify = server.next_json().await;
            server
                .send_json(&json!({"op": 2, "d": {
                    "ssrc": 1, "ip": "127.0.0.1", "port": 1, "modes": ["xsalsa20_poly1305"],
                }}))
                .await;
            server
                .send_json(&json!({"op": 8, "d": {"heartbeat_interval": 1000.0}}))
                .await;
            server
        });

        let res = Connection::new(info(), &ic, &config).await;
        let _server = server_task.await.unwrap();
        assert!(matches!(res, Err(Error::CryptoModeUnavailable)));
    }
}
