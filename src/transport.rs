//! Raw byte transports: a TLS stream socket for websocket traffic, and a
//! connected UDP socket for voice media.
//!
//! Both sockets are non-blocking from the caller's view: each I/O pass waits at
//! most a caller-supplied timeout for readiness and moves at most one chunk of
//! bytes in each direction.

use crate::constants::SOCKET_CHUNK_SIZE;
use async_trait::async_trait;
use rustls::{pki_types::ServerName, ClientConfig, RootCertStore};
use std::{
    fmt,
    io::{Error as IoError, ErrorKind, Result as IoResult},
    net::{SocketAddr, UdpSocket as StdUdpSocket},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{lookup_host, TcpStream, UdpSocket},
    time::timeout,
};
use tracing::{debug, instrument, trace};

/// Any full-duplex byte stream usable as a websocket transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Source of connected byte streams.
///
/// The default is [`TlsConnector`]; tests and proxies may substitute their own.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a stream to `host:port`, completing any handshake before returning.
    async fn connect(&self, host: &str, port: u16) -> IoResult<Box<dyn AsyncStream>>;
}

/// Opens TCP connections and performs a TLS handshake against the webpki roots.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Creates a connector trusting the bundled Mozilla root set.
    #[must_use]
    pub fn new() -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        }
    }
}

impl Default for TlsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TlsConnector")
    }
}

#[async_trait]
impl Connector for TlsConnector {
    #[instrument(skip(self))]
    async fn connect(&self, host: &str, port: u16) -> IoResult<Box<dyn AsyncStream>> {
        let tcp = TcpStream::connect((host, port)).await?;
        tcp.set_nodelay(true)?;

        let name = ServerName::try_from(host.to_owned())
            .map_err(|e| IoError::new(ErrorKind::InvalidInput, e))?;

        let tls = self.inner.connect(name, tcp).await?;
        debug!("TLS session established with {}:{}.", host, port);

        Ok(Box::new(tls))
    }
}

/// Bytes moved by a single call to [`StreamSocket::process_io`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct IoProgress {
    /// Bytes appended to the inbound buffer.
    pub read: usize,
    /// Bytes drained from the outbound buffer.
    pub written: usize,
}

/// A buffered, connected byte stream.
pub struct StreamSocket {
    stream: Box<dyn AsyncStream>,
    inbound: Vec<u8>,
    outbound: Vec<u8>,
    scratch: Box<[u8]>,
}

impl StreamSocket {
    /// Connects to `host:port` through the given connector.
    pub async fn connect(connector: &dyn Connector, host: &str, port: u16) -> IoResult<Self> {
        connector
            .connect(host, port)
            .await
            .map(StreamSocket::from_stream)
    }

    /// Wraps an already-connected stream.
    #[must_use]
    pub fn from_stream(stream: Box<dyn AsyncStream>) -> Self {
        Self {
            stream,
            inbound: Vec::with_capacity(SOCKET_CHUNK_SIZE),
            outbound: Vec::new(),
            scratch: vec![0u8; SOCKET_CHUNK_SIZE].into_boxed_slice(),
        }
    }

    /// Queues bytes for sending on the next I/O pass.
    pub fn write(&mut self, bytes: &[u8]) {
        self.outbound.extend_from_slice(bytes);
    }

    /// Returns whether queued bytes remain unsent.
    #[must_use]
    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Received bytes not yet consumed by a parser.
    pub fn inbound_mut(&mut self) -> &mut Vec<u8> {
        &mut self.inbound
    }

    /// Performs one pass of I/O, waiting up to `wait` for each direction.
    ///
    /// An orderly close by the peer is reported as [`ErrorKind::UnexpectedEof`].
    pub async fn process_io(&mut self, wait: Duration) -> IoResult<IoProgress> {
        let mut progress = IoProgress::default();

        if !self.outbound.is_empty() {
            let chunk = self.outbound.len().min(SOCKET_CHUNK_SIZE);

            match timeout(wait, self.stream.write(&self.outbound[..chunk])).await {
                Ok(Ok(0)) => return Err(ErrorKind::WriteZero.into()),
                Ok(Ok(n)) => {
                    self.outbound.drain(..n);
                    progress.written = n;
                },
                Ok(Err(e)) => return Err(e),
                Err(_) => trace!("Socket not writable within {:?}.", wait),
            }

            if progress.written > 0 {
                if let Ok(res) = timeout(wait, self.stream.flush()).await {
                    res?;
                }
            }
        }

        match timeout(wait, self.stream.read(&mut self.scratch[..])).await {
            Ok(Ok(0)) => return Err(IoError::new(ErrorKind::UnexpectedEof, "peer closed stream")),
            Ok(Ok(n)) => {
                self.inbound.extend_from_slice(&self.scratch[..n]);
                progress.read = n;
            },
            Ok(Err(e)) => return Err(e),
            Err(_) => {},
        }

        Ok(progress)
    }

    /// Writes out every queued byte, waiting up to `wait` in total.
    pub async fn flush_all(&mut self, wait: Duration) -> IoResult<()> {
        let outbound = std::mem::take(&mut self.outbound);

        let res = timeout(wait, async {
            self.stream.write_all(&outbound).await?;
            self.stream.flush().await
        })
        .await;

        match res {
            Ok(inner) => inner,
            Err(_) => Err(ErrorKind::TimedOut.into()),
        }
    }

    /// Shuts down the write half of the stream.
    pub async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl fmt::Debug for StreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSocket")
            .field("inbound", &self.inbound.len())
            .field("outbound", &self.outbound.len())
            .finish()
    }
}

/// A connected UDP socket: reads and writes need no addressing.
#[derive(Debug)]
pub struct DatagramSocket {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl DatagramSocket {
    /// Binds an ephemeral local port and connects it to `host:port`.
    #[instrument]
    pub async fn connect(host: &str, port: u16) -> IoResult<Self> {
        let peer = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| IoError::new(ErrorKind::NotFound, "no address for host"))?;

        let local: SocketAddr = if peer.is_ipv4() {
            ([0u8; 4], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };

        let socket = UdpSocket::bind(local).await?;
        socket.connect(peer).await?;

        Ok(Self { socket, peer })
    }

    /// Address this socket is connected to.
    #[must_use]
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Sends one datagram.
    pub async fn write(&self, bytes: &[u8]) -> IoResult<usize> {
        self.socket.send(bytes).await
    }

    /// Receives one datagram, or `None` if none arrives within `wait`.
    pub async fn read(&self, buf: &mut [u8], wait: Duration) -> IoResult<Option<usize>> {
        match timeout(wait, self.socket.recv(buf)).await {
            Ok(res) => res.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Converts into a blocking std socket, for use on a dedicated thread.
    pub fn into_std(self) -> IoResult<StdUdpSocket> {
        let socket = self.socket.into_std()?;
        socket.set_nonblocking(false)?;
        Ok(socket)
    }
}
