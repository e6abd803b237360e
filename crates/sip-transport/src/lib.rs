//! Transport port for the user agent.
//!
//! The signaling core only needs one thing from the network: "send these
//! bytes to that (transport, host, port)". [`TransportPort`] is that contract;
//! [`UdpTransport`] is the tokio implementation used by the `sipua` binary.
//! Inbound datagrams are pushed into an mpsc channel as [`InboundPacket`]s and
//! the user agent feeds them into transaction dispatch.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Indicates which transport carried an inbound or outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl TransportKind {
    /// Returns the lowercase transport string for logging and URI params.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
            TransportKind::Tls => "tls",
        }
    }

    /// Returns the Via header transport token.
    ///
    /// ```
    /// use sip_transport::TransportKind;
    ///
    /// assert_eq!(TransportKind::Udp.via_transport(), "UDP");
    /// assert_eq!(TransportKind::Tls.via_transport(), "TLS");
    /// ```
    pub fn via_transport(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
            TransportKind::Tls => "TLS",
        }
    }

    /// Parses a transport string (case-insensitive) from a Via header or a
    /// URI `transport` parameter.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "udp" => Some(TransportKind::Udp),
            "tcp" => Some(TransportKind::Tcp),
            "tls" => Some(TransportKind::Tls),
            _ => None,
        }
    }

    /// Reliable transports zero out timers D, I, J and K.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportKind::Udp)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.via_transport())
    }
}

/// Where a message goes: transport kind plus host and port.
///
/// The host may be a name; resolution happens in the transport at send time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportTarget {
    pub transport: TransportKind,
    pub host: SmolStr,
    pub port: u16,
}

impl TransportTarget {
    pub fn new(transport: TransportKind, host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            transport,
            host: host.into(),
            port,
        }
    }

    pub fn udp(addr: SocketAddr) -> Self {
        Self::from_peer(TransportKind::Udp, addr)
    }

    /// Target for answering a peer we received a packet from.
    pub fn from_peer(transport: TransportKind, addr: SocketAddr) -> Self {
        Self {
            transport,
            host: SmolStr::new(addr.ip().to_string()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}", self.transport.as_str(), self.host, self.port)
        } else {
            write!(f, "{}:{}:{}", self.transport.as_str(), self.host, self.port)
        }
    }
}

/// Bundle representing a packet received by a transport listener.
#[derive(Debug, Clone)]
pub struct InboundPacket {
    pub transport: TransportKind,
    pub peer: SocketAddr,
    pub payload: Bytes,
}

#[derive(Debug)]
pub enum TransportError {
    Io(std::io::Error),
    Unresolvable(SmolStr),
    Unsupported(TransportKind),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transport I/O error: {}", e),
            Self::Unresolvable(host) => write!(f, "cannot resolve host {}", host),
            Self::Unsupported(kind) => write!(f, "transport {} is not supported", kind),
            Self::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Outbound half of the transport contract.
///
/// Transactions call `send` for every (re)transmission. An `Err` is a
/// transport failure and moves the transaction straight to Terminated.
#[async_trait]
pub trait TransportPort: Send + Sync {
    async fn send(&self, target: &TransportTarget, payload: Bytes) -> Result<(), TransportError>;
}

/// UDP transport over a single bound tokio socket.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Binds the socket and spawns the receive loop.
    ///
    /// Returns the transport and the channel inbound packets arrive on.
    pub async fn bind(
        addr: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<InboundPacket>), TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(run_udp(socket.clone(), tx));
        Ok((Arc::new(Self { socket }), rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl TransportPort for UdpTransport {
    async fn send(&self, target: &TransportTarget, payload: Bytes) -> Result<(), TransportError> {
        if target.transport != TransportKind::Udp {
            return Err(TransportError::Unsupported(target.transport));
        }
        let addr = resolve(target).await?;
        self.socket.send_to(&payload, addr).await?;
        debug!(%target, bytes = payload.len(), "udp sent");
        Ok(())
    }
}

async fn resolve(target: &TransportTarget) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host((target.host.as_str(), target.port))
        .await
        .map_err(|_| TransportError::Unresolvable(target.host.clone()))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::Unresolvable(target.host.clone()))
}

/// Runs a UDP receive loop and forwards packets to the provided channel.
pub async fn run_udp(socket: Arc<UdpSocket>, tx: mpsc::Sender<InboundPacket>) {
    match socket.local_addr() {
        Ok(bind) => info!(%bind, "listening (udp)"),
        Err(e) => warn!(%e, "udp socket has no local address"),
    }
    let mut buf = vec![0u8; 65_535];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                if n == buf.len() {
                    error!(%peer, max = n, "udp datagram likely truncated (buffer full)");
                }
                // CRLF keep-alives carry nothing to dispatch.
                if buf[..n].iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                let packet = InboundPacket {
                    transport: TransportKind::Udp,
                    peer,
                    payload: Bytes::copy_from_slice(&buf[..n]),
                };
                if tx.send(packet).await.is_err() {
                    debug!("receiver dropped; shutting down udp loop");
                    break;
                }
            }
            Err(e) => {
                error!(%e, "udp recv_from error");
            }
        }
    }
}
