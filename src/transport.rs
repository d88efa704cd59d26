// Network transport
//
// Connectionless UDP for protocol datagrams and ad-hoc TCP connections for
// push/pull streams. Both sockets share one port: when the configured port
// is 0 the TCP listener picks a free port first and the UDP socket reuses
// it. The protocol core only sees the `Transport` trait and never touches
// sockets directly.

use crate::error::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Buffer size for a single inbound datagram read
const UDP_PACKET_BUF_SIZE: usize = 65536;

/// Receive-window size requested for the UDP socket; halved until the
/// kernel accepts it
const UDP_RECV_BUF_SIZE: usize = 2 * 1024 * 1024;

/// Initial delay after an accept error before trying again
const ACCEPT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Ceiling for the accept error back-off
const ACCEPT_MAX_DELAY: Duration = Duration::from_secs(1);

/// A datagram as delivered to the dispatcher
#[derive(Debug)]
pub struct Datagram {
    pub payload: Bytes,
    pub from: SocketAddr,
    pub timestamp: Instant,
}

/// Byte stream to a peer
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type PeerStream = Box<dyn StreamIo>;

/// Abstraction the membership core drives instead of raw sockets
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort datagram send; no delivery guarantee
    async fn send_datagram(&self, payload: &[u8], dest: SocketAddr) -> Result<()>;

    /// Open a reliable ordered stream to a peer
    async fn dial_stream(&self, dest: SocketAddr, timeout: Duration) -> Result<PeerStream>;

    /// Next inbound datagram; returns `MeshError::Shutdown` once closed
    async fn recv_datagram(&self) -> Result<Datagram>;

    /// Next accepted inbound stream; returns `MeshError::Shutdown` once
    /// closed
    async fn accept_stream(&self) -> Result<PeerStream>;

    /// Address the local node publishes to peers
    fn advertise_addr(&self) -> SocketAddr;

    /// Stop the listeners and wake any blocked receivers
    async fn shutdown(&self) -> Result<()>;
}

/// Production transport over one UDP socket and one TCP listener
pub struct NetTransport {
    advertise: SocketAddr,
    udp: Arc<UdpSocket>,
    packet_rx: tokio::sync::Mutex<mpsc::Receiver<Datagram>>,
    stream_rx: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    closed: Arc<AtomicBool>,
    listeners: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl NetTransport {
    /// Bind the UDP socket and TCP listener and start the receive loops.
    pub async fn bind(bind_addr: SocketAddr, advertise_addr: Option<SocketAddr>) -> Result<Self> {
        let tcp = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MeshError::Config(format!("failed to bind TCP listener on {}: {}", bind_addr, e)))?;
        let bound = tcp
            .local_addr()
            .map_err(|e| MeshError::Config(format!("failed to resolve bound address: {}", e)))?;

        let udp_addr = SocketAddr::new(bind_addr.ip(), bound.port());
        let udp = bind_udp_socket(udp_addr)
            .map_err(|e| MeshError::Config(format!("failed to bind UDP socket on {}: {}", udp_addr, e)))?;
        let udp = Arc::new(
            UdpSocket::from_std(udp)
                .map_err(|e| MeshError::Config(format!("failed to register UDP socket: {}", e)))?,
        );

        let advertise = match advertise_addr {
            Some(addr) => addr,
            None => {
                if bind_addr.ip().is_unspecified() {
                    return Err(MeshError::Config(
                        "an advertise address is required when binding to an unspecified address".to_string(),
                    ));
                }
                SocketAddr::new(bind_addr.ip(), bound.port())
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let (packet_tx, packet_rx) = mpsc::channel(1024);
        let (stream_tx, stream_rx) = mpsc::channel(32);

        let udp_task = tokio::spawn(udp_listen(Arc::clone(&udp), packet_tx, Arc::clone(&closed)));
        let tcp_task = tokio::spawn(tcp_listen(tcp, stream_tx, Arc::clone(&closed)));

        tracing::info!(%bound, %advertise, "transport listening");

        Ok(Self {
            advertise,
            udp,
            packet_rx: tokio::sync::Mutex::new(packet_rx),
            stream_rx: tokio::sync::Mutex::new(stream_rx),
            closed,
            listeners: parking_lot::Mutex::new(vec![udp_task, tcp_task]),
        })
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn send_datagram(&self, payload: &[u8], dest: SocketAddr) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MeshError::Shutdown);
        }
        self.udp
            .send_to(payload, dest)
            .await
            .map_err(|e| MeshError::Transport(format!("datagram send to {} failed: {}", dest, e)))?;
        Ok(())
    }

    async fn dial_stream(&self, dest: SocketAddr, timeout: Duration) -> Result<PeerStream> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(dest))
            .await
            .map_err(|_| MeshError::Timeout(format!("dial to {} timed out", dest)))?
            .map_err(|e| MeshError::Transport(format!("dial to {} failed: {}", dest, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    async fn recv_datagram(&self) -> Result<Datagram> {
        self.packet_rx.lock().await.recv().await.ok_or(MeshError::Shutdown)
    }

    async fn accept_stream(&self) -> Result<PeerStream> {
        let stream = self.stream_rx.lock().await.recv().await.ok_or(MeshError::Shutdown)?;
        Ok(Box::new(stream))
    }

    fn advertise_addr(&self) -> SocketAddr {
        self.advertise
    }

    async fn shutdown(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        for task in self.listeners.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }
}

/// Bind a non-blocking UDP socket with an enlarged receive window.
fn bind_udp_socket(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    let mut size = UDP_RECV_BUF_SIZE;
    while size > 0 {
        if socket.set_recv_buffer_size(size).is_ok() {
            break;
        }
        size /= 2;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

async fn udp_listen(udp: Arc<UdpSocket>, packets: mpsc::Sender<Datagram>, closed: Arc<AtomicBool>) {
    let mut buf = vec![0u8; UDP_PACKET_BUF_SIZE];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let timestamp = Instant::now();
                if n < 1 {
                    tracing::warn!(%from, "discarding empty UDP packet");
                    continue;
                }
                let datagram = Datagram {
                    payload: Bytes::copy_from_slice(&buf[..n]),
                    from,
                    timestamp,
                };
                if packets.send(datagram).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                tracing::error!(error = %e, "error reading UDP packet");
            }
        }
    }
}

async fn tcp_listen(listener: TcpListener, streams: mpsc::Sender<TcpStream>, closed: Arc<AtomicBool>) {
    let mut delay = Duration::ZERO;
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                delay = Duration::ZERO;
                if streams.send(stream).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                if closed.load(Ordering::SeqCst) {
                    break;
                }
                delay = if delay.is_zero() {
                    ACCEPT_BASE_DELAY
                } else {
                    (delay * 2).min(ACCEPT_MAX_DELAY)
                };
                tracing::error!(error = %e, "error accepting TCP connection");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
