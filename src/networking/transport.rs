//! UDP transport layer
//!
//! One socket per circuit, connected to its simulator so the kernel filters
//! foreign traffic and reports ICMP errors back to the receive loop.

use crate::networking::serialization::{zerocode, MTU};
use crate::networking::NetworkResult;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tracing::{info, trace, warn};

/// UDP transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Local bind address; port 0 picks an ephemeral port
    pub bind_addr: SocketAddr,
    /// Receive buffer size per datagram
    pub recv_buffer_size: usize,
}

impl TransportConfig {
    /// Bind on the unspecified address of the remote's family
    pub fn for_remote(remote: SocketAddr) -> Self {
        let bind_addr = match remote {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        Self { bind_addr, recv_buffer_size: zerocode::MAX_DECODED_LEN }
    }
}

/// Byte and datagram counters, updated lock-free from the socket paths
#[derive(Debug, Default)]
pub struct TransportStats {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
}

/// UDP transport for one simulator
pub struct UdpTransport {
    socket: UdpSocket,
    config: TransportConfig,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    stats: TransportStats,
}

impl UdpTransport {
    /// Bind a socket and connect it to `remote`
    pub async fn connect(remote: SocketAddr, config: TransportConfig) -> NetworkResult<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        socket.connect(remote).await?;
        let local_addr = socket.local_addr()?;

        info!("UDP transport bound to {} for {}", local_addr, remote);

        Ok(Self {
            socket,
            config,
            local_addr,
            remote_addr: remote,
            stats: TransportStats::default(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn stats(&self) -> &TransportStats {
        &self.stats
    }

    pub fn recv_buffer_size(&self) -> usize {
        self.config.recv_buffer_size.max(MTU)
    }

    /// Send one datagram
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        let sent = self.socket.send(data).await?;
        if sent != data.len() {
            warn!("Partial send: {} bytes of {} to {}", sent, data.len(), self.remote_addr);
        }
        self.stats.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent {} bytes to {}", sent, self.remote_addr);
        Ok(())
    }

    /// Receive one datagram into `buffer`
    pub async fn recv(&self, buffer: &mut [u8]) -> io::Result<usize> {
        let len = self.socket.recv(buffer).await?;
        self.stats.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
        Ok(len)
    }
}

/// ICMP port-unreachable and friends surface as these on a connected
/// socket; the simulator may simply not be listening yet.
pub fn is_transient(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset | io::ErrorKind::WouldBlock
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_and_receive_counts() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let transport = UdpTransport::connect(peer_addr, TransportConfig::for_remote(peer_addr)).await.unwrap();

        transport.send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"hello");

        peer.send_to(b"world!", from).await.unwrap();
        let len = transport.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"world!");

        assert_eq!(transport.stats().bytes_sent.load(Ordering::Relaxed), 5);
        assert_eq!(transport.stats().packets_received.load(Ordering::Relaxed), 1);
        assert_eq!(transport.remote_addr(), peer_addr);
    }
}
