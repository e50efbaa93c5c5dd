#![allow(dead_code)]

use bytes::BytesMut;
use slv_net::config::NetworkSettings;
use slv_net::networking::packets::{AnyPacket, Packet, PacketAck, UseCircuitCode};
use slv_net::networking::serialization::header::{append_acks, stamp_sequence};
use slv_net::networking::serialization::{PacketFlags, PacketHeader, PacketSerializer};
use slv_net::networking::{AgentSession, SimulatorEndpoint};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use uuid::Uuid;

pub fn init() {
    slv_net::utils::logging::init_test_logging();
}

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Timings short enough for tests; watchdog and pings effectively off
pub fn fast_settings() -> NetworkSettings {
    NetworkSettings {
        login_timeout_ms: 2_000,
        simulator_timeout_ms: 1_000,
        logout_timeout_ms: 1_000,
        resend_timeout_ms: 150,
        network_tick_interval_ms: 20,
        ping_interval_ms: 60_000,
        sim_disconnect_interval_ms: 60_000,
        queue_poll_timeout_ms: 20,
        outbound_send_interval_ms: 1,
        caps_timeout_ms: 2_000,
        caps_retry_delay_ms: 50,
        caps_max_failures: 2,
        event_queue_timeout_ms: 2_000,
        ..NetworkSettings::default()
    }
}

pub fn test_session() -> AgentSession {
    AgentSession::new(Uuid::new_v4(), Uuid::new_v4(), 424_242)
}

/// A simulator on a loopback socket that speaks just enough LLUDP for tests
pub struct FakeSim {
    socket: UdpSocket,
    pub addr: SocketAddr,
    client: Option<SocketAddr>,
    next_sequence: u32,
}

impl FakeSim {
    pub async fn bind() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        Self { socket, addr, client: None, next_sequence: 1 }
    }

    pub fn endpoint(&self) -> SimulatorEndpoint {
        SimulatorEndpoint::from_grid_position(self.addr, 256_000, 256_000)
    }

    pub fn client(&self) -> SocketAddr {
        self.client.expect("no client has spoken yet")
    }

    /// Next datagram from the client, decoded
    pub async fn recv(&mut self) -> (PacketHeader, AnyPacket) {
        self.try_recv(RECV_TIMEOUT).await.expect("timed out waiting for the client")
    }

    pub async fn try_recv(&mut self, timeout: Duration) -> Option<(PacketHeader, AnyPacket)> {
        let mut buffer = vec![0u8; 4096];
        let (len, from) = tokio::time::timeout(timeout, self.socket.recv_from(&mut buffer)).await.ok()?.ok()?;
        self.client = Some(from);
        Some(PacketSerializer::decode(&buffer[..len]).unwrap())
    }

    /// Skip datagrams until a `P` arrives
    pub async fn recv_packet<P: Packet + Clone>(&mut self) -> (PacketHeader, P) {
        loop {
            let (header, packet) = self.recv().await;
            if let Some(p) = packet.downcast_ref::<P>() {
                return (header, p.clone());
            }
        }
    }

    /// Datagram for `packet` with the given sequence, flags and ack trailer
    pub fn frame<P: Packet>(packet: &P, sequence: u32, resent: bool, acks: &[u32]) -> BytesMut {
        let outgoing = PacketSerializer::build_outbound(packet).unwrap();
        let mut datagram = BytesMut::from(&outgoing[0].data[..]);
        stamp_sequence(&mut datagram, sequence);
        if resent {
            datagram[0] |= PacketFlags::RESENT.bits();
        }
        append_acks(&mut datagram, acks);
        datagram
    }

    pub async fn send_raw(&self, datagram: &[u8]) {
        self.socket.send_to(datagram, self.client()).await.unwrap();
    }

    /// Send with the next sequence number; returns it
    pub async fn send<P: Packet>(&mut self, packet: &P) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.send_raw(&Self::frame(packet, sequence, false, &[])).await;
        sequence
    }

    pub async fn ack(&mut self, sequences: Vec<u32>) {
        self.send(&PacketAck { packets: sequences }).await;
    }

    /// Wait for UseCircuitCode and acknowledge it
    pub async fn accept(&mut self) -> UseCircuitCode {
        let (header, use_circuit_code) = self.recv_packet::<UseCircuitCode>().await;
        self.ack(vec![header.sequence]).await;
        use_circuit_code
    }

    /// Collect every datagram that arrives within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<(PacketHeader, AnyPacket)> {
        let deadline = tokio::time::Instant::now() + window;
        let mut received = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return received;
            }
            match self.try_recv(left).await {
                Some(item) => received.push(item),
                None => return received,
            }
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// One-shot HTTP/1.1 server: `respond(path, body)` gives status, body and a
/// delay before answering.
pub async fn serve_http<F>(respond: F) -> SocketAddr
where
    F: Fn(&str, &str) -> (u16, String, Duration) + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let respond = std::sync::Arc::new(respond);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let respond = std::sync::Arc::clone(&respond);
            tokio::spawn(async move {
                let Some((path, body)) = read_request(&mut stream).await else {
                    return;
                };
                let (status, text, delay) = respond(&path, &body);
                tokio::time::sleep(delay).await;
                let reason = match status {
                    200 => "OK",
                    404 => "Not Found",
                    500 => "Internal Server Error",
                    502 => "Bad Gateway",
                    _ => "Status",
                };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/llsd+xml\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    text.len(),
                    text
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    addr
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<(String, String)> {
    let mut data = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        data.extend_from_slice(&chunk[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let path = head.split_whitespace().nth(1)?.to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while data.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&data[header_end..]).to_string();
    Some((path, body))
}
