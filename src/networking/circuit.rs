//! Circuit management for Second Life UDP connections
//!
//! Each circuit is one connection to one simulator. It owns the socket, the
//! receive loop, outbound sequencing, acknowledgement and resend bookkeeping,
//! ping/pong and, optionally, the capability overlay for that simulator.
//!
//! Locking: the sequencer is a tokio mutex held across the socket send so
//! that wire order matches sequence order. The acknowledger is a std mutex
//! that is never held across an await. When both are needed the sequencer is
//! taken first.

use crate::config::NetworkSettings;
use crate::networking::capabilities::Caps;
use crate::networking::handlers::{Inbound, IncomingEvent, IncomingPacket};
use crate::networking::manager::DisconnectType;
use crate::networking::packets::{
    AnyPacket, CloseCircuit, CompletePingCheck, Packet, PacketAck, PacketType, StartPingCheck, UseCircuitCode,
};
use crate::networking::serialization::header::{append_acks, stamp_sequence, ACK_COUNT_LEN, ACK_LEN};
use crate::networking::serialization::{OutgoingPacket, PacketFlags, PacketHeader, PacketSerializer, MTU};
use crate::networking::session::{AgentSession, SimulatorEndpoint};
use crate::networking::transport::{self, TransportConfig, UdpTransport};
use crate::networking::{NetworkError, NetworkResult};
use bytes::{Bytes, BytesMut};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Sequence numbers wrap back to 1 past this value
pub const MAX_SEQUENCE: u32 = 0x0100_0000;

/// Circuit connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Disconnected,
    Connecting,
    Connected,
}

/// Lifecycle notifications for the owner of the circuit
#[derive(Debug, Clone)]
pub enum CircuitEvent {
    /// The circuit shut itself down
    Closed { address: SocketAddr, reason: DisconnectType },
}

/// Reliable packet waiting for acknowledgment
#[derive(Debug, Clone)]
pub struct InFlightPacket {
    /// Stamped datagram without an ack trailer
    pub data: Bytes,
    pub sequence: u32,
    pub sent_at: Instant,
    pub resend_count: u32,
    pub packet_type: PacketType,
}

/// Outcome of one resend sweep
#[derive(Debug, Default)]
pub struct ResendSweep {
    /// Datagrams to send again, RESENT flag already set
    pub resend: Vec<(u32, Bytes)>,
    /// Gave up on these
    pub abandoned: Vec<(u32, PacketType)>,
}

/// Circuit acknowledgment manager
///
/// Pure bookkeeping: callers pass the current time in.
pub struct Acknowledger {
    /// Recently received reliable sequences, oldest first
    recent: VecDeque<u32>,
    recent_set: HashSet<u32>,
    recent_capacity: usize,
    /// Acknowledgments owed to the simulator
    pending_acks: Vec<u32>,
    /// Reliable packets waiting for acknowledgment
    in_flight: BTreeMap<u32, InFlightPacket>,
    /// In-flight sequences in send order; the front is always in flight
    send_order: VecDeque<u32>,
}

impl Acknowledger {
    pub fn new(recent_capacity: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(recent_capacity),
            recent_set: HashSet::with_capacity(recent_capacity),
            recent_capacity: recent_capacity.max(1),
            pending_acks: Vec::new(),
            in_flight: BTreeMap::new(),
            send_order: VecDeque::new(),
        }
    }

    /// Remember an inbound reliable sequence. False if it was seen recently.
    pub fn record_inbound(&mut self, sequence: u32) -> bool {
        if self.recent_set.contains(&sequence) {
            return false;
        }
        if self.recent.len() >= self.recent_capacity {
            if let Some(oldest) = self.recent.pop_front() {
                self.recent_set.remove(&oldest);
            }
        }
        self.recent.push_back(sequence);
        self.recent_set.insert(sequence);
        true
    }

    pub fn queue_ack(&mut self, sequence: u32) {
        if !self.pending_acks.contains(&sequence) {
            self.pending_acks.push(sequence);
        }
    }

    pub fn pending_ack_count(&self) -> usize {
        self.pending_acks.len()
    }

    /// Take up to `max` owed acks, oldest first
    pub fn take_acks(&mut self, max: usize) -> Vec<u32> {
        let count = max.min(self.pending_acks.len());
        self.pending_acks.drain(..count).collect()
    }

    /// Put acks back at the front after a failed send
    pub fn requeue_acks(&mut self, acks: Vec<u32>) {
        let mut restored = acks;
        restored.retain(|seq| !self.pending_acks.contains(seq));
        restored.append(&mut self.pending_acks);
        self.pending_acks = restored;
    }

    pub fn track(&mut self, packet: InFlightPacket) {
        self.send_order.push_back(packet.sequence);
        self.in_flight.insert(packet.sequence, packet);
    }

    /// Clear an in-flight packet. False if the sequence was not waiting.
    pub fn acknowledge(&mut self, sequence: u32) -> bool {
        let removed = self.in_flight.remove(&sequence).is_some();
        self.prune_send_order();
        removed
    }

    fn prune_send_order(&mut self) {
        while let Some(front) = self.send_order.front() {
            if self.in_flight.contains_key(front) {
                break;
            }
            self.send_order.pop_front();
        }
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, sequence: u32) -> bool {
        self.in_flight.contains_key(&sequence)
    }

    /// Earliest-sent packet still unacknowledged; survives sequence wrap
    pub fn oldest_unacked(&self) -> Option<u32> {
        self.send_order.front().copied()
    }

    /// Resend everything older than `timeout` until it has been resent
    /// `max_resends` times; after that the packet is dropped.
    pub fn collect_resends(&mut self, now: Instant, timeout: Duration, max_resends: u32) -> ResendSweep {
        let mut sweep = ResendSweep::default();

        self.in_flight.retain(|sequence, packet| {
            if now.saturating_duration_since(packet.sent_at) < timeout {
                return true;
            }
            if packet.resend_count >= max_resends {
                sweep.abandoned.push((*sequence, packet.packet_type));
                return false;
            }
            packet.resend_count += 1;
            packet.sent_at = now;

            let mut data = BytesMut::from(&packet.data[..]);
            data[0] |= PacketFlags::RESENT.bits();
            sweep.resend.push((*sequence, data.freeze()));
            true
        });
        self.prune_send_order();

        sweep
    }
}

/// Outbound sequence numbers
struct Sequencer {
    next: u32,
}

impl Sequencer {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn next(&mut self) -> u32 {
        let sequence = self.next;
        self.next = if self.next >= MAX_SEQUENCE { 1 } else { self.next + 1 };
        sequence
    }
}

/// Ping tracking for lag measurement
#[derive(Default)]
struct PingTracker {
    next_ping_id: u8,
    outstanding: HashMap<u8, Instant>,
    last_lag: Option<Duration>,
}

impl PingTracker {
    fn start_ping(&mut self, now: Instant) -> u8 {
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        // ids wrap; an entry 256 pings old is long dead
        self.outstanding.insert(ping_id, now);
        ping_id
    }

    fn complete_ping(&mut self, ping_id: u8, now: Instant) -> Option<Duration> {
        let sent_at = self.outstanding.remove(&ping_id)?;
        let lag = now.saturating_duration_since(sent_at);
        self.last_lag = Some(lag);
        Some(lag)
    }
}

#[derive(Default)]
struct Counters {
    resends: AtomicU64,
    resends_abandoned: AtomicU64,
    duplicates: AtomicU64,
    unknown_acks: AtomicU64,
    decode_failures: AtomicU64,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
}

/// Snapshot of a circuit's counters
#[derive(Debug, Clone, Default)]
pub struct CircuitStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub resends: u64,
    pub resends_abandoned: u64,
    pub duplicates: u64,
    pub unknown_acks: u64,
    pub decode_failures: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub last_lag: Option<Duration>,
    pub in_flight: usize,
    pub pending_acks: usize,
}

/// Circuit for managing connection to a Second Life simulator
pub struct Circuit {
    endpoint: SimulatorEndpoint,
    session: AgentSession,
    settings: Arc<NetworkSettings>,
    transport: Arc<UdpTransport>,
    sequencer: tokio::sync::Mutex<Sequencer>,
    acknowledger: Mutex<Acknowledger>,
    pings: Mutex<PingTracker>,
    counters: Counters,
    state: watch::Sender<CircuitState>,
    /// Set by the watchdog, cleared by any inbound datagram
    disconnect_candidate: AtomicBool,
    closed: AtomicBool,
    caps: Mutex<Option<Arc<Caps>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    inbox: mpsc::Sender<Inbound>,
    events: mpsc::UnboundedSender<CircuitEvent>,
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("endpoint", &self.endpoint)
            .field("local_addr", &self.transport.local_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl Circuit {
    /// Open a circuit: bind the socket, start the receive loop, send
    /// `UseCircuitCode` and wait for the simulator to answer.
    ///
    /// If nothing decodable arrives within `login_timeout` the circuit is
    /// torn down again and `HandshakeTimeout` is returned.
    pub async fn connect(
        endpoint: SimulatorEndpoint,
        session: AgentSession,
        settings: Arc<NetworkSettings>,
        inbox: mpsc::Sender<Inbound>,
        events: mpsc::UnboundedSender<CircuitEvent>,
    ) -> NetworkResult<Arc<Circuit>> {
        let transport = UdpTransport::connect(endpoint.address, TransportConfig::for_remote(endpoint.address)).await?;
        let (state, _) = watch::channel(CircuitState::Connecting);

        let circuit = Arc::new(Circuit {
            endpoint,
            session,
            acknowledger: Mutex::new(Acknowledger::new(settings.recent_sequence_capacity)),
            settings,
            transport: Arc::new(transport),
            sequencer: tokio::sync::Mutex::new(Sequencer::new()),
            pings: Mutex::new(PingTracker::default()),
            counters: Counters::default(),
            state,
            disconnect_candidate: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            caps: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            inbox,
            events,
        });

        info!("Connecting to simulator {}", endpoint);

        let (first_tx, first_rx) = oneshot::channel();
        let receive = circuit.spawn_receive_loop(first_tx);
        let tick = circuit.spawn_tick_task();
        circuit.tasks_guard().extend([receive, tick]);

        let use_circuit_code = UseCircuitCode {
            code: session.circuit_code,
            session_id: session.session_id,
            id: session.agent_id,
        };
        if let Err(e) = circuit.send(&use_circuit_code).await {
            circuit.disconnect(false).await;
            return Err(e);
        }

        match tokio::time::timeout(circuit.settings.login_timeout(), first_rx).await {
            Ok(Ok(())) => {
                let ping = circuit.spawn_ping_task();
                circuit.tasks_guard().push(ping);
                circuit.set_state(CircuitState::Connected);
                info!("Connected to simulator {}", endpoint);
                Ok(circuit)
            }
            _ => {
                warn!("Simulator {} did not answer within {:?}", endpoint, circuit.settings.login_timeout());
                circuit.disconnect(false).await;
                Err(NetworkError::HandshakeTimeout { address: endpoint.address })
            }
        }
    }

    pub fn endpoint(&self) -> SimulatorEndpoint {
        self.endpoint
    }

    pub fn address(&self) -> SocketAddr {
        self.endpoint.address
    }

    pub fn handle(&self) -> u64 {
        self.endpoint.handle
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub fn state(&self) -> CircuitState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<CircuitState> {
        self.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == CircuitState::Connected
    }

    fn set_state(&self, new_state: CircuitState) {
        let old_state = self.state.send_replace(new_state);
        if old_state != new_state {
            debug!("Circuit {} state changed: {:?} -> {:?}", self.address(), old_state, new_state);
        }
    }

    fn acknowledger(&self) -> std::sync::MutexGuard<'_, Acknowledger> {
        self.acknowledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tasks_guard(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> CircuitStats {
        let transport = self.transport.stats();
        let (in_flight, pending_acks) = {
            let ack = self.acknowledger();
            (ack.in_flight_len(), ack.pending_ack_count())
        };
        CircuitStats {
            bytes_sent: transport.bytes_sent.load(Ordering::Relaxed),
            bytes_received: transport.bytes_received.load(Ordering::Relaxed),
            packets_sent: transport.packets_sent.load(Ordering::Relaxed),
            packets_received: transport.packets_received.load(Ordering::Relaxed),
            resends: self.counters.resends.load(Ordering::Relaxed),
            resends_abandoned: self.counters.resends_abandoned.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
            unknown_acks: self.counters.unknown_acks.load(Ordering::Relaxed),
            decode_failures: self.counters.decode_failures.load(Ordering::Relaxed),
            pings_sent: self.counters.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.counters.pongs_received.load(Ordering::Relaxed),
            last_lag: self.pings.lock().unwrap_or_else(PoisonError::into_inner).last_lag,
            in_flight,
            pending_acks,
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.acknowledger().in_flight_len()
    }

    pub fn is_in_flight(&self, sequence: u32) -> bool {
        self.acknowledger().is_in_flight(sequence)
    }

    /// Watchdog tick. Marks the circuit and returns true if it was already
    /// marked, i.e. nothing arrived since the previous tick.
    pub fn mark_disconnect_candidate(&self) -> bool {
        self.disconnect_candidate.swap(true, Ordering::AcqRel)
    }

    /// Serialize and send a packet, splitting it if needed
    pub async fn send<P: Packet>(&self, packet: &P) -> NetworkResult<()> {
        for outgoing in PacketSerializer::build_outbound(packet)? {
            self.send_prepared(outgoing).await?;
        }
        Ok(())
    }

    /// Final send path: assign the sequence number, append owed acks and
    /// record reliable packets for resending.
    pub async fn send_prepared(&self, outgoing: OutgoingPacket) -> NetworkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::ConnectionLost { address: self.address() });
        }
        self.transmit(outgoing).await
    }

    async fn transmit(&self, outgoing: OutgoingPacket) -> NetworkResult<()> {
        let mut sequencer = self.sequencer.lock().await;
        let sequence = sequencer.next();

        let mut datagram = BytesMut::from(&outgoing.data[..]);
        stamp_sequence(&mut datagram, sequence);
        let stamped = datagram.clone().freeze();

        let room = MTU.saturating_sub(datagram.len() + ACK_COUNT_LEN) / ACK_LEN;
        let acks = {
            let mut ack = self.acknowledger();
            let acks = ack.take_acks(room.min(self.settings.max_appended_acks));
            if outgoing.reliable {
                ack.track(InFlightPacket {
                    data: stamped,
                    sequence,
                    sent_at: Instant::now(),
                    resend_count: 0,
                    packet_type: outgoing.packet_type,
                });
            }
            acks
        };
        append_acks(&mut datagram, &acks);

        trace!(
            "Sending {} seq {} ({} bytes, {} acks) to {}",
            outgoing.packet_type,
            sequence,
            datagram.len(),
            acks.len(),
            self.address()
        );

        if let Err(e) = self.transport.send(&datagram).await {
            if !acks.is_empty() {
                self.acknowledger().requeue_acks(acks);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Send every owed ack in dedicated PacketAck packets
    pub async fn flush_acks(&self) -> NetworkResult<()> {
        let acks = self.acknowledger().take_acks(usize::MAX);
        if acks.is_empty() {
            return Ok(());
        }
        debug!("Flushing {} acks to {}", acks.len(), self.address());
        let packet = PacketAck { packets: acks };
        if let Err(e) = self.send(&packet).await {
            self.acknowledger().requeue_acks(packet.packets);
            return Err(e);
        }
        Ok(())
    }

    /// Resend overdue reliable packets and drop the ones out of retries
    pub async fn resend_unacked(&self) {
        let sweep = self.acknowledger().collect_resends(
            Instant::now(),
            self.settings.resend_timeout(),
            self.settings.max_resend_count,
        );

        for (sequence, packet_type) in &sweep.abandoned {
            self.counters.resends_abandoned.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Giving up on {} seq {} to {} after {} resends",
                packet_type,
                sequence,
                self.address(),
                self.settings.max_resend_count
            );
        }

        for (sequence, data) in sweep.resend {
            self.counters.resends.fetch_add(1, Ordering::Relaxed);
            debug!("Resending seq {} to {}", sequence, self.address());
            if let Err(e) = self.transport.send(&data).await {
                warn!("Resend of seq {} to {} failed: {}", sequence, self.address(), e);
            }
        }
    }

    /// Send a StartPingCheck carrying the oldest unacked sequence
    pub async fn send_ping(&self) -> NetworkResult<u8> {
        let oldest_unacked = self.acknowledger().oldest_unacked().unwrap_or(0);
        let ping_id = self
            .pings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .start_ping(Instant::now());

        self.send(&StartPingCheck { ping_id, oldest_unacked }).await?;
        self.counters.pings_sent.fetch_add(1, Ordering::Relaxed);
        trace!("Sent ping {} to {}", ping_id, self.address());
        Ok(ping_id)
    }

    fn acknowledge(&self, sequences: &[u32]) {
        let mut unknown = 0;
        {
            let mut ack = self.acknowledger();
            for sequence in sequences {
                if !ack.acknowledge(*sequence) {
                    unknown += 1;
                    debug!("Ack for unknown sequence {} from {}", sequence, self.address());
                }
            }
        }
        if unknown > 0 {
            self.counters.unknown_acks.fetch_add(unknown, Ordering::Relaxed);
        }
    }

    /// Process one datagram. Returns true if it carried a decodable packet.
    async fn handle_datagram(self: &Arc<Self>, datagram: &[u8]) -> bool {
        let (header, body) = match PacketHeader::decode(datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Dropping datagram from {}: {}", self.address(), e);
                return false;
            }
        };
        self.disconnect_candidate.store(false, Ordering::Release);

        if !header.acks.is_empty() {
            self.acknowledge(&header.acks);
        }

        if header.is_reliable() {
            let (is_new, flush) = {
                let mut ack = self.acknowledger();
                // Duplicates are acked again: our first ack may have been lost
                ack.queue_ack(header.sequence);
                let is_new = ack.record_inbound(header.sequence);
                (is_new, ack.pending_ack_count() >= self.settings.max_pending_acks)
            };
            if flush {
                if let Err(e) = self.flush_acks().await {
                    debug!("Ack flush to {} failed: {}", self.address(), e);
                }
            }
            if !is_new {
                self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                if header.is_resent() {
                    debug!("Dropping resent duplicate seq {} from {}", header.sequence, self.address());
                } else {
                    warn!("Duplicate seq {} from {} without RESENT flag", header.sequence, self.address());
                }
                return false;
            }
        }

        let packet = match PacketSerializer::decode_message(&header, &datagram[body]) {
            Ok(packet) => packet,
            Err(NetworkError::UnknownPacket { id, frequency }) => {
                debug!("Unknown packet {:?} {} from {}", frequency, id, self.address());
                return false;
            }
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!("Failed to decode packet seq {} from {}: {}", header.sequence, self.address(), e);
                return false;
            }
        };
        trace!("Received {} seq {} from {}", packet.name(), header.sequence, self.address());

        self.handle_control(&packet).await;

        let inbound = Inbound {
            circuit: Arc::clone(self),
            event: IncomingEvent::Packet(IncomingPacket {
                sequence: header.sequence,
                flags: header.flags,
                packet,
            }),
        };
        self.deliver(inbound).await;
        true
    }

    /// Packets the circuit answers itself
    async fn handle_control(&self, packet: &AnyPacket) {
        match packet {
            AnyPacket::PacketAck(ack) => self.acknowledge(&ack.packets),
            AnyPacket::StartPingCheck(ping) => {
                if let Err(e) = self.send(&CompletePingCheck { ping_id: ping.ping_id }).await {
                    debug!("Failed to answer ping {} from {}: {}", ping.ping_id, self.address(), e);
                }
            }
            AnyPacket::CompletePingCheck(pong) => {
                let lag = self
                    .pings
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .complete_ping(pong.ping_id, Instant::now());
                match lag {
                    Some(lag) => {
                        self.counters.pongs_received.fetch_add(1, Ordering::Relaxed);
                        trace!("Ping {} to {} took {:?}", pong.ping_id, self.address(), lag);
                    }
                    None => debug!("Pong for unknown ping {} from {}", pong.ping_id, self.address()),
                }
            }
            _ => {}
        }
    }

    /// Queue an event for dispatch, waiting at most `simulator_timeout` for room
    pub(crate) async fn deliver(&self, inbound: Inbound) {
        let name = inbound.event.name().to_string();
        match self.inbox.send_timeout(inbound, self.settings.simulator_timeout()).await {
            Ok(()) => {}
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("Inbox full, dropping {} from {}", name, self.address());
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                trace!("Inbox closed, dropping {} from {}", name, self.address());
            }
        }
    }

    fn spawn_receive_loop(self: &Arc<Self>, first_packet: oneshot::Sender<()>) -> JoinHandle<()> {
        let transport = Arc::clone(&self.transport);
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut buffer = vec![0u8; transport.recv_buffer_size()];
            let mut first_packet = Some(first_packet);

            loop {
                let result = transport.recv(&mut buffer).await;
                let Some(circuit) = weak.upgrade() else {
                    break;
                };

                match result {
                    Ok(len) => {
                        if circuit.handle_datagram(&buffer[..len]).await {
                            if let Some(tx) = first_packet.take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Err(e) if transport::is_transient(&e) => {
                        debug!("Transient receive error from {}: {}", circuit.address(), e);
                    }
                    Err(e) => {
                        error!("Receive from {} failed: {}", circuit.address(), e);
                        circuit.on_socket_error();
                        break;
                    }
                }
            }
        })
    }

    /// Close the circuit after an unrecoverable socket error and tell the
    /// owner. No-op once the circuit is closed.
    pub(crate) fn on_socket_error(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let _ = self.events.send(CircuitEvent::Closed {
            address: self.address(),
            reason: DisconnectType::SocketError,
        });
        // Runs outside the receive task, which disconnect aborts
        let circuit = Arc::clone(self);
        tokio::spawn(async move { circuit.disconnect(false).await });
    }

    fn spawn_tick_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.settings.network_tick_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(circuit) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = circuit.flush_acks().await {
                    debug!("Ack flush to {} failed: {}", circuit.address(), e);
                }
                circuit.resend_unacked().await;
            }
        })
    }

    fn spawn_ping_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let period = self.settings.ping_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(circuit) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = circuit.send_ping().await {
                    debug!("Ping to {} failed: {}", circuit.address(), e);
                }
            }
        })
    }

    /// Attach the capability overlay for this simulator. A different seed
    /// replaces the running overlay.
    pub async fn set_seed_caps(self: &Arc<Self>, seed: Url) -> NetworkResult<()> {
        if !self.settings.enable_caps {
            debug!("Capabilities disabled, ignoring seed for {}", self.address());
            return Ok(());
        }

        let previous = self.caps.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(previous) = previous {
            if previous.seed_url() == &seed && previous.is_running() {
                *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(previous);
                return Ok(());
            }
            if previous.seed_url() != &seed {
                warn!(
                    "Seed capability for {} changed from {} to {}",
                    self.address(),
                    previous.seed_url(),
                    seed
                );
            }
            previous.close();
        }

        let caps = Caps::open(seed, Arc::clone(&self.settings), self.inbox.clone(), Arc::downgrade(self)).await?;
        if self.closed.load(Ordering::Acquire) {
            caps.close();
            return Err(NetworkError::ConnectionLost { address: self.address() });
        }
        *self.caps.lock().unwrap_or_else(PoisonError::into_inner) = Some(caps);
        Ok(())
    }

    pub fn caps(&self) -> Option<Arc<Caps>> {
        self.caps.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Resolve a named capability advertised by this simulator's seed
    pub fn capability_uri(&self, name: &str) -> Option<Url> {
        self.caps()?.capability_uri(name)
    }

    /// Tear the circuit down. Only the first call does anything.
    pub async fn disconnect(&self, send_close: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Disconnecting from simulator {}", self.endpoint);

        let tasks = std::mem::take(&mut *self.tasks_guard());
        for task in tasks {
            task.abort();
        }

        let caps = self.caps.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(caps) = caps {
            caps.close();
        }

        if send_close {
            match PacketSerializer::build_outbound(&CloseCircuit) {
                Ok(outgoing) => {
                    for packet in outgoing {
                        if let Err(e) = self.transmit(packet).await {
                            debug!("CloseCircuit to {} failed: {}", self.address(), e);
                        }
                    }
                }
                Err(e) => debug!("Could not build CloseCircuit: {}", e),
            }
        }

        self.set_state(CircuitState::Disconnected);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            task.abort();
        }
    }
}

/// Weak handle used by the capability overlay to reach its circuit
pub type CircuitRef = Weak<Circuit>;

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight(sequence: u32, sent_at: Instant) -> InFlightPacket {
        InFlightPacket {
            data: Bytes::from(vec![0x40, 0, 0, 0, sequence as u8, 0, 0x01]),
            sequence,
            sent_at,
            resend_count: 0,
            packet_type: PacketType::UseCircuitCode,
        }
    }

    #[test]
    fn test_duplicate_detection_window() {
        let mut ack = Acknowledger::new(3);
        assert!(ack.record_inbound(1));
        assert!(!ack.record_inbound(1));
        assert!(ack.record_inbound(2));
        assert!(ack.record_inbound(3));
        assert!(ack.record_inbound(4));
        // 1 fell out of the window
        assert!(ack.record_inbound(1));
        assert!(!ack.record_inbound(4));
    }

    #[test]
    fn test_resend_exactly_max_times_then_drop() {
        let mut ack = Acknowledger::new(16);
        let timeout = Duration::from_millis(100);
        let start = Instant::now();
        ack.track(in_flight(7, start));

        // not overdue yet
        assert!(ack.collect_resends(start + Duration::from_millis(50), timeout, 3).resend.is_empty());

        let mut now = start;
        for round in 1..=3u32 {
            now += timeout;
            let sweep = ack.collect_resends(now, timeout, 3);
            assert_eq!(sweep.resend.len(), 1, "round {}", round);
            let (sequence, data) = &sweep.resend[0];
            assert_eq!(*sequence, 7);
            assert_ne!(data[0] & PacketFlags::RESENT.bits(), 0);
            assert!(sweep.abandoned.is_empty());
        }

        now += timeout;
        let sweep = ack.collect_resends(now, timeout, 3);
        assert!(sweep.resend.is_empty());
        assert_eq!(sweep.abandoned, vec![(7, PacketType::UseCircuitCode)]);
        assert_eq!(ack.in_flight_len(), 0);

        now += timeout;
        let sweep = ack.collect_resends(now, timeout, 3);
        assert!(sweep.resend.is_empty() && sweep.abandoned.is_empty());
    }

    #[test]
    fn test_double_ack_is_noop() {
        let mut ack = Acknowledger::new(16);
        let now = Instant::now();
        ack.track(in_flight(3, now));
        ack.track(in_flight(5, now));
        assert_eq!(ack.oldest_unacked(), Some(3));

        assert!(ack.acknowledge(3));
        assert!(!ack.acknowledge(3));
        assert_eq!(ack.oldest_unacked(), Some(5));
        assert_eq!(ack.in_flight_len(), 1);
    }

    #[test]
    fn test_oldest_unacked_across_sequence_wrap() {
        let mut ack = Acknowledger::new(16);
        let now = Instant::now();
        ack.track(in_flight(MAX_SEQUENCE - 1, now));
        ack.track(in_flight(MAX_SEQUENCE, now));
        ack.track(in_flight(1, now));
        ack.track(in_flight(2, now));
        assert_eq!(ack.oldest_unacked(), Some(MAX_SEQUENCE - 1));

        assert!(ack.acknowledge(MAX_SEQUENCE));
        assert_eq!(ack.oldest_unacked(), Some(MAX_SEQUENCE - 1));
        assert!(ack.acknowledge(MAX_SEQUENCE - 1));
        assert_eq!(ack.oldest_unacked(), Some(1));

        let sweep = ack.collect_resends(now + Duration::from_secs(1), Duration::from_millis(1), 0);
        assert_eq!(sweep.abandoned.len(), 2);
        assert_eq!(ack.oldest_unacked(), None);
    }

    #[test]
    fn test_pending_acks_take_and_requeue() {
        let mut ack = Acknowledger::new(16);
        for sequence in [10, 11, 12, 11] {
            ack.queue_ack(sequence);
        }
        assert_eq!(ack.pending_ack_count(), 3);

        let taken = ack.take_acks(2);
        assert_eq!(taken, vec![10, 11]);
        ack.queue_ack(13);
        ack.requeue_acks(taken);
        assert_eq!(ack.take_acks(usize::MAX), vec![10, 11, 12, 13]);
    }

    #[test]
    fn test_sequencer_wraps_to_one() {
        let mut sequencer = Sequencer { next: MAX_SEQUENCE };
        assert_eq!(sequencer.next(), MAX_SEQUENCE);
        assert_eq!(sequencer.next(), 1);
    }

    #[test]
    fn test_ping_tracker_lag() {
        let mut pings = PingTracker::default();
        let start = Instant::now();
        let id = pings.start_ping(start);
        assert_eq!(pings.start_ping(start), id.wrapping_add(1));
        assert_eq!(pings.complete_ping(id, start + Duration::from_millis(40)), Some(Duration::from_millis(40)));
        assert_eq!(pings.complete_ping(id, start), None);
        assert_eq!(pings.last_lag, Some(Duration::from_millis(40)));
    }
}
