//! Network Manager - orchestrates circuits, workers and dispatch
//!
//! The manager owns every circuit, the subscriber registry and the four
//! process-wide workers: inbound dispatch, outbound rate limiting, the
//! disconnect watchdog and the circuit-event pump. Workers start with the
//! first circuit and stop when the last one closes.
//!
//! Locking: `circuits` is taken before `current` whenever both are needed.

use crate::config::NetworkSettings;
use crate::networking::capabilities::Llsd;
use crate::networking::circuit::{Circuit, CircuitEvent};
use crate::networking::handlers::{
    DispatchKey, FnHandler, HandlerId, Inbound, IncomingEvent, PacketHandler, PacketHandlerRegistry,
};
use crate::networking::packets::{
    CompleteAgentMovement, EnableSimulator, KickUser, LogoutReply, LogoutRequest, Packet, PacketType,
    RegionHandshake, RegionHandshakeReply,
};
use crate::networking::serialization::{OutgoingPacket, PacketSerializer};
use crate::networking::session::{AgentSession, SimulatorEndpoint};
use crate::networking::{NetworkError, NetworkResult};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

/// Why a circuit or the whole session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectType {
    /// Logout or an explicit disconnect
    ClientInitiated,
    /// Kicked, or the simulator disabled itself
    ServerInitiated,
    /// Watchdog or logout timeout
    NetworkTimeout,
    SocketError,
}

impl fmt::Display for DisconnectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectType::ClientInitiated => "client initiated",
            DisconnectType::ServerInitiated => "server initiated",
            DisconnectType::NetworkTimeout => "network timeout",
            DisconnectType::SocketError => "socket error",
        };
        f.write_str(text)
    }
}

/// Network manager events
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// Circuit connected
    SimConnected { endpoint: SimulatorEndpoint },
    /// The default simulator changed
    CurrentSimChanged { endpoint: SimulatorEndpoint },
    /// Circuit disconnected
    SimDisconnected { address: SocketAddr, reason: DisconnectType },
    /// Every circuit is gone
    Disconnected { reason: DisconnectType },
}

/// Packet types sent immediately instead of through the rate limiter
fn is_urgent(packet_type: PacketType) -> bool {
    matches!(
        packet_type,
        PacketType::PacketAck
            | PacketType::LogoutRequest
            | PacketType::StartPingCheck
            | PacketType::CompletePingCheck
            | PacketType::CloseCircuit
    )
}

struct Outbound {
    circuit: Arc<Circuit>,
    packet: OutgoingPacket,
}

/// Channels and tasks of one worker generation
struct Workers {
    inbox: mpsc::Sender<Inbound>,
    outbox: mpsc::Sender<Outbound>,
    circuit_events: mpsc::UnboundedSender<CircuitEvent>,
    shutdown: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Central network manager coordinating all networking operations
pub struct NetworkManager {
    settings: Arc<NetworkSettings>,
    session: AgentSession,
    registry: Arc<PacketHandlerRegistry>,

    /// Active circuits by address
    circuits: RwLock<HashMap<SocketAddr, Arc<Circuit>>>,
    /// Default circuit, the agent's region
    current: RwLock<Option<Arc<Circuit>>>,

    workers: Mutex<Option<Workers>>,
    logout_waiter: Mutex<Option<oneshot::Sender<()>>>,
    event_tx: broadcast::Sender<NetworkEvent>,
}

impl NetworkManager {
    pub fn new(settings: NetworkSettings, session: AgentSession) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(64);
        let manager = Arc::new(Self {
            settings: Arc::new(settings),
            session,
            registry: Arc::new(PacketHandlerRegistry::new()),
            circuits: RwLock::new(HashMap::new()),
            current: RwLock::new(None),
            workers: Mutex::new(None),
            logout_waiter: Mutex::new(None),
            event_tx,
        });
        manager.register_internal_handlers();
        manager
    }

    pub fn settings(&self) -> &NetworkSettings {
        &self.settings
    }

    pub fn session(&self) -> &AgentSession {
        &self.session
    }

    pub fn registry(&self) -> &Arc<PacketHandlerRegistry> {
        &self.registry
    }

    /// Subscribe to network events
    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: NetworkEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    pub fn register_callback(&self, key: impl Into<DispatchKey>, handler: Arc<dyn PacketHandler>) -> HandlerId {
        self.registry.register(key.into(), handler)
    }

    /// Register an async closure
    pub fn register_fn<F, Fut>(&self, key: impl Into<DispatchKey>, name: &str, f: F) -> HandlerId
    where
        F: Fn(IncomingEvent, Arc<Circuit>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NetworkResult<()>> + Send + 'static,
    {
        self.registry.register(key.into(), Arc::new(FnHandler::new(name, f)))
    }

    pub fn unregister_callback(&self, key: &DispatchKey, id: HandlerId) -> bool {
        self.registry.unregister(key, id)
    }

    // -------------------------------------------------------------------------
    // Circuits
    // -------------------------------------------------------------------------

    /// Connect to a simulator, or return the live circuit already open to
    /// it. `make_default` moves the agent there.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: SimulatorEndpoint,
        make_default: bool,
        seed_caps: Option<Url>,
    ) -> NetworkResult<Arc<Circuit>> {
        let existing = self.circuits.read().await.get(&endpoint.address).cloned();
        let circuit = match existing {
            Some(circuit) if !circuit.is_closed() => {
                debug!("Reusing circuit to {}", endpoint);
                circuit
            }
            _ => self.open_circuit(endpoint).await?,
        };

        if let Some(seed) = seed_caps {
            // UDP keeps working without capabilities
            if let Err(e) = circuit.set_seed_caps(seed).await {
                warn!("Capabilities for {} unavailable: {}", endpoint, e);
            }
        }

        if make_default {
            self.set_current(&circuit).await;
            let movement = CompleteAgentMovement {
                agent_id: self.session.agent_id,
                session_id: self.session.session_id,
                circuit_code: self.session.circuit_code,
            };
            self.send_packet_to(&movement, &circuit).await?;
        }

        Ok(circuit)
    }

    async fn open_circuit(self: &Arc<Self>, endpoint: SimulatorEndpoint) -> NetworkResult<Arc<Circuit>> {
        let (inbox, circuit_events) = self.ensure_workers();
        let circuit = match Circuit::connect(
            endpoint,
            self.session,
            Arc::clone(&self.settings),
            inbox,
            circuit_events,
        )
        .await
        {
            Ok(circuit) => circuit,
            Err(e) => {
                if self.circuits.read().await.is_empty() {
                    self.stop_workers();
                }
                return Err(e);
            }
        };

        let replaced = self.circuits.write().await.insert(endpoint.address, Arc::clone(&circuit));
        if let Some(stale) = replaced {
            stale.disconnect(false).await;
        }
        self.emit(NetworkEvent::SimConnected { endpoint });
        Ok(circuit)
    }

    async fn set_current(&self, circuit: &Arc<Circuit>) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, circuit)) {
            return;
        }
        info!("Current simulator is now {}", circuit.endpoint());
        *current = Some(Arc::clone(circuit));
        self.emit(NetworkEvent::CurrentSimChanged { endpoint: circuit.endpoint() });
    }

    pub async fn current_circuit(&self) -> Option<Arc<Circuit>> {
        self.current.read().await.clone()
    }

    pub async fn circuit(&self, address: SocketAddr) -> Option<Arc<Circuit>> {
        self.circuits.read().await.get(&address).cloned()
    }

    pub async fn circuits(&self) -> Vec<Arc<Circuit>> {
        self.circuits.read().await.values().cloned().collect()
    }

    /// Capability from the current simulator's seed
    pub async fn capability_uri(&self, name: &str) -> Option<Url> {
        self.current_circuit().await?.capability_uri(name)
    }

    /// Close one circuit at the client's request
    pub async fn disconnect_simulator(self: &Arc<Self>, address: SocketAddr) {
        self.disconnect_sim(address, DisconnectType::ClientInitiated).await;
    }

    /// Remove and close a circuit. Losing the current one ends the session.
    async fn disconnect_sim(&self, address: SocketAddr, reason: DisconnectType) {
        let Some(circuit) = self.circuits.write().await.remove(&address) else {
            return;
        };
        let was_current = {
            let mut current = self.current.write().await;
            if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &circuit)) {
                *current = None;
                true
            } else {
                false
            }
        };

        info!("Disconnecting simulator {} ({})", circuit.endpoint(), reason);
        circuit
            .disconnect(self.settings.send_close_circuit && reason != DisconnectType::SocketError)
            .await;
        self.emit(NetworkEvent::SimDisconnected { address, reason });

        if was_current {
            self.shutdown(reason).await;
        } else if self.circuits.read().await.is_empty() {
            self.stop_workers();
        }
    }

    /// Close every circuit and stop the workers
    pub async fn shutdown(&self, reason: DisconnectType) {
        let circuits: Vec<Arc<Circuit>> = self.circuits.write().await.drain().map(|(_, c)| c).collect();
        let had_current = self.current.write().await.take().is_some();

        if circuits.is_empty() && !had_current {
            self.stop_workers();
            return;
        }

        info!("Shutting down network ({}), {} circuits", reason, circuits.len());
        let send_close = self.settings.send_close_circuit && reason != DisconnectType::SocketError;
        for circuit in circuits {
            circuit.disconnect(send_close).await;
            self.emit(NetworkEvent::SimDisconnected { address: circuit.address(), reason });
        }

        self.stop_workers();
        self.emit(NetworkEvent::Disconnected { reason });
    }

    /// Send `LogoutRequest` on the current circuit and wait for the reply.
    /// Returns how the session ended.
    pub async fn logout(&self) -> NetworkResult<DisconnectType> {
        let circuit = self.current_circuit().await.ok_or(NetworkError::NotConnected)?;

        let (tx, rx) = oneshot::channel();
        *self.logout_waiter.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);

        info!("Logging out from {}", circuit.endpoint());
        let request = LogoutRequest { agent_id: self.session.agent_id, session_id: self.session.session_id };
        if let Err(e) = self.send_packet_to(&request, &circuit).await {
            self.logout_waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
            return Err(e);
        }

        let reason = match tokio::time::timeout(self.settings.logout_timeout(), rx).await {
            Ok(Ok(())) => DisconnectType::ClientInitiated,
            _ => {
                warn!("No LogoutReply within {:?}", self.settings.logout_timeout());
                self.logout_waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
                DisconnectType::NetworkTimeout
            }
        };
        self.shutdown(reason).await;
        Ok(reason)
    }

    // -------------------------------------------------------------------------
    // Sending
    // -------------------------------------------------------------------------

    /// Send on the current circuit
    pub async fn send_packet<P: Packet>(&self, packet: &P) -> NetworkResult<()> {
        let circuit = self.current_circuit().await.ok_or(NetworkError::NotConnected)?;
        self.send_packet_to(packet, &circuit).await
    }

    /// Send on a specific circuit. Non-urgent packets go through the rate
    /// limiter when throttling is on.
    pub async fn send_packet_to<P: Packet>(&self, packet: &P, circuit: &Arc<Circuit>) -> NetworkResult<()> {
        if circuit.is_closed() {
            return Err(NetworkError::NotConnected);
        }
        let outgoing = PacketSerializer::build_outbound(packet)?;

        let outbox = if self.settings.throttle_outgoing && !is_urgent(P::TYPE) {
            self.outbox()
        } else {
            None
        };

        match outbox {
            Some(outbox) => {
                for packet in outgoing {
                    let item = Outbound { circuit: Arc::clone(circuit), packet };
                    match outbox.send_timeout(item, self.settings.simulator_timeout()).await {
                        Ok(()) => {}
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            return Err(NetworkError::QueueFull { queue: "outbound" })
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => return Err(NetworkError::NotConnected),
                    }
                }
            }
            None => {
                for packet in outgoing {
                    if let Err(e) = circuit.send_prepared(packet).await {
                        if e.is_transport_fatal() {
                            circuit.on_socket_error();
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Workers
    // -------------------------------------------------------------------------

    fn workers_guard(&self) -> std::sync::MutexGuard<'_, Option<Workers>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbox(&self) -> Option<mpsc::Sender<Outbound>> {
        self.workers_guard().as_ref().map(|w| w.outbox.clone())
    }

    pub fn workers_running(&self) -> bool {
        self.workers_guard().is_some()
    }

    /// Start the workers if needed; returns the channels a new circuit needs
    fn ensure_workers(self: &Arc<Self>) -> (mpsc::Sender<Inbound>, mpsc::UnboundedSender<CircuitEvent>) {
        let mut workers = self.workers_guard();
        if let Some(workers) = workers.as_ref() {
            return (workers.inbox.clone(), workers.circuit_events.clone());
        }

        debug!("Starting network workers");
        let (inbox, inbox_rx) = mpsc::channel(self.settings.inbox_capacity.max(1));
        let (outbox, outbox_rx) = mpsc::channel(self.settings.outbox_capacity.max(1));
        let (circuit_events, events_rx) = mpsc::unbounded_channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let poll = self.settings.queue_poll_timeout();

        let tasks = vec![
            tokio::spawn(dispatch_worker(Arc::clone(&self.registry), inbox_rx, Arc::clone(&shutdown), poll)),
            tokio::spawn(outbox_worker(outbox_rx, Arc::clone(&shutdown), Arc::clone(&self.settings))),
            tokio::spawn(watchdog_worker(Arc::downgrade(self), Arc::clone(&shutdown), Arc::clone(&self.settings))),
            tokio::spawn(event_pump(Arc::downgrade(self), events_rx, Arc::clone(&shutdown), poll)),
        ];

        let channels = (inbox.clone(), circuit_events.clone());
        *workers = Some(Workers { inbox, outbox, circuit_events, shutdown, tasks });
        channels
    }

    /// Signal the workers; each exits within one poll timeout
    fn stop_workers(&self) {
        if let Some(workers) = self.workers_guard().take() {
            debug!("Stopping network workers");
            workers.shutdown.store(true, Ordering::Release);
        }
    }

    async fn watchdog_tick(&self) {
        for circuit in self.circuits().await {
            if circuit.mark_disconnect_candidate() {
                warn!(
                    "Nothing from {} for {:?}, dropping it",
                    circuit.endpoint(),
                    self.settings.sim_disconnect_interval()
                );
                self.disconnect_sim(circuit.address(), DisconnectType::NetworkTimeout).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Built-in handlers
    // -------------------------------------------------------------------------

    fn on<F, Fut>(self: &Arc<Self>, key: impl Into<DispatchKey>, name: &str, f: F)
    where
        F: Fn(Arc<NetworkManager>, IncomingEvent, Arc<Circuit>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = NetworkResult<()>> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.register_fn(key, name, move |event, circuit| {
            let pending = weak.upgrade().map(|manager| f(manager, event, circuit));
            async move {
                match pending {
                    Some(fut) => fut.await,
                    None => Ok(()),
                }
            }
        });
    }

    fn register_internal_handlers(self: &Arc<Self>) {
        self.on(PacketType::EnableSimulator, "enable_simulator", on_enable_simulator);
        self.on(
            DispatchKey::Message("EnableSimulator".to_string()),
            "enable_simulator_message",
            on_enable_simulator_message,
        );
        self.on(PacketType::DisableSimulator, "disable_simulator", on_disable_simulator);
        self.on(
            DispatchKey::Message("DisableSimulator".to_string()),
            "disable_simulator_message",
            on_disable_simulator,
        );
        self.on(
            DispatchKey::Message("EstablishAgentCommunication".to_string()),
            "establish_agent_communication",
            on_establish_agent_communication,
        );
        self.on(PacketType::KickUser, "kick_user", on_kick_user);
        self.on(PacketType::LogoutReply, "logout_reply", on_logout_reply);
        self.on(PacketType::RegionHandshake, "region_handshake", on_region_handshake);
    }

    /// Connect to a neighbour without blocking the dispatcher
    fn spawn_neighbour(self: &Arc<Self>, endpoint: SimulatorEndpoint, seed_caps: Option<Url>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.connect(endpoint, false, seed_caps).await {
                warn!("Failed to enable simulator {}: {}", endpoint, e);
            }
        });
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        if let Some(workers) = self.workers.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            workers.shutdown.store(true, Ordering::Release);
            for task in workers.tasks {
                task.abort();
            }
        }
    }
}

async fn on_enable_simulator(
    manager: Arc<NetworkManager>,
    event: IncomingEvent,
    _circuit: Arc<Circuit>,
) -> NetworkResult<()> {
    if let Some(enable) = event.downcast_ref::<EnableSimulator>() {
        let endpoint = SimulatorEndpoint::new(SocketAddr::from((enable.ip, enable.port)), enable.handle);
        info!("Enabling neighbour simulator {}", endpoint);
        manager.spawn_neighbour(endpoint, None);
    }
    Ok(())
}

async fn on_enable_simulator_message(
    manager: Arc<NetworkManager>,
    event: IncomingEvent,
    _circuit: Arc<Circuit>,
) -> NetworkResult<()> {
    let Some(message) = event.message() else {
        return Ok(());
    };
    let endpoint = parse_enable_simulator(&message.body).ok_or_else(|| NetworkError::Handler {
        reason: "EnableSimulator message without usable SimulatorInfo".to_string(),
    })?;
    info!("Enabling neighbour simulator {} (event queue)", endpoint);
    manager.spawn_neighbour(endpoint, None);
    Ok(())
}

async fn on_disable_simulator(
    manager: Arc<NetworkManager>,
    _event: IncomingEvent,
    circuit: Arc<Circuit>,
) -> NetworkResult<()> {
    info!("Simulator {} disabled itself", circuit.endpoint());
    manager.disconnect_sim(circuit.address(), DisconnectType::ServerInitiated).await;
    Ok(())
}

async fn on_establish_agent_communication(
    manager: Arc<NetworkManager>,
    event: IncomingEvent,
    _circuit: Arc<Circuit>,
) -> NetworkResult<()> {
    let Some(message) = event.message() else {
        return Ok(());
    };
    let address = message
        .body
        .get("sim-ip-and-port")
        .and_then(Llsd::as_str)
        .and_then(|s| s.parse::<SocketAddr>().ok());
    let seed = message
        .body
        .get("seed-capability")
        .and_then(Llsd::as_str)
        .and_then(|s| Url::parse(s).ok());
    let (Some(address), Some(seed)) = (address, seed) else {
        return Err(NetworkError::Handler {
            reason: "EstablishAgentCommunication without address or seed".to_string(),
        });
    };

    match manager.circuit(address).await {
        Some(target) => {
            tokio::spawn(async move {
                if let Err(e) = target.set_seed_caps(seed).await {
                    warn!("Capabilities for {} unavailable: {}", target.address(), e);
                }
            });
        }
        None => debug!("Seed capability for unknown simulator {}", address),
    }
    Ok(())
}

async fn on_kick_user(manager: Arc<NetworkManager>, event: IncomingEvent, _circuit: Arc<Circuit>) -> NetworkResult<()> {
    if let Some(kick) = event.downcast_ref::<KickUser>() {
        warn!("Kicked by the grid: {}", kick.reason);
    }
    manager.shutdown(DisconnectType::ServerInitiated).await;
    Ok(())
}

async fn on_logout_reply(manager: Arc<NetworkManager>, event: IncomingEvent, _circuit: Arc<Circuit>) -> NetworkResult<()> {
    let Some(reply) = event.downcast_ref::<LogoutReply>() else {
        return Ok(());
    };
    if !manager.session.matches(reply.agent_id, reply.session_id) {
        warn!("LogoutReply for another session, ignoring");
        return Ok(());
    }
    let waiter = manager.logout_waiter.lock().unwrap_or_else(PoisonError::into_inner).take();
    match waiter {
        Some(tx) => {
            let _ = tx.send(());
        }
        None => debug!("Unsolicited LogoutReply"),
    }
    Ok(())
}

async fn on_region_handshake(
    manager: Arc<NetworkManager>,
    event: IncomingEvent,
    circuit: Arc<Circuit>,
) -> NetworkResult<()> {
    if let Some(handshake) = event.downcast_ref::<RegionHandshake>() {
        info!("Region handshake from {} ({})", handshake.sim_name, circuit.address());
    }
    let reply = RegionHandshakeReply {
        agent_id: manager.session.agent_id,
        session_id: manager.session.session_id,
        flags: 0,
    };
    manager.send_packet_to(&reply, &circuit).await
}

/// Endpoint from an event-queue `EnableSimulator` body
pub fn parse_enable_simulator(body: &Llsd) -> Option<SimulatorEndpoint> {
    let info = body.get("SimulatorInfo")?.as_array()?.first()?;
    let handle: [u8; 8] = info.get("Handle")?.as_binary()?.try_into().ok()?;
    let ip: [u8; 4] = info.get("IP")?.as_binary()?.try_into().ok()?;
    let port = u16::try_from(info.get("Port")?.as_integer()?).ok()?;
    Some(SimulatorEndpoint::new(
        SocketAddr::from((Ipv4Addr::from(ip), port)),
        u64::from_be_bytes(handle),
    ))
}

async fn dispatch_worker(
    registry: Arc<PacketHandlerRegistry>,
    mut inbox: mpsc::Receiver<Inbound>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while let Some(inbound) = next_item(&mut inbox, &shutdown, poll).await {
        registry.dispatch(inbound).await;
    }
    debug!("Dispatch worker stopped");
}

async fn outbox_worker(mut outbox: mpsc::Receiver<Outbound>, shutdown: Arc<AtomicBool>, settings: Arc<NetworkSettings>) {
    while let Some(Outbound { circuit, packet }) = next_item(&mut outbox, &shutdown, settings.queue_poll_timeout()).await {
        if circuit.is_closed() {
            continue;
        }
        let packet_type = packet.packet_type;
        if let Err(e) = circuit.send_prepared(packet).await {
            warn!("Send of {} to {} failed: {}", packet_type, circuit.address(), e);
            if e.is_transport_fatal() {
                circuit.on_socket_error();
            }
        }
        if settings.throttle_outgoing {
            tokio::time::sleep(settings.outbound_send_interval()).await;
        }
    }
    debug!("Outbox worker stopped");
}

async fn watchdog_worker(manager: Weak<NetworkManager>, shutdown: Arc<AtomicBool>, settings: Arc<NetworkSettings>) {
    let period = settings.sim_disconnect_interval();
    let mut last_check = Instant::now();

    while !shutdown.load(Ordering::Acquire) {
        tokio::time::sleep(settings.queue_poll_timeout().min(period)).await;
        if last_check.elapsed() < period {
            continue;
        }
        last_check = Instant::now();

        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.watchdog_tick().await;
    }
    debug!("Watchdog stopped");
}

async fn event_pump(
    manager: Weak<NetworkManager>,
    mut events: mpsc::UnboundedReceiver<CircuitEvent>,
    shutdown: Arc<AtomicBool>,
    poll: Duration,
) {
    while !shutdown.load(Ordering::Acquire) {
        let event = match tokio::time::timeout(poll, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => continue,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            CircuitEvent::Closed { address, reason } => {
                error!("Circuit to {} closed: {}", address, reason);
                manager.disconnect_sim(address, reason).await;
            }
        }
    }
    debug!("Circuit event pump stopped");
}

/// Next queue item, or `None` once shut down or closed
async fn next_item<T>(rx: &mut mpsc::Receiver<T>, shutdown: &AtomicBool, poll: Duration) -> Option<T> {
    loop {
        if shutdown.load(Ordering::Acquire) {
            return None;
        }
        if let Ok(item) = tokio::time::timeout(poll, rx.recv()).await {
            return item;
        }
    }
}
