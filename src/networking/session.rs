//! Identity of the logged-in agent and of the simulators it talks to

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

/// Agent credentials handed back by login. The transport only needs the ids
/// and the circuit code to open circuits and to match LogoutReply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSession {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

impl AgentSession {
    pub fn new(agent_id: Uuid, session_id: Uuid, circuit_code: u32) -> Self {
        Self { agent_id, session_id, circuit_code }
    }

    /// True when `agent_id`/`session_id` belong to this session
    pub fn matches(&self, agent_id: Uuid, session_id: Uuid) -> bool {
        self.agent_id == agent_id && self.session_id == session_id
    }
}

/// One simulator: UDP address plus its region handle.
///
/// The handle packs the region's global grid coordinates (metres) as
/// `(x << 32) | y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimulatorEndpoint {
    pub address: SocketAddr,
    pub handle: u64,
}

impl SimulatorEndpoint {
    pub fn new(address: SocketAddr, handle: u64) -> Self {
        Self { address, handle }
    }

    pub fn from_grid_position(address: SocketAddr, global_x: u32, global_y: u32) -> Self {
        Self::new(address, ((global_x as u64) << 32) | global_y as u64)
    }

    pub fn grid_position(&self) -> (u32, u32) {
        ((self.handle >> 32) as u32, (self.handle & 0xFFFF_FFFF) as u32)
    }
}

impl fmt::Display for SimulatorEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (x, y) = self.grid_position();
        write!(f, "{} ({}, {})", self.address, x / 256, y / 256)
    }
}
