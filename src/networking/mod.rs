//! Second Life simulator transport
//!
//! Reliable UDP circuits to one or more simulators, the packet codec, the
//! dispatch fabric feature managers subscribe to, and the HTTP capability
//! overlay that feeds server-pushed messages into the same dispatch path.

pub mod capabilities;
pub mod circuit;
pub mod handlers;
pub mod manager;
pub mod packets;
pub mod serialization;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use capabilities::{Caps, CapabilityError};
pub use circuit::{Circuit, CircuitState, CircuitStats};
pub use handlers::{DispatchKey, HandlerId, IncomingEvent, PacketHandler, PacketHandlerRegistry};
pub use manager::{DisconnectType, NetworkEvent, NetworkManager};
pub use packets::{AnyPacket, Packet, PacketFrequency, PacketType};
pub use serialization::{PacketFlags, PacketHeader, PacketSerializer};
pub use session::{AgentSession, SimulatorEndpoint};
pub use transport::UdpTransport;

// Error types
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Connection lost to {address}")]
    ConnectionLost { address: std::net::SocketAddr },

    #[error("Not connected to any simulator")]
    NotConnected,

    #[error("Handshake with {address} timed out")]
    HandshakeTimeout { address: std::net::SocketAddr },

    #[error("Datagram truncated: {reason}")]
    Truncated { reason: String },

    #[error("Unknown packet id {id} ({frequency:?})")]
    UnknownPacket { id: u16, frequency: PacketFrequency },

    #[error("Packet decode failed: {reason}")]
    PacketDecode { reason: String },

    #[error("Packet encode failed: {reason}")]
    PacketEncode { reason: String },

    #[error("{queue} queue is full")]
    QueueFull { queue: &'static str },

    #[error("Handler failed: {reason}")]
    Handler { reason: String },

    #[error("Capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetworkError {
    /// Errors that end the circuit they occur on, as opposed to errors local
    /// to a single packet or request. ICMP-driven socket errors are not.
    pub fn is_transport_fatal(&self) -> bool {
        match self {
            NetworkError::ConnectionLost { .. }
            | NetworkError::NotConnected
            | NetworkError::HandshakeTimeout { .. } => true,
            NetworkError::Io(e) => !transport::is_transient(e),
            _ => false,
        }
    }
}

pub type NetworkResult<T> = Result<T, NetworkError>;
