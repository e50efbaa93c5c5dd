// SLV-Net: Second Life simulator transport in Rust
// Reliable UDP circuits, packet dispatch and the capability overlay

pub mod utils;
pub mod networking;
pub mod config;

// Re-export commonly used types for convenience
pub use config::{NetworkSettings, load_settings, save_settings};
pub use networking::{
    AgentSession, Circuit, DisconnectType, NetworkError, NetworkEvent, NetworkManager,
    NetworkResult, SimulatorEndpoint,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
