use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

const CONFIG_FILE: &str = "network.toml";

/// Environment variables with this prefix override file settings,
/// e.g. `SLV_NET__RESEND_TIMEOUT_MS=2000`
const ENV_PREFIX: &str = "SLV_NET";

// =============================================================================
// Network Configuration
// =============================================================================

/// Every tunable the transport reads. Loaded once at startup and handed to
/// `NetworkManager::new`; nothing in the networking layer reads global state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    /// How long `connect` waits for the first datagram from a simulator
    pub login_timeout_ms: u64,
    /// Per-request timeout for plain simulator operations
    pub simulator_timeout_ms: u64,
    /// How long logout waits for LogoutReply before forcing shutdown
    pub logout_timeout_ms: u64,
    /// Age after which an unacknowledged reliable packet is resent
    pub resend_timeout_ms: u64,
    /// Resends allowed before a reliable packet is abandoned
    pub max_resend_count: u32,
    /// Period of the ack-flush / resend sweep
    pub network_tick_interval_ms: u64,
    /// Pending acks that force an immediate PacketAck
    pub max_pending_acks: usize,
    /// Upper bound on acks piggy-backed on one outbound datagram
    pub max_appended_acks: usize,
    /// Capacity of the duplicate-detection ring
    pub recent_sequence_capacity: usize,
    pub ping_interval_ms: u64,
    /// Watchdog period; a circuit silent for two periods is dropped
    pub sim_disconnect_interval_ms: u64,
    pub inbox_capacity: usize,
    pub outbox_capacity: usize,
    /// Poll timeout of the worker queues, bounds shutdown latency
    pub queue_poll_timeout_ms: u64,
    pub throttle_outgoing: bool,
    /// Minimum gap between two throttled sends
    pub outbound_send_interval_ms: u64,
    pub enable_caps: bool,
    pub caps_timeout_ms: u64,
    pub caps_retry_delay_ms: u64,
    /// Client-side limit on one event queue poll; must exceed the
    /// simulator's hold time. Expiry counts as a failure.
    pub event_queue_timeout_ms: u64,
    /// Consecutive event queue failures before the overlay gives up
    pub caps_max_failures: u32,
    /// Send CloseCircuit when a circuit is torn down
    pub send_close_circuit: bool,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            login_timeout_ms: 60_000,
            simulator_timeout_ms: 30_000,
            logout_timeout_ms: 5_000,
            resend_timeout_ms: 4_000,
            max_resend_count: 3,
            network_tick_interval_ms: 500,
            max_pending_acks: 10,
            max_appended_acks: 10,
            recent_sequence_capacity: 200,
            ping_interval_ms: 2_000,
            sim_disconnect_interval_ms: 30_000,
            inbox_capacity: 1024,
            outbox_capacity: 1024,
            queue_poll_timeout_ms: 100,
            throttle_outgoing: true,
            outbound_send_interval_ms: 10,
            enable_caps: true,
            caps_timeout_ms: 30_000,
            caps_retry_delay_ms: 2_000,
            event_queue_timeout_ms: 60_000,
            caps_max_failures: 5,
            send_close_circuit: true,
        }
    }
}

impl NetworkSettings {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn simulator_timeout(&self) -> Duration {
        Duration::from_millis(self.simulator_timeout_ms)
    }

    pub fn logout_timeout(&self) -> Duration {
        Duration::from_millis(self.logout_timeout_ms)
    }

    pub fn resend_timeout(&self) -> Duration {
        Duration::from_millis(self.resend_timeout_ms)
    }

    pub fn network_tick_interval(&self) -> Duration {
        Duration::from_millis(self.network_tick_interval_ms)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn sim_disconnect_interval(&self) -> Duration {
        Duration::from_millis(self.sim_disconnect_interval_ms)
    }

    pub fn queue_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_poll_timeout_ms)
    }

    pub fn outbound_send_interval(&self) -> Duration {
        Duration::from_millis(self.outbound_send_interval_ms)
    }

    pub fn caps_timeout(&self) -> Duration {
        Duration::from_millis(self.caps_timeout_ms)
    }

    pub fn caps_retry_delay(&self) -> Duration {
        Duration::from_millis(self.caps_retry_delay_ms)
    }

    pub fn event_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.event_queue_timeout_ms)
    }
}

// Configuration file management
pub fn settings_path() -> Option<PathBuf> {
    ProjectDirs::from("com", "slv", "slv-net")
        .map(|proj| proj.config_dir().join(CONFIG_FILE))
}

/// Layered load: built-in defaults, then the TOML file (if present), then
/// `SLV_NET__*` environment variables.
pub fn load_settings_from(path: Option<&Path>) -> Result<NetworkSettings, config::ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        debug!("Loading network settings from {}", path.display());
        builder = builder.add_source(config::File::from(path).required(false));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );
    builder.build()?.try_deserialize::<NetworkSettings>()
}

/// Load settings from the platform config directory, falling back to
/// defaults when the file is missing or unreadable.
pub fn load_settings() -> NetworkSettings {
    let path = settings_path();
    match load_settings_from(path.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Failed to load network settings, using defaults: {}", e);
            NetworkSettings::default()
        }
    }
}

pub fn save_settings_to(settings: &NetworkSettings, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let toml = toml::to_string_pretty(settings)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, toml)
}

pub fn save_settings(settings: &NetworkSettings) -> std::io::Result<()> {
    if let Some(path) = settings_path() {
        save_settings_to(settings, &path)?;
    }
    Ok(())
}
