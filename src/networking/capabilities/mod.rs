//! HTTP capabilities for a simulator
//!
//! A seed capability resolves named HTTP endpoints; if the simulator grants
//! `EventQueueGet`, server-pushed messages are long-polled and fed into the
//! same inbound queue as UDP packets.

use crate::config::NetworkSettings;
use crate::networking::circuit::CircuitRef;
use crate::networking::handlers::Inbound;
use event_queue::EventQueue;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

pub mod event_queue;
pub mod llsd;
pub mod seed;

pub use llsd::{Llsd, LlsdError};

/// Errors that can occur in the capabilities system
#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP status {0} from {1}")]
    HttpStatus(u16, String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("LLSD error: {0}")]
    Llsd(#[from] LlsdError),
}

/// Common capability names
pub mod well_known_capabilities {
    pub const EVENT_QUEUE_GET: &str = "EventQueueGet";
    pub const GET_DISPLAY_NAMES: &str = "GetDisplayNames";
    pub const SIMULATOR_FEATURES: &str = "SimulatorFeatures";
}

/// Capability overlay for one circuit
pub struct Caps {
    seed_url: Url,
    capabilities: HashMap<String, Url>,
    running: Arc<AtomicBool>,
    event_queue: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Caps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caps")
            .field("seed_url", &self.seed_url.as_str())
            .field("capabilities", &self.capabilities.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Caps {
    /// Resolve the seed and start the event queue if one is granted
    pub async fn open(
        seed_url: Url,
        settings: Arc<NetworkSettings>,
        inbox: mpsc::Sender<Inbound>,
        circuit: CircuitRef,
    ) -> Result<Arc<Caps>, CapabilityError> {
        let mut builder = reqwest::Client::builder().timeout(settings.caps_timeout());
        if is_loopback(&seed_url) {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        let capabilities = seed::fetch_capabilities(&client, &seed_url, seed::REQUESTED_CAPABILITIES).await?;

        let running = Arc::new(AtomicBool::new(false));
        let event_queue = match capabilities.get(well_known_capabilities::EVENT_QUEUE_GET) {
            Some(url) => {
                running.store(true, Ordering::Release);
                let queue = EventQueue {
                    client,
                    url: url.clone(),
                    settings,
                    inbox,
                    circuit,
                    running: Arc::clone(&running),
                };
                Some(tokio::spawn(queue.run()))
            }
            None => {
                warn!("Seed {} granted no event queue", seed_url);
                None
            }
        };

        info!("Capabilities ready for seed {}", seed_url);
        Ok(Arc::new(Caps {
            seed_url,
            capabilities,
            running,
            event_queue: Mutex::new(event_queue),
        }))
    }

    pub fn seed_url(&self) -> &Url {
        &self.seed_url
    }

    pub fn capability_uri(&self, name: &str) -> Option<Url> {
        self.capabilities.get(name).cloned()
    }

    pub fn require(&self, name: &str) -> Result<Url, CapabilityError> {
        self.capability_uri(name)
            .ok_or_else(|| CapabilityError::CapabilityNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.capabilities.keys().map(String::as_str)
    }

    /// False once the event queue has stopped, either closed or given up
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.event_queue.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

fn is_loopback(url: &Url) -> bool {
    match url.host() {
        Some(url::Host::Ipv4(ip)) => ip.is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.is_loopback(),
        Some(url::Host::Domain(name)) => name.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}

impl Drop for Caps {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_seed_hosts() {
        assert!(is_loopback(&Url::parse("http://127.0.0.1:9000/seed").unwrap()));
        assert!(is_loopback(&Url::parse("http://localhost/seed").unwrap()));
        assert!(is_loopback(&Url::parse("http://[::1]:8080/").unwrap()));
        assert!(!is_loopback(&Url::parse("https://sim1.agni.lindenlab.com:12043/cap/x").unwrap()));
    }
}
