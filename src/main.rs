use anyhow::{bail, Context};
use slv_net::networking::{DispatchKey, SimulatorEndpoint};
use slv_net::utils::logging::init_logging;
use slv_net::{load_settings, AgentSession, NetworkError, NetworkEvent, NetworkManager, APP_NAME, VERSION};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

const USAGE: &str = "usage: slv-net <sim-ip:port> <circuit-code> <agent-id> <session-id> [seed-capability-url]";

struct Args {
    sim: SocketAddr,
    session: AgentSession,
    seed: Option<Url>,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 4 || args.len() > 5 {
        bail!(USAGE);
    }

    let sim = args[0].parse().with_context(|| format!("invalid simulator address '{}'", args[0]))?;
    let circuit_code = args[1].parse().with_context(|| format!("invalid circuit code '{}'", args[1]))?;
    let agent_id = Uuid::parse_str(&args[2]).context("invalid agent id")?;
    let session_id = Uuid::parse_str(&args[3]).context("invalid session id")?;
    let seed = args.get(4).map(|s| Url::parse(s)).transpose().context("invalid seed capability URL")?;

    Ok(Args { sim, session: AgentSession::new(agent_id, session_id, circuit_code), seed })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging(None, None)?;
    info!("{} {}", APP_NAME, VERSION);

    let args = parse_args()?;
    let settings = load_settings();
    let manager = NetworkManager::new(settings, args.session);

    manager.register_fn(DispatchKey::Default, "trace_all", |event, circuit| async move {
        tracing::debug!("{} from {}", event.name(), circuit.address());
        Ok::<(), NetworkError>(())
    });

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(NetworkEvent::Disconnected { reason }) => warn!("Disconnected: {}", reason),
                Ok(other) => info!("{:?}", other),
                Err(broadcast::error::RecvError::Lagged(missed)) => warn!("Missed {} network events", missed),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let circuit = manager
        .connect(SimulatorEndpoint::new(args.sim, 0), true, args.seed)
        .await
        .with_context(|| format!("connecting to {}", args.sim))?;
    info!("Connected to {}, press Ctrl-C to log out", circuit.endpoint());

    tokio::signal::ctrl_c().await?;
    let reason = manager.logout().await?;
    info!("Logged out ({})", reason);
    Ok(())
}
