mod common;

use common::{eventually, fast_settings, test_session, FakeSim};
use slv_net::config::NetworkSettings;
use slv_net::networking::capabilities::Llsd;
use slv_net::networking::circuit::{Circuit, CircuitEvent};
use slv_net::networking::handlers::Inbound;
use slv_net::networking::packets::RegionHandshake;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use url::Url;

async fn connect(settings: NetworkSettings) -> (FakeSim, Arc<Circuit>, mpsc::Receiver<Inbound>, mpsc::UnboundedReceiver<CircuitEvent>) {
    let mut sim = FakeSim::bind().await;
    let (inbox_tx, inbox) = mpsc::channel(64);
    let (events_tx, events) = mpsc::unbounded_channel();
    let endpoint = sim.endpoint();
    let connecting = tokio::spawn(Circuit::connect(endpoint, test_session(), Arc::new(settings), inbox_tx, events_tx));
    sim.accept().await;
    sim.send(&RegionHandshake::default()).await;
    let circuit = connecting.await.unwrap().unwrap();
    (sim, circuit, inbox, events)
}

fn seed_response(base: &str) -> String {
    Llsd::map([
        ("EventQueueGet", Llsd::String(format!("{}/eq", base))),
        ("GetDisplayNames", Llsd::Uri(format!("{}/names", base))),
    ])
    .to_xml()
}

#[tokio::test]
async fn test_event_queue_messages_reach_the_inbox() {
    common::init();
    let polls = Arc::new(AtomicUsize::new(0));
    let acks = Arc::new(std::sync::Mutex::new(Vec::new()));

    let base = Arc::new(std::sync::OnceLock::<String>::new());
    let addr = {
        let base = Arc::clone(&base);
        let polls = Arc::clone(&polls);
        let acks = Arc::clone(&acks);
        common::serve_http(move |path, body| match path {
            "/seed" => {
                assert!(body.contains("<string>EventQueueGet</string>"));
                (200, seed_response(base.get().unwrap()), Duration::ZERO)
            }
            "/eq" => {
                let request = Llsd::from_xml(body).unwrap();
                acks.lock().unwrap().push(request.get("ack").cloned().unwrap_or_default());
                if polls.fetch_add(1, Ordering::SeqCst) == 0 {
                    let events = Llsd::map([
                        ("id", Llsd::Integer(1)),
                        (
                            "events",
                            Llsd::Array(vec![Llsd::map([
                                ("message", Llsd::from("ParcelProperties")),
                                ("body", Llsd::map([("LocalID", Llsd::Integer(12))])),
                            ])]),
                        ),
                    ]);
                    (200, events.to_xml(), Duration::ZERO)
                } else {
                    // a held long poll that times out server side
                    (502, String::new(), Duration::from_millis(100))
                }
            }
            _ => (404, String::new(), Duration::ZERO),
        })
        .await
    };
    base.set(format!("http://{}", addr)).unwrap();

    let (_sim, circuit, mut inbox, _events) = connect(fast_settings()).await;
    circuit.set_seed_caps(Url::parse(&format!("http://{}/seed", addr)).unwrap()).await.unwrap();

    assert_eq!(
        circuit.capability_uri("GetDisplayNames").map(|u| u.to_string()),
        Some(format!("http://{}/names", addr))
    );
    assert!(circuit.capability_uri("FetchInventory2").is_none());

    let message = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let inbound = inbox.recv().await.unwrap();
            if let Some(message) = inbound.event.message() {
                return message.clone();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(message.name, "ParcelProperties");
    assert_eq!(message.body.get("LocalID").and_then(Llsd::as_integer), Some(12));

    // 502 is not a failure: the queue keeps polling and acks batch 1
    assert!(eventually(Duration::from_secs(2), || polls.load(Ordering::SeqCst) >= 3).await);
    assert!(circuit.caps().unwrap().is_running());
    let acks = acks.lock().unwrap().clone();
    assert_eq!(acks[0], Llsd::Undefined);
    assert_eq!(acks[1], Llsd::Integer(1));
}

#[tokio::test]
async fn test_event_queue_gives_up_after_repeated_failures() {
    common::init();
    let base = Arc::new(std::sync::OnceLock::<String>::new());
    let addr = {
        let base = Arc::clone(&base);
        common::serve_http(move |path, _body| match path {
            "/seed" => (200, seed_response(base.get().unwrap()), Duration::ZERO),
            _ => (500, String::new(), Duration::ZERO),
        })
        .await
    };
    base.set(format!("http://{}", addr)).unwrap();

    let (_sim, circuit, _inbox, _events) = connect(fast_settings()).await;
    circuit.set_seed_caps(Url::parse(&format!("http://{}/seed", addr)).unwrap()).await.unwrap();

    let caps = circuit.caps().unwrap();
    assert!(eventually(Duration::from_secs(2), || !caps.is_running()).await);
    // degraded, not disconnected
    assert!(circuit.is_connected());
    assert!(circuit.capability_uri("GetDisplayNames").is_some());
}

#[tokio::test]
async fn test_event_queue_gives_up_when_polls_time_out() {
    common::init();
    let polls = Arc::new(AtomicUsize::new(0));
    let base = Arc::new(std::sync::OnceLock::<String>::new());
    let addr = {
        let base = Arc::clone(&base);
        let polls = Arc::clone(&polls);
        common::serve_http(move |path, _body| match path {
            "/seed" => (200, seed_response(base.get().unwrap()), Duration::ZERO),
            _ => {
                polls.fetch_add(1, Ordering::SeqCst);
                // accepts the poll and never answers in time
                (200, String::new(), Duration::from_secs(30))
            }
        })
        .await
    };
    base.set(format!("http://{}", addr)).unwrap();

    let settings = NetworkSettings { event_queue_timeout_ms: 100, ..fast_settings() };
    let (_sim, circuit, _inbox, _events) = connect(settings).await;
    circuit.set_seed_caps(Url::parse(&format!("http://{}/seed", addr)).unwrap()).await.unwrap();

    let caps = circuit.caps().unwrap();
    assert!(eventually(Duration::from_secs(2), || !caps.is_running()).await);
    assert_eq!(polls.load(Ordering::SeqCst), 2);
    assert!(circuit.is_connected());
}

#[tokio::test]
async fn test_seed_failure_is_an_error() {
    common::init();
    let addr = common::serve_http(|_path, _body| (404, String::new(), Duration::ZERO)).await;
    let (_sim, circuit, _inbox, _events) = connect(fast_settings()).await;

    let result = circuit.set_seed_caps(Url::parse(&format!("http://{}/seed", addr)).unwrap()).await;
    assert!(result.is_err());
    assert!(circuit.caps().is_none());
    assert!(circuit.is_connected());
}

#[tokio::test]
async fn test_caps_disabled_ignores_seed() {
    common::init();
    let settings = NetworkSettings { enable_caps: false, ..fast_settings() };
    let (_sim, circuit, _inbox, _events) = connect(settings).await;

    circuit.set_seed_caps(Url::parse("http://127.0.0.1:9/seed").unwrap()).await.unwrap();
    assert!(circuit.caps().is_none());
}
