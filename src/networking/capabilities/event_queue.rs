//! EventQueueGet long-poll loop
//!
//! Each request carries the id of the last batch received (`ack`); the
//! simulator holds it open until it has events or its own timeout fires.
//! A 502/504 is that timeout and counts as an empty poll; a request that
//! outlives `event_queue_timeout` on our side is a failure.

use super::llsd::Llsd;
use super::seed::LLSD_CONTENT_TYPE;
use super::CapabilityError;
use crate::config::NetworkSettings;
use crate::networking::circuit::CircuitRef;
use crate::networking::handlers::{CapsMessage, Inbound, IncomingEvent};
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Result of one poll
#[derive(Debug, PartialEq)]
pub(crate) enum Poll {
    Events { id: Option<i32>, messages: Vec<CapsMessage> },
    /// Server timeout, nothing to deliver
    Idle,
}

pub(crate) struct EventQueue {
    pub client: reqwest::Client,
    pub url: Url,
    pub settings: Arc<NetworkSettings>,
    pub inbox: mpsc::Sender<Inbound>,
    pub circuit: CircuitRef,
    pub running: Arc<AtomicBool>,
}

impl EventQueue {
    pub async fn run(self) {
        info!("Event queue polling {}", self.url);
        let mut ack: Option<i32> = None;
        let mut failures = 0u32;

        'poll: while self.running.load(Ordering::Acquire) {
            if self.circuit.strong_count() == 0 {
                break;
            }

            match self.poll(ack).await {
                Ok(Poll::Events { id, messages }) => {
                    failures = 0;
                    if id.is_some() {
                        ack = id;
                    }
                    for message in messages {
                        if !self.forward(message).await {
                            break 'poll;
                        }
                    }
                }
                Ok(Poll::Idle) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.caps_max_failures {
                        error!("Event queue {} failed {} times, giving up: {}", self.url, failures, e);
                        break;
                    }
                    warn!("Event queue {} poll failed ({}): {}", self.url, failures, e);
                    tokio::time::sleep(self.settings.caps_retry_delay()).await;
                }
            }
        }

        self.running.store(false, Ordering::Release);
        debug!("Event queue {} stopped", self.url);
    }

    async fn poll(&self, ack: Option<i32>) -> Result<Poll, CapabilityError> {
        let body = Llsd::map([
            ("ack", ack.map(Llsd::Integer).unwrap_or_default()),
            ("done", Llsd::Boolean(false)),
        ]);

        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.settings.event_queue_timeout())
            .header(reqwest::header::CONTENT_TYPE, LLSD_CONTENT_TYPE)
            .header(reqwest::header::ACCEPT, LLSD_CONTENT_TYPE)
            .body(body.to_xml())
            .send()
            .await?;

        match response.status() {
            StatusCode::BAD_GATEWAY | StatusCode::GATEWAY_TIMEOUT => return Ok(Poll::Idle),
            status if !status.is_success() => {
                return Err(CapabilityError::HttpStatus(status.as_u16(), self.url.to_string()))
            }
            _ => {}
        }

        let text = response.text().await?;
        parse_events(&text)
    }

    /// Queue one message for dispatch. False once the circuit is gone.
    async fn forward(&self, message: CapsMessage) -> bool {
        let Some(circuit) = self.circuit.upgrade() else {
            return false;
        };
        if circuit.is_closed() {
            return false;
        }
        trace!("Event queue message {} from {}", message.name, circuit.address());

        let name = message.name.clone();
        let inbound = Inbound { circuit, event: IncomingEvent::Message(message) };
        match self.inbox.send_timeout(inbound, self.settings.simulator_timeout()).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!("Inbox full, dropping event queue message {}", name);
                true
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => false,
        }
    }
}

/// Parse an event-queue response: `{ id, events: [{ message, body }] }`
pub(crate) fn parse_events(text: &str) -> Result<Poll, CapabilityError> {
    let doc = Llsd::from_xml(text)?;
    if doc.is_undefined() {
        return Ok(Poll::Idle);
    }

    let id = doc.get("id").and_then(Llsd::as_integer);
    let mut messages = Vec::new();
    for event in doc.get("events").and_then(Llsd::as_array).unwrap_or_default() {
        let Some(name) = event.get("message").and_then(Llsd::as_str) else {
            warn!("Event queue entry without a message name");
            continue;
        };
        messages.push(CapsMessage {
            name: name.to_string(),
            body: event.get("body").cloned().unwrap_or_default(),
        });
    }
    Ok(Poll::Events { id, messages })
}
