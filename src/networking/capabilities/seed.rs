//! Seed capability request
//!
//! The seed URL handed out at login (or in an `EnableSimulator` event)
//! answers a POSTed list of capability names with a map of name to URL.

use super::llsd::Llsd;
use super::CapabilityError;
use std::collections::HashMap;
use tracing::{debug, info, warn};
use url::Url;

pub const LLSD_CONTENT_TYPE: &str = "application/llsd+xml";

/// Capabilities asked for in every seed request
pub const REQUESTED_CAPABILITIES: &[&str] = &[
    "AgentPreferences",
    "ChatSessionRequest",
    "DispatchRegionInfo",
    "EnvironmentSettings",
    "EventQueueGet",
    "FetchInventory2",
    "FetchInventoryDescendents2",
    "GetDisplayNames",
    "HomeLocation",
    "MapLayer",
    "ObjectMedia",
    "ParcelPropertiesUpdate",
    "ProvisionVoiceAccountRequest",
    "SimulatorFeatures",
    "UntrustedSimulatorMessage",
    "UpdateAgentInformation",
    "UpdateAgentLanguage",
    "ViewerAsset",
    "ViewerStats",
];

/// LLSD-XML array of the names to request
pub fn capability_request_body(names: &[&str]) -> String {
    Llsd::Array(names.iter().map(|name| Llsd::from(*name)).collect()).to_xml()
}

/// Extract `name -> url` pairs from a seed response. Entries whose value is
/// not a valid URL are skipped.
pub fn parse_seed_response(text: &str) -> Result<HashMap<String, Url>, CapabilityError> {
    let doc = Llsd::from_xml(text)?;
    let map = doc
        .as_map()
        .ok_or_else(|| CapabilityError::Parse("seed response is not a map".to_string()))?;

    let mut capabilities = HashMap::with_capacity(map.len());
    for (name, value) in map {
        let Some(raw) = value.as_str() else {
            debug!("Capability {} has no URL, skipping", name);
            continue;
        };
        match Url::parse(raw) {
            Ok(url) => {
                capabilities.insert(name.clone(), url);
            }
            Err(e) => warn!("Capability {} has invalid URL '{}': {}", name, raw, e),
        }
    }
    Ok(capabilities)
}

/// POST the wanted names to the seed capability and return what the
/// simulator granted
pub async fn fetch_capabilities(
    client: &reqwest::Client,
    seed: &Url,
    names: &[&str],
) -> Result<HashMap<String, Url>, CapabilityError> {
    debug!("Requesting {} capabilities from {}", names.len(), seed);

    let response = client
        .post(seed.clone())
        .header(reqwest::header::CONTENT_TYPE, LLSD_CONTENT_TYPE)
        .header(reqwest::header::ACCEPT, LLSD_CONTENT_TYPE)
        .body(capability_request_body(names))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(CapabilityError::HttpStatus(status.as_u16(), seed.to_string()));
    }

    let text = response.text().await?;
    let capabilities = parse_seed_response(&text)?;
    info!("Seed capability {} granted {} capabilities", seed, capabilities.len());
    Ok(capabilities)
}
