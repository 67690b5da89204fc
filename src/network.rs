use chrono::Utc;
use if_addrs::get_if_addrs;
use std::time::Duration;
use tracing::{debug, trace};

/// Answers "can we reach the outside world right now?"
#[async_trait::async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn is_reachable(&self) -> bool;
}

/// Get network interfaces with error handling
fn get_interfaces() -> Result<Vec<if_addrs::Interface>, String> {
    get_if_addrs().map_err(|e| format!("Failed to enumerate network interfaces: {}", e))
}

/// Whether any interface other than loopback has an address
fn has_external_interface() -> bool {
    match get_interfaces() {
        Ok(interfaces) => interfaces.iter().any(|iface| !iface.is_loopback()),
        Err(e) => {
            debug!("{}", e);
            false
        }
    }
}

/// Append a cache-busting `_=<millis>` query parameter
fn cache_busted(url: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{}{}_={}", url, separator, millis)
}

/// Best-effort probe: local interface check first, then a HEAD request.
///
/// Any HTTP response counts as reachable; only transport failures do not.
pub struct HttpReachabilityProbe {
    client: reqwest::Client,
    probe_url: String,
}

impl HttpReachabilityProbe {
    pub fn new(probe_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, probe_url }
    }
}

#[async_trait::async_trait]
impl ReachabilityProbe for HttpReachabilityProbe {
    async fn is_reachable(&self) -> bool {
        if !has_external_interface() {
            trace!("No external network interface, skipping probe");
            return false;
        }

        let result = self
            .client
            .head(cache_busted(&self.probe_url))
            .header(reqwest::header::CACHE_CONTROL, "no-store")
            .send()
            .await;

        match result {
            Ok(_) => true,
            Err(e) => {
                debug!("Reachability probe failed: {}", e);
                false
            }
        }
    }
}
