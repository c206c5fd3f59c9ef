//! Per-provider probe throttling
//!
//! Each origin host gets a mutual-exclusion gate so at most one probe is in
//! flight against a given provider at a time. Gates are created lazily and
//! cached for the process lifetime; only the map insertion itself is
//! guarded by a separate lock. Throttling is host-only: two logical
//! providers sharing a host will be over-throttled, which is a known
//! limitation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;
use url::Url;

const UNKNOWN_PROVIDER: &str = "unknown-provider";

/// Derive the throttling key from a stream URL: the network location
/// (host, plus port when present).
pub fn provider_for_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => match parsed.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            },
            None => UNKNOWN_PROVIDER.to_string(),
        },
        Err(_) => UNKNOWN_PROVIDER.to_string(),
    }
}

#[derive(Default)]
pub struct ProviderThrottle {
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProviderThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the gate for a provider, waiting until any in-flight probe
    /// against the same provider finishes. The returned guard releases the
    /// gate on drop.
    pub async fn acquire(&self, provider: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self
                .gates
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            gates
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        debug!("Waiting for provider gate: {}", provider);
        gate.lock_owned().await
    }
}
