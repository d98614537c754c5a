use std::collections::HashMap;

use tracing::{debug, info};

use crate::client::DEFAULT_SERVICE_URL;

/// Result of store-proxy discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub url: String,
    /// Parsed `Snap-Store-Version`. `None` means the header was absent or
    /// not an integer; only integer values yield non-fallback behavior.
    pub version: Option<u32>,
}

impl ProxyInfo {
    /// Version 6 introduced header-directed forwarding.
    pub fn is_new_proxy(&self) -> bool {
        matches!(self.version, Some(v) if v >= 6)
    }
}

/// Where serial requests actually go, after config and proxy resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEndpoint {
    pub base_url: String,
    /// Headers added to every request against this endpoint.
    pub headers: HashMap<String, String>,
}

/// Combine a configured device-service URL with an optional store proxy.
///
/// - No proxy: talk to the configured URL (or the built-in default).
/// - New proxy (version ≥ 6): talk to the proxy, carrying the real service
///   URL in `X-Snap-Device-Service-URL` so the proxy can forward.
/// - Old proxy: the proxy exposes the device service under a fixed
///   sub-path.
pub fn resolve_endpoint(service_url: Option<&str>, proxy: Option<&ProxyInfo>) -> ServiceEndpoint {
    let service = service_url.unwrap_or(DEFAULT_SERVICE_URL).trim_end_matches('/');

    match proxy {
        None => ServiceEndpoint {
            base_url: service.to_string(),
            headers: HashMap::new(),
        },
        Some(p) if p.is_new_proxy() => {
            info!(proxy = %p.url, "using header-directed store proxy");
            let mut headers = HashMap::new();
            headers.insert(
                "X-Snap-Device-Service-URL".to_string(),
                format!("{}/", service),
            );
            ServiceEndpoint {
                base_url: p.url.trim_end_matches('/').to_string(),
                headers,
            }
        }
        Some(p) => {
            debug!(proxy = %p.url, version = ?p.version, "using legacy store proxy sub-path");
            ServiceEndpoint {
                base_url: format!("{}/v2/devices", p.url.trim_end_matches('/')),
                headers: HashMap::new(),
            }
        }
    }
}
