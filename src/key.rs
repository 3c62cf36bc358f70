use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Key reported when no client identity can be derived at all.
pub const UNKNOWN_KEY: &str = "unknown";

/// Derives the client key a request is limited under.
///
/// Precedence: `x-real-ip`, first `x-forwarded-for` entry, socket remote
/// address, `"unknown"`. Proxy headers are spoofable by clients that reach
/// the server directly, so honoring them is a construction-time choice
/// rather than a hard-coded default.
#[derive(Clone, Debug)]
pub struct KeyExtractor {
    trust_proxy: bool,
}

impl KeyExtractor {
    pub fn new(trust_proxy: bool) -> Self {
        Self { trust_proxy }
    }

    pub fn extract(&self, headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
        if self.trust_proxy {
            if let Some(real_ip) = header_value(headers, "x-real-ip") {
                return real_ip;
            }

            if let Some(forwarded) = header_value(headers, "x-forwarded-for") {
                // Proxies append to the list; the first entry is the client.
                if let Some(first) = forwarded.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }

        remote
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_KEY.to_string())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
}
