//! HTTP Client Factory
//!
//! Builds the shared reqwest client used by streaming providers.

use std::time::Duration;

/// Build a `reqwest::Client` tuned for long-lived streaming responses.
///
/// Connect and request timeouts are separated: connects fail fast, while the
/// body read has no overall deadline (chunk inactivity is enforced by the
/// stream consumer instead).
pub fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .build()
        .unwrap_or_default()
}
