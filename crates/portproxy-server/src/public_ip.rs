//! One-shot discovery of the host's public IP address.

use portproxy_core::{ProxyError, ProxyResult};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Plain-text "what is my IP" service.
pub const DEFAULT_LOOKUP_URL: &str = "http://api.ipify.org";

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Ask `url` for the caller's public address. The body must be a bare IP.
///
/// # Errors
///
/// [`ProxyError::Resolve`] on any HTTP failure or an unparseable body.
pub async fn discover(url: &str) -> ProxyResult<IpAddr> {
    let fail = |reason: String| ProxyError::Resolve {
        target: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(LOOKUP_TIMEOUT)
        .build()
        .map_err(|e| fail(e.to_string()))?;
    let body = client
        .get(url)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .map_err(|e| fail(e.to_string()))?
        .text()
        .await
        .map_err(|e| fail(e.to_string()))?;

    let ip = body
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| fail(format!("unexpected response: {:?}", body.trim())))?;
    debug!(ip = %ip, "discovered own public ip");
    Ok(ip)
}

/// [`discover`], logging a failure and yielding `None` instead.
pub async fn discover_or_warn(url: &str) -> Option<IpAddr> {
    match discover(url).await {
        Ok(ip) => Some(ip),
        Err(e) => {
            warn!(error = %e, "could not discover own public ip; own-ip rule disabled");
            None
        }
    }
}
