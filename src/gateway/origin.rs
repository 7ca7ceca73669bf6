//! Browser origin checks for the control UI
//!
//! A browser-originated upgrade is accepted only when one of these holds:
//!
//! - the Origin is on the configured allowlist
//! - the Origin host and the Host header are both loopback
//! - the Origin authority equals the Host header, and the Host header is
//!   itself an allowed host (loopback or `allowed_hosts`)
//!
//! The Host check in the last rule is what stops DNS rebinding: an attacker
//! page served from `evil.example` that rebinds to 127.0.0.1 sends
//! `Host: evil.example`, which is neither loopback nor allowlisted.

use std::net::IpAddr;

use url::Url;

use crate::config::ControlUiConfig;

/// Why a browser origin was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginRejection {
    /// Origin header could not be parsed
    Malformed(String),
    /// Origin is neither allowlisted nor same-host
    NotAllowed(String),
}

impl std::fmt::Display for OriginRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginRejection::Malformed(origin) => write!(f, "malformed origin: {}", origin),
            OriginRejection::NotAllowed(origin) => write!(f, "origin not allowed: {}", origin),
        }
    }
}

/// Validate a browser connection. Requests without an Origin header are not
/// browser-originated and pass through to regular authentication.
pub fn check_browser_origin(
    origin: Option<&str>,
    host_header: Option<&str>,
    config: &ControlUiConfig,
) -> Result<(), OriginRejection> {
    let Some(origin) = origin else {
        return Ok(());
    };

    let trimmed = origin.trim_end_matches('/');
    if config
        .allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(trimmed))
    {
        return Ok(());
    }

    let parsed = Url::parse(origin).map_err(|_| OriginRejection::Malformed(origin.to_string()))?;
    let Some(origin_host) = parsed.host_str() else {
        return Err(OriginRejection::Malformed(origin.to_string()));
    };

    let Some(host_header) = host_header else {
        return Err(OriginRejection::NotAllowed(origin.to_string()));
    };
    let header_host = strip_port(host_header);

    if is_loopback_host(origin_host) && is_loopback_host(header_host) {
        return Ok(());
    }

    let origin_authority = match parsed.port() {
        Some(port) => format!("{}:{}", origin_host, port),
        None => origin_host.to_string(),
    };
    let host_allowed = is_loopback_host(header_host)
        || config
            .allowed_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(header_host));

    if host_allowed && origin_authority.eq_ignore_ascii_case(host_header) {
        return Ok(());
    }

    Err(OriginRejection::NotAllowed(origin.to_string()))
}

/// Literal loopback check. Names that merely look local
/// (`localhost.evil.com`, `127.0.0.1.nip.io`) are not loopback.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false)
}

/// Drop the port from a Host header value, keeping IPv6 brackets intact
fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &host[..end + 2],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
