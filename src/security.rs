// SSRF defense: target URL validation for the API edge and the workers.
//
// The same policy runs twice per scan: once when the scan is submitted and
// again at browse/fetch time, so a DNS record that changes between submission
// and rendering cannot redirect the scanner into an internal network.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::Url;

use crate::error::AppError;

pub const LOCAL_ADDRESS_ERROR: &str = "Access to local addresses is not allowed";
pub const RESOLVE_ERROR: &str = "Failed to resolve target host";

/// IPv4 ranges that must never be scanned: 10/8, 127/8, 169.254/16,
/// 172.16/12, 192.168/16, plus the unspecified address.
pub fn is_private_ipv4(ip: &Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_unspecified()
        || octets[0] == 10
        || octets[0] == 127
        || (octets[0] == 169 && octets[1] == 254)
        || (octets[0] == 172 && (16..=31).contains(&octets[1]))
        || (octets[0] == 192 && octets[1] == 168)
}

/// IPv6 ranges that must never be scanned: ::1, fc00::/7, fe80::/10.
/// IPv4-mapped addresses are checked against the IPv4 ranges.
pub fn is_private_ipv6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() || ip.is_unspecified() {
        return true;
    }
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_private_ipv4(&v4);
    }
    let segments = ip.segments();
    // fc00::/7
    if (segments[0] & 0xfe00) == 0xfc00 {
        return true;
    }
    // fe80::/10
    if (segments[0] & 0xffc0) == 0xfe80 {
        return true;
    }
    false
}

pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_ipv4(v4),
        IpAddr::V6(v6) => is_private_ipv6(v6),
    }
}

/// Syntax-level checks: the URL must parse, the scheme must be http(s), and
/// the host must not be an obvious local name or private IP literal.
///
/// This is the synchronous half of the policy; `validate_target_url` adds
/// DNS resolution on top.
pub fn validate_url_syntax(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|_| AppError::Validation(format!("Invalid URL: {}", raw)))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(AppError::DisallowedTarget(format!(
                "unsupported scheme '{}'",
                other
            )));
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("URL has no host".to_string()))?;

    let lowered = host.to_ascii_lowercase();
    if lowered == "localhost" || lowered.ends_with(".localhost") {
        return Err(AppError::DisallowedTarget(LOCAL_ADDRESS_ERROR.to_string()));
    }

    // Literal IP hosts are rejected without a DNS round-trip.
    let bare = lowered.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        if is_private_ip(&ip) {
            return Err(AppError::DisallowedTarget(LOCAL_ADDRESS_ERROR.to_string()));
        }
    }

    Ok(url)
}

/// Full SSRF policy: syntax checks plus DNS resolution. A hostname is
/// rejected if *any* resolved address falls in a private range.
pub async fn validate_target_url(raw: &str) -> Result<Url, AppError> {
    let url = validate_url_syntax(raw)?;

    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("URL has no host".to_string()))?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        // Already vetted as a literal in validate_url_syntax.
        return Ok(url);
    }

    let addrs = tokio::net::lookup_host((bare, port))
        .await
        .map_err(|_| AppError::DisallowedTarget(RESOLVE_ERROR.to_string()))?;

    let mut resolved_any = false;
    for addr in addrs {
        resolved_any = true;
        if is_private_ip(&addr.ip()) {
            return Err(AppError::DisallowedTarget(LOCAL_ADDRESS_ERROR.to_string()));
        }
    }

    if !resolved_any {
        return Err(AppError::DisallowedTarget(RESOLVE_ERROR.to_string()));
    }

    Ok(url)
}
