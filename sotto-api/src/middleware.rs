//! Admission helpers and security-header middleware

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue, Uri},
    middleware::Next,
    response::Response,
};
use std::net::{IpAddr, SocketAddr};

/// Maximum nickname length in Unicode scalar values.
pub const MAX_NICKNAME_CHARS: usize = 12;

/// Trim and validate a nickname from the join query.
pub fn normalize_nickname(raw: &str) -> Result<String, &'static str> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("missing name");
    }
    if name.chars().count() > MAX_NICKNAME_CHARS {
        return Err("name too long");
    }
    Ok(name.to_string())
}

/// Derive the client IP. Forwarding headers are only honored when the
/// immediate peer is a loopback or private address (a trusted proxy).
pub fn client_ip(headers: &HeaderMap, remote: SocketAddr) -> String {
    let remote_ip = remote.ip();
    if is_trusted_proxy(remote_ip) {
        if let Some(real_ip) = header_str(headers, "x-real-ip") {
            if let Ok(ip) = real_ip.trim().parse::<IpAddr>() {
                return ip.to_string();
            }
        }
        if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
            for candidate in forwarded.split(',') {
                if let Ok(ip) = candidate.trim().parse::<IpAddr>() {
                    return ip.to_string();
                }
            }
        }
    }
    remote_ip.to_string()
}

fn is_trusted_proxy(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        // Loopback or a unique-local address (fc00::/7).
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

/// Cross-origin upgrade check: when an Origin header is present, its host
/// must match the request host (respecting `X-Forwarded-Host`) and its
/// scheme must match `X-Forwarded-Proto` when that is set.
pub fn check_origin(headers: &HeaderMap) -> bool {
    let Some(origin) = header_str(headers, "origin") else {
        return true;
    };
    let Ok(origin_uri) = origin.trim().parse::<Uri>() else {
        return false;
    };
    let Some(origin_host) = origin_uri.host() else {
        return false;
    };

    let req_host = request_host(headers);
    if req_host.is_empty() || origin_host.is_empty() {
        return false;
    }
    if !req_host.eq_ignore_ascii_case(origin_host) {
        return false;
    }
    if let Some(proto) = header_str(headers, "x-forwarded-proto") {
        return origin_uri
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case(proto));
    }
    true
}

/// The request host without any port, preferring `X-Forwarded-Host`.
pub fn request_host(headers: &HeaderMap) -> String {
    strip_port(&raw_request_host(headers))
}

/// The request host as sent (port kept), preferring `X-Forwarded-Host`.
fn raw_request_host(headers: &HeaderMap) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-host") {
        if let Some(first) = forwarded.split(',').next() {
            return first.trim().to_string();
        }
    }
    header_str(headers, "host")
        .map(|h| h.trim().to_string())
        .unwrap_or_default()
}

pub fn strip_port(host: &str) -> String {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        // Bracketed IPv6 literal, with or without a port.
        return match rest.find(']') {
            Some(end) => rest[..end].to_string(),
            None => rest.to_string(),
        };
    }
    match host.rsplit_once(':') {
        Some((name, port))
            if !name.contains(':') && !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            name.to_string()
        }
        _ => host.to_string(),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
}

/// Attach the standard security headers to every non-WS response.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let csp = build_csp(req.headers());
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "permissions-policy",
        HeaderValue::from_static("microphone=(self)"),
    );
    if let Ok(value) = HeaderValue::from_str(&csp) {
        headers.insert("content-security-policy", value);
    }
    response
}

fn build_csp(headers: &HeaderMap) -> String {
    let host = raw_request_host(headers);
    let connect_src = if host.is_empty() {
        "'self' stun: turn: turns:".to_string()
    } else {
        format!("'self' ws://{host} wss://{host} stun: turn: turns:")
    };
    [
        "default-src 'self'".to_string(),
        "base-uri 'self'".to_string(),
        "frame-ancestors 'none'".to_string(),
        "form-action 'self'".to_string(),
        "script-src 'self'".to_string(),
        "style-src 'self' 'unsafe-inline'".to_string(),
        "img-src 'self' data:".to_string(),
        "media-src 'self' blob:".to_string(),
        format!("connect-src {connect_src}"),
    ]
    .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::header::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_normalize_nickname() {
        assert_eq!(normalize_nickname("  alice  ").unwrap(), "alice");
        assert!(normalize_nickname("").is_err());
        assert!(normalize_nickname("   ").is_err());
        assert!(normalize_nickname(&"a".repeat(MAX_NICKNAME_CHARS + 1)).is_err());
        // Length is counted in scalar values, not bytes.
        assert!(normalize_nickname(&"ü".repeat(MAX_NICKNAME_CHARS)).is_ok());
        assert!(normalize_nickname(&"ü".repeat(MAX_NICKNAME_CHARS + 1)).is_err());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8443"), "::1");
        assert_eq!(strip_port("[::1]"), "::1");
    }

    #[test]
    fn test_request_host_prefers_forwarded() {
        let map = headers(&[
            ("host", "origin.example.com:8443"),
            ("x-forwarded-host", "forwarded.example.com:443, proxy.example.com"),
        ]);
        assert_eq!(request_host(&map), "forwarded.example.com");

        let map = headers(&[("host", "origin.example.com:8443")]);
        assert_eq!(request_host(&map), "origin.example.com");
    }

    #[test]
    fn test_check_origin() {
        let map = headers(&[("host", "example.com"), ("origin", "https://example.com")]);
        assert!(check_origin(&map));

        let map = headers(&[("host", "example.com"), ("origin", "https://evil.com")]);
        assert!(!check_origin(&map));

        let map = headers(&[
            ("host", "example.com"),
            ("origin", "http://example.com"),
            ("x-forwarded-proto", "https"),
        ]);
        assert!(!check_origin(&map));

        let map = headers(&[("host", "example.com")]);
        assert!(check_origin(&map));
    }

    #[test]
    fn test_client_ip() {
        let trusted: SocketAddr = "10.0.0.1:1234".parse().unwrap();
        let untrusted: SocketAddr = "8.8.8.8:1234".parse().unwrap();

        let map = headers(&[("x-real-ip", "203.0.113.5")]);
        assert_eq!(client_ip(&map, trusted), "203.0.113.5");

        let map = headers(&[("x-forwarded-for", "bad-ip, 198.51.100.7")]);
        assert_eq!(client_ip(&map, trusted), "198.51.100.7");

        let map = headers(&[
            ("x-real-ip", "203.0.113.9"),
            ("x-forwarded-for", "198.51.100.9"),
        ]);
        assert_eq!(client_ip(&map, untrusted), "8.8.8.8");

        assert_eq!(client_ip(&HeaderMap::new(), trusted), "10.0.0.1");
    }

    #[test]
    fn test_csp_includes_request_host() {
        let map = headers(&[("host", "chat.example.com:8443")]);
        let csp = build_csp(&map);
        assert!(csp.contains("connect-src 'self' ws://chat.example.com:8443 wss://chat.example.com:8443 stun: turn: turns:"));
        assert!(csp.contains("frame-ancestors 'none'"));
    }
}
