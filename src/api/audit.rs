// src/api/audit.rs
//
// Request metadata captured alongside each payment.

use actix_web::HttpRequest;
use serde_json::json;
use uuid::Uuid;

use crate::models::AuditCapture;

const MAX_USER_AGENT: usize = 500;

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Client address behind Cloudflare or a reverse proxy, falling back to the peer.
pub fn client_address(req: &HttpRequest) -> Option<String> {
    header(req, "CF-Connecting-IP")
        .or_else(|| header(req, "X-Real-IP"))
        .or_else(|| {
            header(req, "X-Forwarded-For")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
        })
        .map(str::to_string)
        .or_else(|| req.peer_addr().map(|a| a.ip().to_string()))
}

fn browser(ua: &str) -> &'static str {
    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari.
    if ua.contains("Edg/") {
        "Edge"
    } else if ua.contains("OPR/") || ua.contains("Opera") {
        "Opera"
    } else if ua.contains("Firefox/") {
        "Firefox"
    } else if ua.contains("Chrome/") {
        "Chrome"
    } else if ua.contains("Safari/") {
        "Safari"
    } else {
        "Unknown"
    }
}

fn platform(ua: &str) -> &'static str {
    if ua.contains("Android") {
        "Android"
    } else if ua.contains("iPhone") || ua.contains("iPad") {
        "iOS"
    } else if ua.contains("Windows") {
        "Windows"
    } else if ua.contains("Mac OS") {
        "macOS"
    } else if ua.contains("Linux") {
        "Linux"
    } else {
        "Unknown"
    }
}

pub fn capture(req: &HttpRequest) -> AuditCapture {
    let user_agent = header(req, "User-Agent").map(|ua| ua.chars().take(MAX_USER_AGENT).collect::<String>());
    let device_info = user_agent.as_deref().map(|ua| {
        json!({
            "browser": browser(ua),
            "platform": platform(ua),
            "mobile": ua.contains("Mobile") || ua.contains("Android") || ua.contains("iPhone"),
        })
    });

    AuditCapture {
        client_address: client_address(req),
        user_agent,
        device_info,
        geo_country: header(req, "CF-IPCountry").map(str::to_string),
        geo_city: header(req, "CF-IPCity").map(str::to_string),
        session_id: Some(Uuid::new_v4().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn forwarded_for_uses_first_hop() {
        let req = TestRequest::default()
            .insert_header(("X-Forwarded-For", "203.0.113.9, 10.0.0.1"))
            .to_http_request();
        assert_eq!(client_address(&req).as_deref(), Some("203.0.113.9"));
    }

    #[test]
    fn cloudflare_header_wins() {
        let req = TestRequest::default()
            .insert_header(("CF-Connecting-IP", "198.51.100.4"))
            .insert_header(("X-Real-IP", "10.0.0.2"))
            .insert_header(("CF-IPCountry", "PH"))
            .to_http_request();
        let audit = capture(&req);
        assert_eq!(audit.client_address.as_deref(), Some("198.51.100.4"));
        assert_eq!(audit.geo_country.as_deref(), Some("PH"));
    }

    #[test]
    fn user_agent_is_truncated_and_classified() {
        let ua = format!("Mozilla/5.0 (Windows NT 10.0) Chrome/120.0 Safari/537.36 {}", "x".repeat(600));
        let req = TestRequest::default()
            .insert_header(("User-Agent", ua))
            .to_http_request();
        let audit = capture(&req);
        assert_eq!(audit.user_agent.unwrap().chars().count(), MAX_USER_AGENT);
        let info = audit.device_info.unwrap();
        assert_eq!(info["browser"], "Chrome");
        assert_eq!(info["platform"], "Windows");
    }
}
