// SPDX-License-Identifier: MIT
//! Header policy for proxied requests.
//!
//! Hop-by-hop headers are dropped in both directions. Request-tracing
//! headers are synthesized. The caller's control-plane bearer is never
//! forwarded; when the worker fleet requires auth, a node-scoped credential
//! is substituted.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// RFC 7230 hop-by-hop headers (plus the proxy-* pair) — meaningful only on
/// a single transport link, never forwarded.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str().eq_ignore_ascii_case(h))
}

/// Build the header map for the upstream request.
///
/// Copies end-to-end headers from the client request, strips hop-by-hop and
/// `authorization`, then synthesizes forwarding and tracing headers.
pub fn upstream_headers(
    incoming: &HeaderMap,
    client_addr: &str,
    host: &str,
    request_id: &str,
    node_bearer: Option<&str>,
) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in incoming {
        if is_hop_by_hop(name) || name == axum::http::header::AUTHORIZATION || name == axum::http::header::HOST {
            continue;
        }
        out.append(name.clone(), value.clone());
    }

    insert_str(&mut out, "x-forwarded-for", client_addr);
    insert_str(&mut out, "x-forwarded-host", host);
    insert_str(&mut out, "x-forwarded-proto", "https");
    insert_str(&mut out, "x-request-id", request_id);

    if let Some(token) = node_bearer {
        insert_str(&mut out, "authorization", &format!("Bearer {token}"));
    }
    out
}

/// Strip hop-by-hop headers from an upstream response before relaying it.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn insert_str(map: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        map.insert(HeaderName::from_static(name), v);
    }
}

/// Fresh per-request identifier, attached to logs and forwarded upstream.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_authorization() {
        let mut incoming = HeaderMap::new();
        incoming.insert("connection", HeaderValue::from_static("keep-alive"));
        incoming.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        incoming.insert("authorization", HeaderValue::from_static("Bearer secret"));
        incoming.insert("content-type", HeaderValue::from_static("application/json"));

        let out = upstream_headers(&incoming, "1.2.3.4", "api.example.test", "req_x", None);
        assert!(out.get("connection").is_none());
        assert!(out.get("transfer-encoding").is_none());
        assert!(out.get("authorization").is_none());
        assert_eq!(out.get("content-type").unwrap(), "application/json");
        assert_eq!(out.get("x-forwarded-for").unwrap(), "1.2.3.4");
        assert_eq!(out.get("x-request-id").unwrap(), "req_x");
    }

    #[test]
    fn substitutes_node_scoped_credential() {
        let incoming = HeaderMap::new();
        let out = upstream_headers(&incoming, "1.2.3.4", "h", "req_x", Some("node-token"));
        assert_eq!(out.get("authorization").unwrap(), "Bearer node-token");
    }

    #[test]
    fn response_direction_strips_too() {
        let mut upstream = HeaderMap::new();
        upstream.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        upstream.insert("content-type", HeaderValue::from_static("text/event-stream"));
        let out = response_headers(&upstream);
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("content-type").is_some());
    }

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(new_request_id(), new_request_id());
        assert!(new_request_id().starts_with("req_"));
    }
}
