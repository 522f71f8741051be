//! Header names with fixed meaning and header rewriting helpers

use http::header::{CONNECTION, UPGRADE};
use http::{HeaderMap, HeaderName, HeaderValue};

pub const X_APPLICATION_ID: HeaderName = HeaderName::from_static("x-application-id");
pub const X_INSTANCE_ID: HeaderName = HeaderName::from_static("x-instance-id");

pub const X_ROUTER_TRACE: HeaderName = HeaderName::from_static("x-router-trace");
pub const X_ROUTER_ADDRESS: HeaderName = HeaderName::from_static("x-router-address");
pub const X_ROUTER_BACKEND: HeaderName = HeaderName::from_static("x-router-backend");
pub const X_ROUTER_ERROR: HeaderName = HeaderName::from_static("x-router-error");

pub const X_ROUTE_FORWARDED_URL: HeaderName = HeaderName::from_static("x-route-forwarded-url");
pub const X_ROUTE_SIGNATURE: HeaderName = HeaderName::from_static("x-route-signature");
pub const X_ROUTE_METADATA: HeaderName = HeaderName::from_static("x-route-metadata");

pub const X_APP_INSTANCE: HeaderName = HeaderName::from_static("x-app-instance");
pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_REQUEST_START: HeaderName = HeaderName::from_static("x-request-start");
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
];

/// Remove hop-by-hop headers, including any named by `Connection`.
/// `Upgrade` is removed as well since upgraded requests never reach an HTTP
/// backend through this path.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(UPGRADE);
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// `Connection: upgrade` together with `Upgrade: tcp`
pub fn is_tcp_upgrade(headers: &HeaderMap) -> bool {
    header_has_token(headers, CONNECTION, "upgrade") && header_has_token(headers, UPGRADE, "tcp")
}

/// Echo router and backend addresses when the inbound trace header carries
/// the configured key
pub fn set_trace_headers(
    request_headers: &HeaderMap,
    response_headers: &mut HeaderMap,
    trace_key: &str,
    router_ip: &str,
    backend_addr: &str,
) {
    if trace_key.is_empty() {
        return;
    }
    let matches = request_headers
        .get(X_ROUTER_TRACE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == trace_key);
    if !matches {
        return;
    }

    if let Ok(value) = HeaderValue::from_str(router_ip) {
        response_headers.insert(X_ROUTER_ADDRESS, value);
    }
    if let Ok(value) = HeaderValue::from_str(backend_addr) {
        response_headers.insert(X_ROUTER_BACKEND, value);
    }
}
