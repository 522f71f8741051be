//! Inbound request pipeline
//!
//! Health check, protocol check, route lookup, then either an HTTP round
//! trip or, for `Upgrade: tcp`, a raw tunnel.

use crate::health::{health_response, HeartbeatFlag};
use crate::hijack::UpgradeHijacker;
use bytes::Bytes;
use http::header::{CONNECTION, HOST, UPGRADE, USER_AGENT};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode, Version};
use http_body_util::BodyExt;
use hyper::body::Body;
use routeway_proxy::headers::{
    is_tcp_upgrade, strip_hop_by_hop, X_APP_INSTANCE, X_FORWARDED_FOR, X_FORWARDED_PROTO,
    X_REQUEST_ID, X_REQUEST_START, X_ROUTER_ERROR,
};
use routeway_proxy::{empty_body, full_body, ProxyBody, ProxyRoundTripper};
use routeway_router::{RoutePool, RouteRegistry};
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const DEFAULT_HEALTH_CHECK_USER_AGENT: &str = "HTTP-Monitor/1.1";

pub struct RequestHandler {
    registry: Arc<RouteRegistry>,
    proxy: Arc<ProxyRoundTripper>,
    heartbeat: HeartbeatFlag,
    health_check_user_agent: String,
}

impl RequestHandler {
    pub fn new(
        registry: Arc<RouteRegistry>,
        proxy: Arc<ProxyRoundTripper>,
        heartbeat: HeartbeatFlag,
    ) -> Self {
        Self {
            registry,
            proxy,
            heartbeat,
            health_check_user_agent: DEFAULT_HEALTH_CHECK_USER_AGENT.to_string(),
        }
    }

    pub fn with_health_check_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.health_check_user_agent = user_agent.into();
        self
    }

    pub async fn handle<B>(&self, mut request: Request<B>, peer: SocketAddr) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Display,
    {
        if self.is_health_check(request.headers()) {
            return health_response(&self.heartbeat);
        }

        if !matches!(request.version(), Version::HTTP_10 | Version::HTTP_11) {
            return error_response(
                StatusCode::BAD_REQUEST,
                "unsupported_protocol",
                format!("400 Bad Request: Unsupported protocol {:?}", request.version()),
            );
        }

        let Some(host) = request_host(&request) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "empty_host",
                "400 Bad Request: Request had empty Host header".to_string(),
            );
        };
        let route = format!("{}{}", host, request.uri().path());

        let pool = match self.lookup(&route, request.headers()) {
            Ok(Some(pool)) => pool,
            Ok(None) => {
                debug!(route = %route, "unknown-route");
                return error_response(
                    StatusCode::NOT_FOUND,
                    "unknown_route",
                    format!("404 Not Found: Requested route ('{}') does not exist.", host),
                );
            }
            Err(response) => return response,
        };

        if is_tcp_upgrade(request.headers()) {
            return self.upgrade(&mut request, pool);
        }

        let (mut parts, body) = request.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(route = %route, error = %e, "request-body-read-failed");
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "bad_request",
                    "400 Bad Request: Failed to read request body".to_string(),
                );
            }
        };

        prepare_forwarded_headers(&mut parts.headers, peer);
        let outbound = Request::from_parts(parts, body);

        let mut response = self.proxy.round_trip(outbound, pool).await;
        strip_hop_by_hop(response.headers_mut());
        response
    }

    fn is_health_check(&self, headers: &HeaderMap) -> bool {
        headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|agent| agent == self.health_check_user_agent)
    }

    /// Pool for `route`, narrowed to one application instance when
    /// `X-App-Instance` is present
    #[allow(clippy::result_large_err)]
    fn lookup(
        &self,
        route: &str,
        headers: &HeaderMap,
    ) -> Result<Option<Arc<RoutePool>>, Response<ProxyBody>> {
        let Some(value) = headers.get(X_APP_INSTANCE) else {
            return Ok(self.registry.lookup(route));
        };

        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.split_once(':'))
            .filter(|(app, index)| !app.is_empty() && !index.is_empty());
        match parsed {
            Some((app_id, index)) => Ok(self.registry.lookup_with_instance(route, app_id, index)),
            None => Err(error_response(
                StatusCode::BAD_REQUEST,
                "invalid_app_instance_header",
                "400 Bad Request: Invalid X-App-Instance header".to_string(),
            )),
        }
    }

    /// Answer `101` and run the tunnel once hyper hands over the connection
    fn upgrade<B>(&self, request: &mut Request<B>, pool: Arc<RoutePool>) -> Response<ProxyBody> {
        let on_upgrade = hyper::upgrade::on(&mut *request);

        let mut tunnel_request = Request::new(Bytes::new());
        *tunnel_request.method_mut() = request.method().clone();
        *tunnel_request.uri_mut() = request.uri().clone();
        *tunnel_request.headers_mut() = request.headers().clone();

        let proxy = self.proxy.clone();
        tokio::spawn(async move {
            let hijacker = Box::new(UpgradeHijacker::new(on_upgrade));
            if let Err(e) = proxy.tunnel(tunnel_request, pool, hijacker).await {
                debug!(error = %e, "Tunnel ended with error");
            }
        });

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(UPGRADE, HeaderValue::from_static("tcp"));
        response
    }
}

fn request_host<B>(request: &Request<B>) -> Option<String> {
    request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .map(str::trim)
        .filter(|host| !host.is_empty())
        .map(str::to_string)
}

/// Strip hop-by-hop headers and add the forwarding headers backends expect
fn prepare_forwarded_headers(headers: &mut HeaderMap, peer: SocketAddr) {
    strip_hop_by_hop(headers);

    let client_ip = peer.ip().to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client_ip),
        None => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    let started_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    headers.insert(X_REQUEST_START, HeaderValue::from(started_ms as u64));

    if !headers.contains_key(X_REQUEST_ID) {
        let id = uuid::Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&id) {
            headers.insert(X_REQUEST_ID, value);
        }
    }
}

fn error_response(status: StatusCode, code: &'static str, message: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(X_ROUTER_ERROR, HeaderValue::from_static(code));
    response
}
