//! Per-request orchestration over the round tripper family
//!
//! [`ProxyRoundTripper`] owns everything that outlives one request (transport,
//! configuration, reporter, route-service signer) and builds a fresh iterator
//! and round tripper for every request it serves.

use crate::error::ProxyError;
use crate::headers::{
    set_trace_headers, X_REQUEST_ID, X_ROUTER_ERROR, X_ROUTE_FORWARDED_URL, X_ROUTE_METADATA,
    X_ROUTE_SIGNATURE,
};
use crate::hijack::Hijacker;
use crate::reporter::{NullReporter, Reporter};
use crate::round_trippers::{AfterRoundTrip, RoundTripper, RoundTripperBuilder, RoundTripperKind};
use crate::sticky::{setup_sticky_session, sticky_instance};
use crate::transport::Transport;
use crate::{full_body, ProxyBody};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderValue, Method, Request, Response, StatusCode, Uri};
use routeway_router::{Endpoint, EndpointIterator, LoadBalance, PoolIterator, RoutePool};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Inbound `X-Router-Trace` value that unlocks trace headers; empty
    /// disables them
    pub trace_key: String,
    pub router_ip: String,
    pub secure_cookies: bool,
    pub load_balance: LoadBalance,
    /// Per-attempt deadline for HTTP round trips; zero disables it
    pub endpoint_timeout: Duration,
    pub dial_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            trace_key: String::new(),
            router_ip: String::new(),
            secure_cookies: false,
            load_balance: LoadBalance::RoundRobin,
            endpoint_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
        }
    }
}

/// Signs requests forwarded to a route service and recognizes them when they
/// come back
pub trait RouteServiceSigner: Send + Sync {
    /// `(signature, metadata)` for a request originally addressed to
    /// `forwarded_url`
    fn sign(&self, forwarded_url: &str) -> Result<(String, String), String>;

    fn validate(&self, signature: &str, metadata: &str) -> bool;
}

/// One finished request, as seen by the access log
#[derive(Debug, Clone)]
pub struct AccessRecord {
    pub method: Method,
    pub uri: Uri,
    pub host: String,
    pub request_id: Option<String>,
    pub status: StatusCode,
    /// Canonical address of the last endpoint tried, if any
    pub endpoint: Option<String>,
    pub error: Option<String>,
    pub duration: Duration,
}

pub type AccessHook = Arc<dyn Fn(&AccessRecord) + Send + Sync>;

/// Iterator decorator feeding attempts to the reporter
struct ReportingIterator {
    inner: PoolIterator,
    reporter: Arc<dyn Reporter>,
}

impl EndpointIterator for ReportingIterator {
    fn next(&mut self) -> Option<Arc<Endpoint>> {
        self.inner.next()
    }

    fn endpoint_failed(&mut self) {
        self.inner.endpoint_failed()
    }

    fn pre_request(&self, endpoint: &Endpoint) {
        self.reporter.capture_routing_request(endpoint);
        self.inner.pre_request(endpoint)
    }

    fn post_request(&self, endpoint: &Endpoint) {
        self.inner.post_request(endpoint)
    }
}

pub struct ProxyRoundTripper {
    transport: Arc<dyn Transport>,
    config: ProxyConfig,
    reporter: Arc<dyn Reporter>,
    signer: Option<Arc<dyn RouteServiceSigner>>,
    access_hook: Option<AccessHook>,
}

impl ProxyRoundTripper {
    pub fn new(transport: Arc<dyn Transport>, config: ProxyConfig) -> Self {
        Self {
            transport,
            config,
            reporter: Arc::new(NullReporter),
            signer: None,
            access_hook: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_route_service_signer(mut self, signer: Arc<dyn RouteServiceSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_access_hook(mut self, hook: AccessHook) -> Self {
        self.access_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    fn iterator(&self, request: &Request<Bytes>, pool: &Arc<RoutePool>) -> Box<dyn EndpointIterator> {
        let inner = PoolIterator::new(pool.clone())
            .with_sticky_instance(sticky_instance(request.headers()))
            .with_policy(self.config.load_balance);
        Box::new(ReportingIterator {
            inner,
            reporter: self.reporter.clone(),
        })
    }

    /// Hook run exactly once per request by whichever round tripper serves it.
    /// Stores the final endpoint in `slot` for response post-processing.
    fn after_hook(
        &self,
        request: &Request<Bytes>,
        slot: Arc<Mutex<Option<Endpoint>>>,
    ) -> AfterRoundTrip {
        let reporter = self.reporter.clone();
        let access_hook = self.access_hook.clone();
        let method = request.method().clone();
        let uri = request.uri().clone();
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let request_id = request
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let started = Instant::now();

        Arc::new(move |response, endpoint, error| {
            let duration = started.elapsed();
            match (response, error) {
                (Some(response), _) => {
                    reporter.capture_routing_response(endpoint, response.status(), duration)
                }
                _ => reporter.capture_bad_gateway(),
            }

            if let Some(hook) = &access_hook {
                let status = match (response, error) {
                    (Some(response), _) => response.status(),
                    (None, Some(error)) => gateway_error_status(error),
                    (None, None) => StatusCode::BAD_GATEWAY,
                };
                hook(&AccessRecord {
                    method: method.clone(),
                    uri: uri.clone(),
                    host: host.clone(),
                    request_id: request_id.clone(),
                    status,
                    endpoint: (!endpoint.is_placeholder()).then(|| endpoint.canonical_addr()),
                    error: error.map(|e| e.to_string()),
                    duration,
                });
            }

            *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(endpoint.clone());
        })
    }

    /// Serve one HTTP request against `pool`. Failures come back as gateway
    /// error responses.
    pub async fn round_trip(&self, request: Request<Bytes>, pool: Arc<RoutePool>) -> Response<ProxyBody> {
        let slot = Arc::new(Mutex::new(None));
        let after = self.after_hook(&request, slot.clone());
        let requested_instance = sticky_instance(request.headers());
        let trace_headers = request.headers().clone();

        let builder = RoundTripperBuilder::new()
            .with_transport(self.transport.clone())
            .with_after(after.clone())
            .with_endpoint_timeout(self.config.endpoint_timeout);

        let (builder, kind, outbound) = match pool.route_service_url() {
            Some(route_service_url) if !self.is_route_service_return(&request) => {
                let Some(signer) = &self.signer else {
                    let error = ProxyError::RouteServiceDisabled;
                    warn!(route_service = %route_service_url, "route-service-unsupported");
                    after(None, &Endpoint::placeholder(), Some(&error));
                    return gateway_error_response(&error);
                };
                match route_service_request(request, &route_service_url, signer.as_ref()) {
                    Ok(outbound) => (builder, RoundTripperKind::RouteService, outbound),
                    Err(error) => {
                        after(None, &Endpoint::placeholder(), Some(&error));
                        return gateway_error_response(&error);
                    }
                }
            }
            _ => {
                let iterator = self.iterator(&request, &pool);
                (builder.with_iterator(iterator), RoundTripperKind::Backend, request)
            }
        };

        let round_tripper = match build_reported(builder, kind, &after) {
            Ok(round_tripper) => round_tripper,
            Err(error) => return gateway_error_response(&error),
        };

        let result = round_tripper.round_trip(outbound).await;
        let endpoint = slot.lock().unwrap_or_else(PoisonError::into_inner).take();

        match result {
            Ok(mut response) => {
                if let Some(endpoint) = endpoint.filter(|e| !e.is_placeholder()) {
                    set_trace_headers(
                        &trace_headers,
                        response.headers_mut(),
                        &self.config.trace_key,
                        &self.config.router_ip,
                        &endpoint.canonical_addr(),
                    );
                    setup_sticky_session(
                        response.headers_mut(),
                        &endpoint,
                        requested_instance.as_deref(),
                        pool.context_path(),
                        self.config.secure_cookies,
                    );
                }
                response
            }
            Err(error) => gateway_error_response(&error),
        }
    }

    /// Run a raw TCP tunnel between the hijacked client connection and an
    /// endpoint of `pool`
    pub async fn tunnel(
        &self,
        request: Request<Bytes>,
        pool: Arc<RoutePool>,
        hijacker: Box<dyn Hijacker>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let slot = Arc::new(Mutex::new(None));
        let after = self.after_hook(&request, slot);
        let builder = RoundTripperBuilder::new()
            .with_iterator(self.iterator(&request, &pool))
            .with_hijacker(hijacker)
            .with_after(after.clone())
            .with_dial_timeout(self.config.dial_timeout);
        let round_tripper = build_reported(builder, RoundTripperKind::Tcp, &after)?;

        round_tripper.round_trip(request).await
    }

    fn is_route_service_return(&self, request: &Request<Bytes>) -> bool {
        let headers = request.headers();
        let Some(signature) = headers.get(X_ROUTE_SIGNATURE).and_then(|v| v.to_str().ok()) else {
            return false;
        };
        let metadata = headers
            .get(X_ROUTE_METADATA)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();

        match &self.signer {
            Some(signer) => {
                let valid = signer.validate(signature, metadata);
                if !valid {
                    debug!("Route service signature rejected");
                }
                valid
            }
            None => false,
        }
    }
}

/// Readdress `request` to the route service, carrying the original URL and
/// its signature
fn route_service_request(
    mut request: Request<Bytes>,
    route_service_url: &str,
    signer: &dyn RouteServiceSigner,
) -> Result<Request<Bytes>, ProxyError> {
    let invalid = |reason: String| ProxyError::Transport(crate::TransportError::InvalidRequest(reason));

    let host = request
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| request.uri().authority().map(|a| a.as_str()))
        .unwrap_or_default()
        .to_string();
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let forwarded_url = format!("http://{}{}", host, path);

    let (signature, metadata) = signer.sign(&forwarded_url).map_err(invalid)?;
    let target: Uri = route_service_url
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(e.to_string()))?;

    let headers = request.headers_mut();
    for (name, value) in [
        (X_ROUTE_FORWARDED_URL, forwarded_url),
        (X_ROUTE_SIGNATURE, signature),
        (X_ROUTE_METADATA, metadata),
    ] {
        let value = HeaderValue::from_str(&value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(name, value);
    }
    if let Some(authority) = target.authority() {
        let value = HeaderValue::from_str(authority.as_str()).map_err(|e| invalid(e.to_string()))?;
        headers.insert(HOST, value);
    }
    *request.uri_mut() = target;

    Ok(request)
}

/// Build the variant, reporting a build failure to `after` so the hook still
/// fires once for the request
fn build_reported(
    builder: RoundTripperBuilder,
    kind: RoundTripperKind,
    after: &AfterRoundTrip,
) -> Result<Box<dyn RoundTripper>, ProxyError> {
    builder
        .build_kind(kind)
        .inspect_err(|error| after(None, &Endpoint::placeholder(), Some(error)))
}

fn gateway_error_status(error: &ProxyError) -> StatusCode {
    match error {
        ProxyError::NoEndpointsAvailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::BAD_GATEWAY,
    }
}

/// Response sent to the client when a round trip fails
pub fn gateway_error_response(error: &ProxyError) -> Response<ProxyBody> {
    let (code, message) = match error {
        ProxyError::NoEndpointsAvailable => (
            "no_endpoints",
            "503 Service Unavailable: Requested route has no available endpoints.",
        ),
        ProxyError::RouteServiceDisabled => (
            "route_service_unsupported",
            "502 Bad Gateway: Support for route services is disabled.",
        ),
        _ => (
            "endpoint_failure",
            "502 Bad Gateway: Registered endpoint failed to handle the request.",
        ),
    };

    let mut response = Response::new(full_body(format!("{}\n", message)));
    *response.status_mut() = gateway_error_status(error);
    let headers = response.headers_mut();
    headers.insert(X_ROUTER_ERROR, HeaderValue::from_static(code));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}
