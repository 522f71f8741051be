//! Round tripper family
//!
//! Every variant runs the same skeleton: up to [`MAX_RETRIES`] attempts,
//! retrying only dial failures, then exactly one call to the
//! after-round-trip hook with the final outcome.

mod backend;
mod route_service;
mod tcp;

pub use backend::BackendRoundTripper;
pub use route_service::RouteServiceRoundTripper;
pub use tcp::TcpRoundTripper;

use crate::error::ProxyError;
use crate::hijack::Hijacker;
use crate::transport::Transport;
use crate::ProxyBody;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use routeway_router::{Endpoint, EndpointIterator};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Attempts per logical request, in every variant
pub const MAX_RETRIES: usize = 3;

/// Observer fired once per logical request with `(response, endpoint, error)`
pub type AfterRoundTrip =
    Arc<dyn Fn(Option<&Response<ProxyBody>>, &Endpoint, Option<&ProxyError>) + Send + Sync>;

#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError>;

    /// Abort the in-flight attempt; the pending `round_trip` returns
    /// [`ProxyError::Canceled`]
    fn cancel_request(&self, request: &Request<Bytes>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundTripperKind {
    Backend,
    RouteService,
    Tcp,
}

impl RoundTripperKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backend => "backend",
            Self::RouteService => "route_service",
            Self::Tcp => "tcp",
        }
    }
}

impl FromStr for RoundTripperKind {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backend" => Ok(Self::Backend),
            "route_service" => Ok(Self::RouteService),
            "tcp" => Ok(Self::Tcp),
            other => Err(ProxyError::UnknownRoundTripper(other.to_string())),
        }
    }
}

/// Factory for the round tripper variants
pub struct RoundTripperBuilder {
    transport: Option<Arc<dyn Transport>>,
    iterator: Option<Box<dyn EndpointIterator>>,
    hijacker: Option<Box<dyn Hijacker>>,
    after: Option<AfterRoundTrip>,
    endpoint_timeout: Option<Duration>,
    dial_timeout: Duration,
}

impl Default for RoundTripperBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundTripperBuilder {
    pub fn new() -> Self {
        Self {
            transport: None,
            iterator: None,
            hijacker: None,
            after: None,
            endpoint_timeout: None,
            dial_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_iterator(mut self, iterator: Box<dyn EndpointIterator>) -> Self {
        self.iterator = Some(iterator);
        self
    }

    pub fn with_hijacker(mut self, hijacker: Box<dyn Hijacker>) -> Self {
        self.hijacker = Some(hijacker);
        self
    }

    pub fn with_after(mut self, after: AfterRoundTrip) -> Self {
        self.after = Some(after);
        self
    }

    /// Per-attempt deadline for the HTTP variants; zero disables it
    pub fn with_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.endpoint_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }

    /// Per-attempt dial deadline for the TCP variant
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Build the variant named `backend`, `route_service` or `tcp`
    pub fn build(self, name: &str) -> Result<Box<dyn RoundTripper>, ProxyError> {
        let kind = name.parse()?;
        self.build_kind(kind)
    }

    pub fn build_kind(self, kind: RoundTripperKind) -> Result<Box<dyn RoundTripper>, ProxyError> {
        let missing = |component| ProxyError::MissingComponent {
            kind: kind.as_str(),
            component,
        };

        match kind {
            RoundTripperKind::Backend => Ok(Box::new(BackendRoundTripper::new(
                self.transport.ok_or_else(|| missing("transport"))?,
                self.iterator.ok_or_else(|| missing("endpoint iterator"))?,
                self.after,
                self.endpoint_timeout,
            ))),
            RoundTripperKind::RouteService => Ok(Box::new(RouteServiceRoundTripper::new(
                self.transport.ok_or_else(|| missing("transport"))?,
                self.after,
                self.endpoint_timeout,
            ))),
            RoundTripperKind::Tcp => Ok(Box::new(TcpRoundTripper::new(
                self.hijacker.ok_or_else(|| missing("hijacker"))?,
                self.iterator.ok_or_else(|| missing("endpoint iterator"))?,
                self.after,
                self.dial_timeout,
            ))),
        }
    }
}

/// Copy of a buffered request for one attempt
pub(crate) fn clone_request(request: &Request<Bytes>) -> Request<Bytes> {
    let mut clone = Request::new(request.body().clone());
    *clone.method_mut() = request.method().clone();
    *clone.uri_mut() = request.uri().clone();
    *clone.version_mut() = request.version();
    *clone.headers_mut() = request.headers().clone();
    clone
}

/// One outbound attempt under the endpoint timeout and cancellation token
pub(crate) async fn dispatch(
    transport: &dyn Transport,
    request: Request<Bytes>,
    endpoint_timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<Response<ProxyBody>, ProxyError> {
    let attempt = async {
        match endpoint_timeout {
            Some(limit) => match tokio::time::timeout(limit, transport.round_trip(request)).await {
                Ok(result) => result.map_err(ProxyError::from),
                Err(_) => Err(ProxyError::DeadlineExceeded(limit)),
            },
            None => transport.round_trip(request).await.map_err(ProxyError::from),
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ProxyError::Canceled),
        result = attempt => result,
    }
}

pub(crate) fn notify_after(
    after: Option<&AfterRoundTrip>,
    result: &Result<Response<ProxyBody>, ProxyError>,
    endpoint: Option<&Endpoint>,
) {
    let Some(after) = after else {
        return;
    };
    let placeholder;
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => {
            placeholder = Endpoint::placeholder();
            &placeholder
        }
    };
    after(result.as_ref().ok(), endpoint, result.as_ref().err());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_name() {
        assert_eq!("backend".parse::<RoundTripperKind>(), Ok(RoundTripperKind::Backend));
        assert_eq!(
            "route_service".parse::<RoundTripperKind>(),
            Ok(RoundTripperKind::RouteService)
        );
        assert_eq!("tcp".parse::<RoundTripperKind>(), Ok(RoundTripperKind::Tcp));
        assert_eq!(
            "websocket".parse::<RoundTripperKind>(),
            Err(ProxyError::UnknownRoundTripper("websocket".into()))
        );
    }

    #[test]
    fn test_build_reports_missing_components() {
        let err = RoundTripperBuilder::new().build("backend").err().unwrap();
        assert_eq!(
            err,
            ProxyError::MissingComponent {
                kind: "backend",
                component: "transport"
            }
        );

        let err = RoundTripperBuilder::new().build("tcp").err().unwrap();
        assert_eq!(
            err,
            ProxyError::MissingComponent {
                kind: "tcp",
                component: "hijacker"
            }
        );

        assert!(matches!(
            RoundTripperBuilder::new().build("nope"),
            Err(ProxyError::UnknownRoundTripper(_))
        ));
    }

    #[test]
    fn test_clone_request_copies_everything_but_extensions() {
        let request = Request::builder()
            .method("PUT")
            .uri("http://a.com/x?y=1")
            .header("x-test", "1")
            .body(Bytes::from_static(b"payload"))
            .unwrap();

        let clone = clone_request(&request);
        assert_eq!(clone.method(), "PUT");
        assert_eq!(clone.uri(), "http://a.com/x?y=1");
        assert_eq!(clone.headers()["x-test"], "1");
        assert_eq!(clone.body(), &Bytes::from_static(b"payload"));
    }
}
