//! Outbound side of the routeway data-plane
//!
//! Round trippers execute one logical request against the endpoints of a
//! route pool with bounded retries, against a route service, or as a raw
//! TCP tunnel for upgraded connections. [`ProxyRoundTripper`] ties them to
//! sticky sessions, trace headers and gateway error responses.

pub mod error;
pub mod headers;
pub mod hijack;
pub mod proxy_round_tripper;
pub mod reporter;
pub mod round_trippers;
pub mod sticky;
pub mod transport;

pub use error::{ProxyError, TransportError};
pub use hijack::{HijackedStream, Hijacker};
pub use proxy_round_tripper::{
    gateway_error_response, AccessHook, AccessRecord, ProxyConfig, ProxyRoundTripper,
    RouteServiceSigner,
};
pub use reporter::{NullReporter, ProxyStats, Reporter, StatsSnapshot};
pub use round_trippers::{
    AfterRoundTrip, RoundTripper, RoundTripperBuilder, RoundTripperKind, MAX_RETRIES,
};
pub use transport::{HttpTransport, Transport};

use bytes::Bytes;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full};

/// Response body produced by every round tripper
pub type ProxyBody = UnsyncBoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
