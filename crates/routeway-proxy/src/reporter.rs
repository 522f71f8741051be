//! Request outcome reporting

use http::StatusCode;
use routeway_router::Endpoint;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Receives per-request routing events
///
/// Implementations must be cheap; they are called inline on the request
/// path.
pub trait Reporter: Send + Sync {
    /// One attempt is about to be sent to `endpoint`
    fn capture_routing_request(&self, endpoint: &Endpoint);

    /// The request ended without a response from any endpoint
    fn capture_bad_gateway(&self);

    /// A response came back from `endpoint`
    fn capture_routing_response(&self, endpoint: &Endpoint, status: StatusCode, latency: Duration);
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn capture_routing_request(&self, _endpoint: &Endpoint) {}
    fn capture_bad_gateway(&self) {}
    fn capture_routing_response(&self, _endpoint: &Endpoint, _status: StatusCode, _latency: Duration) {}
}

/// Process-wide counters behind `/varz`
#[derive(Debug, Default)]
pub struct ProxyStats {
    routing_requests: AtomicU64,
    bad_gateways: AtomicU64,
    responses: AtomicU64,
    responses_5xx: AtomicU64,
    latency_micros: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub routing_requests: u64,
    pub bad_gateways: u64,
    pub responses: u64,
    pub responses_5xx: u64,
    /// Mean latency of captured responses, in microseconds
    pub mean_latency_micros: u64,
}

impl ProxyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let responses = self.responses.load(Ordering::Relaxed);
        let latency = self.latency_micros.load(Ordering::Relaxed);
        StatsSnapshot {
            routing_requests: self.routing_requests.load(Ordering::Relaxed),
            bad_gateways: self.bad_gateways.load(Ordering::Relaxed),
            responses,
            responses_5xx: self.responses_5xx.load(Ordering::Relaxed),
            mean_latency_micros: latency.checked_div(responses).unwrap_or(0),
        }
    }
}

impl Reporter for ProxyStats {
    fn capture_routing_request(&self, _endpoint: &Endpoint) {
        self.routing_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn capture_bad_gateway(&self) {
        self.bad_gateways.fetch_add(1, Ordering::Relaxed);
    }

    fn capture_routing_response(&self, _endpoint: &Endpoint, status: StatusCode, latency: Duration) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        if status.is_server_error() {
            self.responses_5xx.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.fetch_add(micros, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counts_events() {
        let stats = ProxyStats::new();
        let endpoint = Endpoint::new("10.0.0.1", 80);

        stats.capture_routing_request(&endpoint);
        stats.capture_routing_request(&endpoint);
        stats.capture_bad_gateway();
        stats.capture_routing_response(&endpoint, StatusCode::OK, Duration::from_millis(2));
        stats.capture_routing_response(
            &endpoint,
            StatusCode::INTERNAL_SERVER_ERROR,
            Duration::from_millis(4),
        );

        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                routing_requests: 2,
                bad_gateways: 1,
                responses: 2,
                responses_5xx: 1,
                mean_latency_micros: 3000,
            }
        );
    }

    #[test]
    fn test_empty_snapshot() {
        assert_eq!(ProxyStats::new().snapshot(), StatsSnapshot::default());
    }
}
