//! Load balancer health check

use bytes::Bytes;
use http::header::{CACHE_CONTROL, EXPIRES};
use http::{HeaderValue, Response, StatusCode};
use routeway_proxy::{full_body, ProxyBody};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared "accepting traffic" flag
///
/// Cloned into every component that reports health; only the process owner
/// flips it.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatFlag(Arc<AtomicBool>);

impl HeartbeatFlag {
    pub fn new(healthy: bool) -> Self {
        Self(Arc::new(AtomicBool::new(healthy)))
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.0.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Answer to a request from the configured health check agent
pub fn health_response(heartbeat: &HeartbeatFlag) -> Response<ProxyBody> {
    let (status, body) = if heartbeat.is_healthy() {
        (StatusCode::OK, Bytes::from_static(b"ok\n"))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Bytes::new())
    };

    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("private, max-age=0"));
    headers.insert(EXPIRES, HeaderValue::from_static("0"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_is_shared_between_clones() {
        let flag = HeartbeatFlag::new(false);
        let observer = flag.clone();
        flag.set_healthy(true);
        assert!(observer.is_healthy());
    }

    #[test]
    fn test_health_response_follows_flag() {
        let flag = HeartbeatFlag::new(true);
        let response = health_response(&flag);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "private, max-age=0");
        assert_eq!(response.headers()[EXPIRES], "0");

        flag.set_healthy(false);
        assert_eq!(
            health_response(&flag).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
