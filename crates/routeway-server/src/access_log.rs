//! One structured event per proxied request

use routeway_proxy::{AccessHook, AccessRecord};
use std::sync::Arc;
use tracing::info;

pub fn log_access(record: &AccessRecord) {
    info!(
        target: "routeway::access",
        method = %record.method,
        host = %record.host,
        uri = %record.uri,
        status = record.status.as_u16(),
        endpoint = record.endpoint.as_deref().unwrap_or("-"),
        request_id = record.request_id.as_deref().unwrap_or("-"),
        duration_ms = record.duration.as_millis() as u64,
        error = record.error.as_deref().unwrap_or(""),
        "access"
    );
}

pub fn access_hook() -> AccessHook {
    Arc::new(log_access)
}
