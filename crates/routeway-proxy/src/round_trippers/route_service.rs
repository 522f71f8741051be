use super::{clone_request, dispatch, notify_after, AfterRoundTrip, RoundTripper, MAX_RETRIES};
use crate::error::ProxyError;
use crate::transport::Transport;
use crate::ProxyBody;
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sends the request, already addressed to the route service, as is.
/// The after-round-trip hook receives the placeholder endpoint.
pub struct RouteServiceRoundTripper {
    transport: Arc<dyn Transport>,
    after: Option<AfterRoundTrip>,
    endpoint_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl RouteServiceRoundTripper {
    pub fn new(
        transport: Arc<dyn Transport>,
        after: Option<AfterRoundTrip>,
        endpoint_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            after,
            endpoint_timeout,
            cancel: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl RoundTripper for RouteServiceRoundTripper {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError> {
        debug!(uri = %request.uri(), "Dispatching to route service");
        let mut result = Err(ProxyError::RouteServiceDisabled);

        for attempt in 1..=MAX_RETRIES {
            result = dispatch(
                self.transport.as_ref(),
                clone_request(&request),
                self.endpoint_timeout,
                &self.cancel,
            )
            .await;

            match &result {
                Err(e) if e.is_retryable() => {
                    warn!(attempt, uri = %request.uri(), error = %e, "route-service-connection-failed");
                }
                _ => break,
            }
        }

        notify_after(self.after.as_ref(), &result, None);
        result
    }

    fn cancel_request(&self, _request: &Request<Bytes>) {
        self.cancel.cancel();
    }
}
