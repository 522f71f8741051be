use super::{clone_request, dispatch, notify_after, AfterRoundTrip, RoundTripper, MAX_RETRIES};
use crate::error::{ProxyError, TransportError};
use crate::headers::{X_APPLICATION_ID, X_INSTANCE_ID};
use crate::transport::Transport;
use crate::ProxyBody;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderValue, Request, Response, Uri};
use routeway_router::{Endpoint, EndpointIterator};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Sends the request to endpoints drawn from an iterator
pub struct BackendRoundTripper {
    transport: Arc<dyn Transport>,
    iterator: Mutex<Box<dyn EndpointIterator>>,
    after: Option<AfterRoundTrip>,
    endpoint_timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl BackendRoundTripper {
    pub fn new(
        transport: Arc<dyn Transport>,
        iterator: Box<dyn EndpointIterator>,
        after: Option<AfterRoundTrip>,
        endpoint_timeout: Option<Duration>,
    ) -> Self {
        Self {
            transport,
            iterator: Mutex::new(iterator),
            after,
            endpoint_timeout,
            cancel: CancellationToken::new(),
        }
    }

    fn with_iterator<T>(&self, f: impl FnOnce(&mut dyn EndpointIterator) -> T) -> T {
        let mut iterator = self.iterator.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **iterator)
    }

    fn setup_request(
        request: &Request<Bytes>,
        endpoint: &Endpoint,
    ) -> Result<Request<Bytes>, ProxyError> {
        let mut outbound = clone_request(request);

        let path = request
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let uri = Uri::builder()
            .scheme("http")
            .authority(endpoint.canonical_addr().as_str())
            .path_and_query(path)
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
        *outbound.uri_mut() = uri;

        let headers = outbound.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&endpoint.application_id) {
            headers.insert(X_APPLICATION_ID, value);
        }
        if let Ok(value) = HeaderValue::from_str(&endpoint.instance_id_header_value()) {
            headers.insert(X_INSTANCE_ID, value);
        }

        Ok(outbound)
    }
}

#[async_trait]
impl RoundTripper for BackendRoundTripper {
    async fn round_trip(&self, request: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError> {
        let mut endpoint: Option<Arc<Endpoint>> = None;
        let mut result = Err(ProxyError::NoEndpointsAvailable);

        for attempt in 1..=MAX_RETRIES {
            let Some(selected) = self.with_iterator(|iter| iter.next()) else {
                result = Err(ProxyError::NoEndpointsAvailable);
                break;
            };
            endpoint = Some(selected.clone());
            debug!(attempt, address = %selected.canonical_addr(), "Dispatching to backend");

            let outbound = match Self::setup_request(&request, &selected) {
                Ok(outbound) => outbound,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            };

            self.with_iterator(|iter| iter.pre_request(&selected));
            result = dispatch(
                self.transport.as_ref(),
                outbound,
                self.endpoint_timeout,
                &self.cancel,
            )
            .await;
            self.with_iterator(|iter| iter.post_request(&selected));

            match &result {
                Err(e) if e.is_retryable() => {
                    self.with_iterator(|iter| iter.endpoint_failed());
                    warn!(
                        attempt,
                        address = %selected.canonical_addr(),
                        error = %e,
                        "backend-endpoint-failed"
                    );
                }
                _ => break,
            }
        }

        if let Err(e) = &result {
            error!(error = %e, "endpoint-failed");
        }

        notify_after(self.after.as_ref(), &result, endpoint.as_deref());
        result
    }

    fn cancel_request(&self, _request: &Request<Bytes>) {
        self.cancel.cancel();
    }
}
