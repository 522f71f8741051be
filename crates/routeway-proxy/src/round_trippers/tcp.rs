use super::{notify_after, AfterRoundTrip, RoundTripper, MAX_RETRIES};
use crate::error::{ProxyError, TransportError};
use crate::hijack::{HijackedStream, Hijacker};
use crate::{empty_body, ProxyBody};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use routeway_router::{Endpoint, EndpointIterator};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Tunnels an upgraded client connection to a backend over raw TCP
pub struct TcpRoundTripper {
    hijacker: Mutex<Option<Box<dyn Hijacker>>>,
    iterator: Mutex<Box<dyn EndpointIterator>>,
    after: Option<AfterRoundTrip>,
    dial_timeout: Duration,
    cancel: CancellationToken,
}

impl TcpRoundTripper {
    pub fn new(
        hijacker: Box<dyn Hijacker>,
        iterator: Box<dyn EndpointIterator>,
        after: Option<AfterRoundTrip>,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            hijacker: Mutex::new(Some(hijacker)),
            iterator: Mutex::new(iterator),
            after,
            dial_timeout,
            cancel: CancellationToken::new(),
        }
    }

    fn with_iterator<T>(&self, f: impl FnOnce(&mut dyn EndpointIterator) -> T) -> T {
        let mut iterator = self.iterator.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut **iterator)
    }

    async fn take_client(&self) -> Result<HijackedStream, ProxyError> {
        let hijacker = self
            .hijacker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| ProxyError::Hijack("connection already hijacked".to_string()))?;

        hijacker
            .hijack()
            .await
            .map_err(|e| ProxyError::Hijack(e.to_string()))
    }

    async fn dial(&self, addr: &str) -> Result<TcpStream, ProxyError> {
        let connect = tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ProxyError::Canceled),
            outcome = connect => match outcome {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(TransportError::dial(addr, e).into()),
                Err(_) => Err(TransportError::dial(
                    addr,
                    format!("timed out after {:?}", self.dial_timeout),
                )
                .into()),
            },
        }
    }

    /// Select endpoints until a dial succeeds, at most [`MAX_RETRIES`] times
    async fn connect_backend(
        &self,
    ) -> (Option<Arc<Endpoint>>, Result<TcpStream, ProxyError>) {
        let mut last: Option<Arc<Endpoint>> = None;
        let mut failures = 0;

        loop {
            let Some(endpoint) = self.with_iterator(|iter| iter.next()) else {
                return (last, Err(ProxyError::NoEndpointsAvailable));
            };
            let addr = endpoint.canonical_addr();
            last = Some(endpoint.clone());

            match self.dial(&addr).await {
                Ok(stream) => return (last, Ok(stream)),
                Err(e) if e.is_retryable() => {
                    warn!(address = %addr, error = %e, "tcp-connection-failed");
                    self.with_iterator(|iter| iter.endpoint_failed());
                    failures += 1;
                    if failures == MAX_RETRIES {
                        return (last, Err(e));
                    }
                }
                Err(e) => return (last, Err(e)),
            }
        }
    }
}

#[async_trait]
impl RoundTripper for TcpRoundTripper {
    async fn round_trip(&self, _request: Request<Bytes>) -> Result<Response<ProxyBody>, ProxyError> {
        info!(upgrade = "tcp", "handling-tcp-request");

        let client = match self.take_client().await {
            Ok(client) => client,
            Err(e) => {
                error!(error = %e, "tcp-request-failed");
                let result = Err(e);
                notify_after(self.after.as_ref(), &result, None);
                return result;
            }
        };

        let (endpoint, connected) = self.connect_backend().await;
        let backend = match connected {
            Ok(backend) => backend,
            Err(e) => {
                error!(error = %e, "tcp-request-failed");
                let result = Err(e);
                notify_after(self.after.as_ref(), &result, endpoint.as_deref());
                return result;
            }
        };

        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;

        if let Some(endpoint) = &endpoint {
            self.with_iterator(|iter| iter.pre_request(endpoint));
        }
        let (sent, received) = forward_io(client, backend, &self.cancel).await;
        if let Some(endpoint) = &endpoint {
            self.with_iterator(|iter| iter.post_request(endpoint));
        }
        debug!(sent, received, "Tunnel closed");

        let result = Ok(response);
        notify_after(self.after.as_ref(), &result, endpoint.as_deref());
        result
    }

    fn cancel_request(&self, _request: &Request<Bytes>) {
        self.cancel.cancel();
    }
}

/// Copy bytes both ways until either direction finishes, then shut both
/// connections down. Returns `(client -> backend, backend -> client)` byte
/// counts.
pub(crate) async fn forward_io(
    client: HijackedStream,
    backend: TcpStream,
    cancel: &CancellationToken,
) -> (u64, u64) {
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = backend.into_split();
    let mut sent = 0u64;
    let mut received = 0u64;

    {
        let client_to_backend = async {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match client_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if backend_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        sent += n as u64;
                    }
                }
            }
        };

        let backend_to_client = async {
            let mut buf = vec![0u8; 32 * 1024];
            loop {
                match backend_read.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if client_write.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        if client_write.flush().await.is_err() {
                            break;
                        }
                        received += n as u64;
                    }
                }
            }
        };

        tokio::select! {
            _ = client_to_backend => {}
            _ = backend_to_client => {}
            _ = cancel.cancelled() => {}
        }
    }

    let _ = backend_write.shutdown().await;
    let _ = client_write.shutdown().await;
    (sent, received)
}
