//! Outbound HTTP transport
//!
//! [`HttpTransport`] speaks plain HTTP/1.1 to backends over pooled hyper
//! client connections. Connection establishment is bounded by the dial
//! timeout and reported as [`TransportError::Dial`], which is the only
//! failure the round trippers retry.

use crate::error::TransportError;
use crate::ProxyBody;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::request::Parts;
use http::uri::PathAndQuery;
use http::{HeaderValue, Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Maximum number of idle connections kept per backend address
const MAX_IDLE_PER_HOST: usize = 16;

type Sender = http1::SendRequest<Full<Bytes>>;

/// Performs one outbound exchange
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, request: Request<Bytes>)
        -> Result<Response<ProxyBody>, TransportError>;
}

/// Idle keep-alive connections by backend address. Addresses without a live
/// connection have no entry.
#[derive(Default)]
struct IdlePool {
    senders: Mutex<HashMap<String, Vec<Sender>>>,
}

impl IdlePool {
    async fn checkout(&self, addr: &str) -> Option<Sender> {
        let mut idle = self.senders.lock().await;
        let senders = idle.get_mut(addr)?;

        let mut found = None;
        while let Some(sender) = senders.pop() {
            if sender.is_ready() {
                trace!(addr = %addr, "Reusing pooled connection");
                found = Some(sender);
                break;
            }
        }
        if senders.is_empty() {
            idle.remove(addr);
        }
        found
    }

    async fn checkin(&self, addr: String, sender: Sender) {
        let mut idle = self.senders.lock().await;
        idle.retain(|_, senders| {
            senders.retain(|idle_sender| !idle_sender.is_closed());
            !senders.is_empty()
        });

        if sender.is_closed() {
            return;
        }
        let senders = idle.entry(addr).or_default();
        if senders.len() < MAX_IDLE_PER_HOST {
            senders.push(sender);
        }
    }

    #[cfg(test)]
    async fn idle_count(&self, addr: &str) -> Option<usize> {
        self.senders.lock().await.get(addr).map(Vec::len)
    }
}

pub struct HttpTransport {
    dial_timeout: Duration,
    idle: Arc<IdlePool>,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            idle: Arc::new(IdlePool::default()),
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    async fn connect(&self, addr: &str) -> Result<Sender, TransportError> {
        debug!(addr = %addr, "Dialing backend");
        let stream = match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(TransportError::dial(addr, e)),
            Err(_) => {
                return Err(TransportError::dial(
                    addr,
                    format!("timed out after {:?}", self.dial_timeout),
                ))
            }
        };
        let _ = stream.set_nodelay(true);

        let (sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::Connection(format!("handshake failed: {}", e)))?;

        let addr = addr.to_string();
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(addr = %addr, "Backend connection closed: {}", e);
            }
        });

        Ok(sender)
    }

    /// Return the connection to the idle pool once the response body has
    /// been read to the end
    fn release_when_idle(&self, addr: String, mut sender: Sender) {
        let idle = self.idle.clone();
        tokio::spawn(async move {
            if sender.ready().await.is_ok() {
                idle.checkin(addr, sender).await;
            }
        });
    }
}

/// Fresh outbound request for one send; the buffered body is shared
fn outbound_request(parts: &Parts, body: &Bytes) -> Request<Full<Bytes>> {
    let mut request = Request::new(Full::new(body.clone()));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = parts.uri.clone();
    *request.version_mut() = parts.version;
    *request.headers_mut() = parts.headers.clone();
    request
}

/// Failures of a pooled connection the backend closed while it sat idle
fn is_stale_connection(error: &hyper::Error) -> bool {
    if error.is_canceled() || error.is_incomplete_message() || error.is_closed() {
        return true;
    }
    std::error::Error::source(error)
        .and_then(|source| source.downcast_ref::<io::Error>())
        .is_some_and(|e| {
            matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            )
        })
}

fn classify(error: hyper::Error) -> TransportError {
    if error.is_parse() {
        TransportError::Protocol(error.to_string())
    } else {
        TransportError::Connection(error.to_string())
    }
}

/// Split an absolute request target into the dial address and the
/// origin-form target sent on the wire
fn outbound_target(uri: &Uri) -> Result<(String, Uri), TransportError> {
    match uri.scheme_str() {
        None | Some("http") => {}
        Some(other) => return Err(TransportError::UnsupportedScheme(other.to_string())),
    }

    let authority = uri
        .authority()
        .ok_or_else(|| TransportError::InvalidRequest(format!("no host in {}", uri)))?;
    let addr = match authority.port_u16() {
        Some(_) => authority.as_str().to_string(),
        None => format!("{}:80", authority.as_str()),
    };

    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Ok((addr, Uri::from(path)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(
        &self,
        request: Request<Bytes>,
    ) -> Result<Response<ProxyBody>, TransportError> {
        let (mut parts, body) = request.into_parts();
        let (addr, target) = outbound_target(&parts.uri)?;

        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                    parts.headers.insert(HOST, value);
                }
            }
        }
        parts.uri = target;

        let (mut sender, pooled) = match self.idle.checkout(&addr).await {
            Some(sender) => (sender, true),
            None => (self.connect(&addr).await?, false),
        };

        let result: Result<Response<Incoming>, hyper::Error> =
            match sender.send_request(outbound_request(&parts, &body)).await {
                Err(e) if pooled && is_stale_connection(&e) => {
                    debug!(addr = %addr, "Pooled connection went stale, redialing: {}", e);
                    sender = self.connect(&addr).await?;
                    sender.send_request(outbound_request(&parts, &body)).await
                }
                other => other,
            };
        let response = result.map_err(classify)?;

        self.release_when_idle(addr, sender);
        Ok(response.map(|body| body.boxed_unsync()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read one request head; `false` once the peer closed
    async fn read_head(socket: &mut TcpStream) -> bool {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match socket.read(&mut byte).await {
                Ok(1) => head.push(byte[0]),
                _ => return false,
            }
        }
        true
    }

    fn get(addr: std::net::SocketAddr) -> Request<Bytes> {
        Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Bytes::new())
            .unwrap()
    }

    /// Poll until the released connection has been checked back in
    async fn wait_for_idle(transport: &HttpTransport, addr: &str) {
        for _ in 0..100 {
            if transport.idle.idle_count(addr).await.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connection to {} never returned to the pool", addr);
    }

    #[test]
    fn test_outbound_target() {
        let uri: Uri = "http://10.0.0.1:8080/a/b?c=d".parse().unwrap();
        let (addr, target) = outbound_target(&uri).unwrap();
        assert_eq!(addr, "10.0.0.1:8080");
        assert_eq!(target, "/a/b?c=d");

        let uri: Uri = "http://backend.internal".parse().unwrap();
        let (addr, target) = outbound_target(&uri).unwrap();
        assert_eq!(addr, "backend.internal:80");
        assert_eq!(target, "/");
    }

    #[test]
    fn test_outbound_target_rejects_https_and_relative() {
        let uri: Uri = "https://rs.internal/".parse().unwrap();
        assert_eq!(
            outbound_target(&uri),
            Err(TransportError::UnsupportedScheme("https".into()))
        );

        let uri: Uri = "/only/path".parse().unwrap();
        assert!(matches!(
            outbound_target(&uri),
            Err(TransportError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_dial_failure_is_classified() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new();
        let request = Request::builder()
            .uri(format!("http://{}/", addr))
            .body(Bytes::new())
            .unwrap();

        let err = transport.round_trip(request).await.unwrap_err();
        assert!(matches!(err, TransportError::Dial { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_round_trip_against_raw_backend() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("POST /echo HTTP/1.1\r\n"), "{}", head);
            assert!(head.to_ascii_lowercase().contains("host: app.example.com"));
            socket
                .write_all(b"HTTP/1.1 201 Created\r\ncontent-length: 2\r\n\r\nok")
                .await
                .unwrap();
        });

        let transport = HttpTransport::new();
        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{}/echo", addr))
            .header(HOST, "app.example.com")
            .body(Bytes::from_static(b"hi"))
            .unwrap();

        let response = transport.round_trip(request).await.unwrap();
        assert_eq!(response.status(), 201);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_sequential_requests_reuse_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    while read_head(&mut socket).await {
                        if socket
                            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                });
            }
        });

        let transport = HttpTransport::new();
        for _ in 0..3 {
            let response = transport.round_trip(get(addr)).await.unwrap();
            assert_eq!(response.status(), 200);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(&body[..], b"ok");
            wait_for_idle(&transport, &addr.to_string()).await;
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_pooled_connection_is_redialed() {
        // Each connection serves one request, then drops the next one unanswered
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let heads = Arc::new(AtomicUsize::new(0));

        let (conn_counter, head_counter) = (accepted.clone(), heads.clone());
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                conn_counter.fetch_add(1, Ordering::SeqCst);
                let head_counter = head_counter.clone();
                tokio::spawn(async move {
                    if !read_head(&mut socket).await {
                        return;
                    }
                    head_counter.fetch_add(1, Ordering::SeqCst);
                    socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok")
                        .await
                        .unwrap();
                    if read_head(&mut socket).await {
                        head_counter.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });

        let transport = HttpTransport::new();
        let key = addr.to_string();

        let first = transport.round_trip(get(addr)).await.unwrap();
        first.into_body().collect().await.unwrap();
        wait_for_idle(&transport, &key).await;

        let second = transport.round_trip(get(addr)).await.unwrap();
        assert_eq!(second.status(), 200);
        let body = second.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(heads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_closed_connections_leave_the_pool() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_head(&mut socket).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
            let _ = close_rx.await;
        });

        let transport = HttpTransport::new();
        let response = transport.round_trip(get(addr)).await.unwrap();
        response.into_body().collect().await.unwrap();
        wait_for_idle(&transport, &addr.to_string()).await;

        // Backend goes away; the connection task notices the close
        close_tx.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(transport.idle.checkout(&addr.to_string()).await.is_none());
        assert_eq!(transport.idle.idle_count(&addr.to_string()).await, None);
    }
}
