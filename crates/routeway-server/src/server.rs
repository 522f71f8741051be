//! HTTP/1.x listener for proxied traffic

use crate::handler::RequestHandler;
use crate::ServerError;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub struct ProxyServer {
    listener: TcpListener,
    handler: Arc<RequestHandler>,
}

impl ProxyServer {
    pub async fn bind(addr: SocketAddr, handler: Arc<RequestHandler>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e))?;
        Ok(Self { listener, handler })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. Connections already
    /// accepted keep running to completion.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), ServerError> {
        info!("Proxy listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Proxy listener stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = self.handler.clone();
                        tokio::spawn(async move {
                            Self::handle_connection(stream, peer, handler).await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
    }

    async fn handle_connection(stream: TcpStream, peer: SocketAddr, handler: Arc<RequestHandler>) {
        debug!("New connection from {}", peer);

        let service = service_fn(move |request| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle(request, peer).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            debug!("Connection error from {}: {}", peer, e);
        }
    }
}
