//! Taking over the client connection for upgraded requests

use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

/// Raw bidirectional client stream after an upgrade
pub trait HijackedIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> HijackedIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type HijackedStream = Box<dyn HijackedIo>;

/// Supplied by the server layer; yields the client connection at most once
#[async_trait]
pub trait Hijacker: Send {
    async fn hijack(self: Box<Self>) -> io::Result<HijackedStream>;
}
