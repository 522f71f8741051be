//! Error taxonomy for outbound round trips

use std::time::Duration;
use thiserror::Error;

/// Failure of a single outbound attempt
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The connection could not be established
    #[error("dial {addr}: {reason}")]
    Dial { addr: String, reason: String },

    /// Connected, but the exchange broke (reset, closed early)
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    pub fn dial(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of a logical request through a round tripper
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("no endpoints available")]
    NoEndpointsAvailable,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("endpoint timeout of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("request canceled")]
    Canceled,

    #[error("connection hijack failed: {0}")]
    Hijack(String),

    #[error("unknown round tripper: {0}")]
    UnknownRoundTripper(String),

    #[error("{kind} round tripper requires a {component}")]
    MissingComponent {
        kind: &'static str,
        component: &'static str,
    },

    #[error("route service requests are not supported")]
    RouteServiceDisabled,
}

impl ProxyError {
    /// Only connection-establishment failures are retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProxyError::Transport(TransportError::Dial { .. }))
    }
}
