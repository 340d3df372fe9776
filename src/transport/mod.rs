//! Transport adapters that carry packets to a tracking server.
//!
//! Supports a persistent TCP stream and a stateless HTTP relay. Both hand out a
//! [`Link`] per target; sessions only ever talk to the link.

mod http;
mod tcp;

pub use http::*;
pub use tcp::*;

#[cfg(test)]
pub(crate) use http::tests::spawn_relay;

use crate::device::ServerTarget;
use crate::packet::Packet;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connect to {0} timed out after {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("connect to {address} failed: {message}")]
    Connect { address: String, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("relay returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("connection closed")]
    Closed,
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Which transport variant is in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Http,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => f.write_str("tcp"),
            TransportKind::Http => f.write_str("http"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "http" => Ok(TransportKind::Http),
            other => Err(TransportError::Config(format!(
                "unknown transport: {}",
                other
            ))),
        }
    }
}

/// Something the remote end did on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound bytes, decoded lossily as text.
    Data(String),
    Closed,
    Error(String),
    /// Neither side sent anything for the idle period.
    Timeout,
}

/// Result of a send that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Bytes written to a stream; replies arrive later as [`TransportEvent::Data`].
    Written(usize),
    /// The response body returned for this packet.
    Response(String),
}

impl Delivery {
    /// Text stored as the response of a transmission record.
    pub fn response_text(&self) -> String {
        match self {
            Delivery::Written(n) => format!("sent {} bytes", n),
            Delivery::Response(body) => body.clone(),
        }
    }
}

/// The configured transport.
#[derive(Debug, Clone)]
pub enum Transport {
    Tcp(TcpTransport),
    Http(HttpRelay),
}

impl Transport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Tcp(_) => TransportKind::Tcp,
            Transport::Http(_) => TransportKind::Http,
        }
    }

    /// Open a link to `target`. The HTTP relay never fails here.
    pub async fn connect(&self, target: &ServerTarget) -> Result<Link, TransportError> {
        match self {
            Transport::Tcp(tcp) => Ok(Link::Tcp(tcp.connect(target).await?)),
            Transport::Http(relay) => Ok(Link::Http(relay.link(target))),
        }
    }
}

/// An open path to one target.
#[derive(Debug)]
pub enum Link {
    Tcp(TcpLink),
    Http(HttpLink),
}

impl Link {
    pub async fn send(&mut self, packet: &Packet) -> Result<Delivery, TransportError> {
        match self {
            Link::Tcp(link) => link.send(packet).await,
            Link::Http(link) => link.send(packet).await,
        }
    }

    /// Wait for the next event. HTTP links never produce any.
    pub async fn next_event(&mut self) -> Option<TransportEvent> {
        match self {
            Link::Tcp(link) => link.next_event().await,
            Link::Http(_) => std::future::pending().await,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_flag().load(Ordering::SeqCst)
    }

    /// Shared flag that reads false once the link is closed or failed.
    pub fn open_flag(&self) -> Arc<AtomicBool> {
        match self {
            Link::Tcp(link) => link.open_flag(),
            Link::Http(link) => link.open_flag(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            Link::Tcp(link) => link.close().await,
            Link::Http(link) => link.close(),
        }
    }
}
