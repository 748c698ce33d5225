//! Message-broker transport.
//!
//! The realtime channel is STOMP 1.2 over a WebSocket. This module provides:
//! - The text frame codec (`stomp`)
//! - A `Connector` seam that opens an authenticated session and hands back a `Link`
//! - The production `WsConnector` built on tokio-tungstenite

pub mod stomp;
mod ws;

pub use stomp::{Command, Frame, ProtocolError, StompCodec};
pub use ws::WsConnector;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;

/// Where and how to open a broker session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// WebSocket URL of the broker
    pub url: Url,
    /// Virtual host sent in CONNECT
    pub host: String,
    /// Bearer token sent in CONNECT
    pub token: Option<String>,
}

impl Endpoint {
    pub fn from_url(url: &Url) -> Self {
        Self {
            url: url.clone(),
            host: url.host_str().unwrap_or("localhost").to_string(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }
}

/// Errors opening or using a broker session
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Broker rejected session: {0}")]
    Rejected(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Connection closed")]
    Closed,
}

/// An open broker session.
///
/// Frames pushed on `outbound` are written to the socket; frames read from
/// the socket arrive on `inbound`. The inbound channel ends when the socket
/// closes, and dropping `outbound` closes the socket.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

/// The far side of a `Link`, held by whatever drives the socket
pub struct LinkPeer {
    pub inbound_tx: mpsc::UnboundedSender<Frame>,
    pub outbound_rx: mpsc::UnboundedReceiver<Frame>,
}

impl Link {
    /// Create a connected link and its driving peer
    pub fn pair() -> (Link, LinkPeer) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        (
            Link { outbound, inbound },
            LinkPeer {
                inbound_tx,
                outbound_rx,
            },
        )
    }
}

/// Opens authenticated broker sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect and complete the CONNECT/CONNECTED handshake
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError>;
}
