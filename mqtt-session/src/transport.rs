//! Transport layer for MQTT sessions.
//!
//! A session runs over any duplex byte stream. Only plain TCP is dialed
//! here; TLS or WebSocket streams can be opened by the caller and handed to
//! [`Session::new`](crate::Session::new) directly.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{Error, Result};

/// A duplex byte stream a session can own.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Transport type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// Plain TCP connection.
    Tcp,
}

impl TransportType {
    /// Parse transport type from URL scheme.
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_lowercase().as_str() {
            "tcp" | "mqtt" => Some(TransportType::Tcp),
            _ => None,
        }
    }

    /// Get default port for this transport type.
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Tcp => 1883,
        }
    }
}

/// Resolve a broker URL to `host:port`.
pub fn parse_broker_url(broker_url: &str) -> Result<(TransportType, String)> {
    let url = Url::parse(broker_url)
        .map_err(|e| Error::InvalidConfig(format!("invalid broker url {}: {}", broker_url, e)))?;
    let transport = TransportType::from_scheme(url.scheme())
        .ok_or_else(|| Error::InvalidConfig(format!("unsupported scheme: {}", url.scheme())))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidConfig(format!("broker url has no host: {}", broker_url)))?;
    let port = url.port().unwrap_or_else(|| transport.default_port());
    Ok((transport, format!("{}:{}", host, port)))
}

/// Open a transport to the broker at `broker_url`.
pub async fn dial(broker_url: &str) -> Result<TcpStream> {
    let (transport, addr) = parse_broker_url(broker_url)?;
    debug!("Dialing {} ({:?})", addr, transport);
    let stream = TcpStream::connect(&addr).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
