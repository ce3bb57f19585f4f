//! Error types for the MQTT session engine.

use std::io;

/// Result type alias for the session engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected packet from the broker.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An outgoing packet could not be encoded, e.g. it exceeds the
    /// maximum packet size. Only the operation that built it fails.
    #[error("cannot encode packet: {0}")]
    Encode(String),

    /// Connection refused by broker (nonzero CONNACK code).
    #[error("connection refused: {reason} (code {code})")]
    ConnectionRefused { code: u8, reason: String },

    /// No CONNACK within the connect timeout.
    #[error("connack timeout")]
    ConnackTimeout,

    /// An acknowledged exchange passed its deadline.
    #[error("exchange timeout for packet id {pkid}")]
    ExchangeTimeout { pkid: u16 },

    /// Transport failed or closed under the session.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Every packet identifier is in use.
    #[error("packet identifier space exhausted")]
    IdentifierSpaceExhausted,

    /// Release of an identifier that is not allocated.
    #[error("packet identifier {0} is not allocated")]
    IdentifierNotAllocated(u16),

    /// A pending exchange already owns this correlation key.
    #[error("duplicate correlation key: {0}")]
    DuplicateKey(String),

    /// Operation requires a connected session.
    #[error("not connected")]
    NotConnected,

    /// A connect is already in progress.
    #[error("already connecting")]
    AlreadyConnecting,

    /// The session is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// The session has been torn down.
    #[error("session closed")]
    SessionClosed,

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
}

impl Error {
    /// Whether this error tears the whole connection down rather than
    /// failing a single operation.
    pub fn is_connection_scoped(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ProtocolViolation(_)
                | Error::ConnectionLost(_)
                | Error::ConnectionRefused { .. }
                | Error::ConnackTimeout
        )
    }
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::ProtocolViolation(e.to_string())
    }
}
