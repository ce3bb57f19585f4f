//! Common types for the session engine.

use bytes::Bytes;

/// Quality of Service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub enum QoS {
    /// At most once delivery (fire and forget).
    #[default]
    AtMostOnce = 0,
    /// At least once delivery (PUBACK).
    AtLeastOnce = 1,
    /// Exactly once delivery (PUBREC/PUBREL/PUBCOMP).
    ExactlyOnce = 2,
}

impl QoS {
    /// Whether this level needs a packet identifier.
    pub fn needs_packet_id(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl From<rumqttc::mqttbytes::QoS> for QoS {
    fn from(qos: rumqttc::mqttbytes::QoS) -> Self {
        match qos {
            rumqttc::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
            rumqttc::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
            rumqttc::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

impl From<QoS> for rumqttc::mqttbytes::QoS {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => rumqttc::mqttbytes::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::mqttbytes::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::mqttbytes::QoS::ExactlyOnce,
        }
    }
}

/// MQTT application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Topic name.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// Delivery guarantee.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
}

impl Message {
    /// Create a new QoS 0 message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    /// Set QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }
}

/// Result of a successful CONNECT exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnackInfo {
    /// CONNACK return code (0 on success).
    pub reason_code: u8,
    /// Whether the broker resumed a stored session.
    pub session_present: bool,
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
    Errored,
}

impl SessionState {
    /// Whether the session has been (or is being) torn down.
    pub fn is_closed(self) -> bool {
        matches!(
            self,
            SessionState::Disconnecting | SessionState::Disconnected | SessionState::Errored
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnecting => "disconnecting",
            SessionState::Disconnected => "disconnected",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Key correlating a request with its asynchronous response.
///
/// Identifier-bearing exchanges (PUBLISH at QoS 1/2) use the packet id;
/// CONNECT/CONNACK has no id and is a singleton per connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    PacketId(u16),
    ConnAck,
}

impl CorrelationKey {
    /// The packet identifier, if this key carries one.
    pub fn packet_id(self) -> Option<u16> {
        match self {
            CorrelationKey::PacketId(pkid) => Some(pkid),
            CorrelationKey::ConnAck => None,
        }
    }
}

impl std::fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CorrelationKey::PacketId(pkid) => write!(f, "pkid:{}", pkid),
            CorrelationKey::ConnAck => f.write_str("connack"),
        }
    }
}

/// Asynchronous notification from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Application message published by the broker.
    Message(Message),
    /// Malformed or unexpected traffic, or a refused connection.
    ProtocolError(String),
    /// Transport failed or closed.
    ConnectionLost(String),
    /// Orderly disconnect finished.
    Disconnected,
}
