//! Packet codec.
//!
//! Wraps the MQTT 3.1.1 (v4) packet types from rumqttc in a push-based
//! decoder: feed whatever bytes the transport produced, get back every
//! complete packet. Partial frames stay buffered until the next call.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::types::Message;

pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, LastWill, Packet, PubAck, PubComp, PubRec, PubRel, Publish,
};
pub use rumqttc::mqttbytes::QoS as WireQoS;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Stateful packet decoder and stateless encoder.
#[derive(Debug)]
pub struct PacketCodec {
    buf: BytesMut,
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            max_packet_size,
        }
    }

    /// Feed bytes and return every packet completed by them.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<Packet>> {
        self.buf.extend_from_slice(data);

        let mut packets = Vec::new();
        while !self.buf.is_empty() {
            match Packet::read(&mut self.buf, self.max_packet_size) {
                Ok(packet) => packets.push(packet),
                Err(rumqttc::mqttbytes::Error::InsufficientBytes(_)) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(packets)
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Encode one packet.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(packet.size());
        packet
            .write(&mut buf, self.max_packet_size)
            .map_err(|e| Error::Encode(e.to_string()))?;
        Ok(buf.freeze())
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

/// Short name of a packet for logs and errors.
pub fn packet_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Connect(_) => "CONNECT",
        Packet::ConnAck(_) => "CONNACK",
        Packet::Publish(_) => "PUBLISH",
        Packet::PubAck(_) => "PUBACK",
        Packet::PubRec(_) => "PUBREC",
        Packet::PubRel(_) => "PUBREL",
        Packet::PubComp(_) => "PUBCOMP",
        Packet::Subscribe(_) => "SUBSCRIBE",
        Packet::SubAck(_) => "SUBACK",
        Packet::Unsubscribe(_) => "UNSUBSCRIBE",
        Packet::UnsubAck(_) => "UNSUBACK",
        Packet::PingReq => "PINGREQ",
        Packet::PingResp => "PINGRESP",
        Packet::Disconnect => "DISCONNECT",
    }
}

/// Numeric CONNACK return code.
pub fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

/// Human-readable reason for a CONNACK return code.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "success",
        1 => "unacceptable protocol version",
        2 => "identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown reason",
    }
}

/// Create a CONNECT packet.
pub fn create_connect(
    client_id: &str,
    username: Option<&str>,
    password: Option<&str>,
    keep_alive: u16,
    clean_session: bool,
    will: Option<&Message>,
) -> Packet {
    let mut connect = Connect::new(client_id);
    connect.keep_alive = keep_alive;
    connect.clean_session = clean_session;

    if let Some(user) = username {
        connect.set_login(user, password.unwrap_or(""));
    }

    if let Some(will) = will {
        connect.last_will = Some(LastWill::new(
            will.topic.as_str(),
            will.payload.to_vec(),
            will.qos.into(),
            will.retain,
        ));
    }

    Packet::Connect(connect)
}

/// Create a CONNACK packet.
pub fn create_connack(session_present: bool, code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(code, session_present))
}

/// Create a PUBLISH packet. `pkid` must be 0 for QoS 0.
pub fn create_publish(message: &Message, pkid: u16, dup: bool) -> Packet {
    let mut publish = Publish::new(message.topic.as_str(), message.qos.into(), message.payload.to_vec());
    publish.retain = message.retain;
    publish.pkid = pkid;
    publish.dup = dup;
    Packet::Publish(publish)
}

/// Create a PUBACK packet.
pub fn create_puback(pkid: u16) -> Packet {
    Packet::PubAck(PubAck::new(pkid))
}

/// Create a PUBREC packet.
pub fn create_pubrec(pkid: u16) -> Packet {
    Packet::PubRec(PubRec::new(pkid))
}

/// Create a PUBREL packet.
pub fn create_pubrel(pkid: u16) -> Packet {
    Packet::PubRel(PubRel::new(pkid))
}

/// Create a PUBCOMP packet.
pub fn create_pubcomp(pkid: u16) -> Packet {
    Packet::PubComp(PubComp::new(pkid))
}

/// Create a DISCONNECT packet.
pub fn create_disconnect() -> Packet {
    Packet::Disconnect
}
