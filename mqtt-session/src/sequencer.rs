//! Packet sequencer: the per-exchange protocol state machine.
//!
//! Outbound exchanges:
//!
//! | Exchange       | Waits for                         | Completes on |
//! |----------------|-----------------------------------|--------------|
//! | CONNECT        | CONNACK                           | CONNACK      |
//! | PUBLISH QoS 0  | nothing (completed by the writer) | local write  |
//! | PUBLISH QoS 1  | PUBACK                            | PUBACK       |
//! | PUBLISH QoS 2  | PUBREC, then PUBCOMP              | PUBCOMP      |
//!
//! Inbound QoS 2 publishes are remembered from PUBLISH until PUBREL so a
//! redelivery is acknowledged again without reaching the application twice.
//! An inbound message is only acknowledged once the application has taken
//! it; see [`Step::Deliver`].
//!
//! The sequencer owns the [`InflightRegistry`] and the
//! [`PacketIdAllocator`]. An identifier is released on the same call that
//! removes its exchange from the registry, whatever the outcome.

use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::codec::{self, Packet};
use crate::error::{Error, Result};
use crate::inflight::{Continuation, ExchangeState, InflightRegistry};
use crate::packet_id::PacketIdAllocator;
use crate::types::{ConnackInfo, CorrelationKey, Message, QoS};

/// Successful completion of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// CONNACK with return code 0.
    ConnAck(ConnackInfo),
    /// PUBACK or PUBCOMP received.
    Acknowledged,
    /// Packet fully handed to the transport.
    Written,
}

/// What the session must do after the sequencer processed a packet.
#[derive(Debug)]
pub enum Step {
    /// Write this packet to the broker.
    Write(Packet),
    /// Hand this message to the application, then write `ack` if there is
    /// one. If the application cannot take it, call
    /// [`Sequencer::undelivered`] instead and leave the ack unwritten so the
    /// broker redelivers.
    Deliver { message: Message, ack: Option<Packet> },
    /// CONNACK for the pending CONNECT; finish it with
    /// [`Sequencer::complete_connect`].
    ConnAck(ConnackInfo),
    /// The broker broke the protocol; the connection must go.
    Violation(String),
}

/// Drives every in-flight exchange of one session.
#[derive(Debug)]
pub struct Sequencer {
    inflight: InflightRegistry<Ack>,
    ids: PacketIdAllocator,
    /// Inbound QoS 2 identifiers between PUBLISH and PUBREL.
    incoming: HashSet<u16>,
    exchange_timeout: Option<Duration>,
}

impl Sequencer {
    pub fn new(max_inflight: u16, exchange_timeout: Option<Duration>) -> Self {
        Self {
            inflight: InflightRegistry::new(),
            ids: PacketIdAllocator::new(max_inflight),
            incoming: HashSet::new(),
            exchange_timeout,
        }
    }

    /// Start the CONNECT exchange. Returns the packet to write, or `None` if
    /// the exchange was rejected (the continuation already has the error).
    pub fn start_connect(
        &mut self,
        connect: Packet,
        continuation: Continuation<Ack>,
        deadline: Instant,
    ) -> Option<Packet> {
        self.inflight
            .register(
                CorrelationKey::ConnAck,
                continuation,
                ExchangeState::AwaitingConnAck,
                Some(deadline),
            )
            .ok()?;
        Some(connect)
    }

    /// Start a QoS 1/2 publish. Returns the PUBLISH to write, or `None` if no
    /// identifier was free (the continuation already has the error and
    /// nothing must be written).
    pub fn start_publish(
        &mut self,
        message: &Message,
        continuation: Continuation<Ack>,
        now: Instant,
    ) -> Option<Packet> {
        let state = match message.qos {
            QoS::AtLeastOnce => ExchangeState::AwaitingPubAck,
            QoS::ExactlyOnce => ExchangeState::AwaitingPubRec,
            QoS::AtMostOnce => {
                let _ = continuation.send(Err(Error::ProtocolViolation(
                    "QoS 0 publish has no acknowledged exchange".into(),
                )));
                return None;
            }
        };

        let pkid = match self.ids.allocate() {
            Ok(pkid) => pkid,
            Err(e) => {
                warn!("Cannot publish to {}: {}", message.topic, e);
                let _ = continuation.send(Err(e));
                return None;
            }
        };

        let key = CorrelationKey::PacketId(pkid);
        if self
            .inflight
            .register(key, continuation, state, self.deadline(now))
            .is_err()
        {
            error!("Allocator handed out pkid {} that is still in flight", pkid);
            self.release(key);
            return None;
        }

        trace!("Publishing to {} with pkid={} ({:?})", message.topic, pkid, message.qos);
        Some(codec::create_publish(message, pkid, false))
    }

    /// Process one packet from the broker.
    pub fn handle_incoming(&mut self, packet: Packet) -> Vec<Step> {
        match packet {
            Packet::ConnAck(connack) => {
                let info = ConnackInfo {
                    reason_code: codec::connack_code(connack.code),
                    session_present: connack.session_present,
                };
                if self.inflight.contains(CorrelationKey::ConnAck) {
                    vec![Step::ConnAck(info)]
                } else {
                    debug!("Dropping unsolicited CONNACK (code={})", info.reason_code);
                    Vec::new()
                }
            }
            Packet::PubAck(ack) => {
                self.complete(ack.pkid, ExchangeState::AwaitingPubAck, "PUBACK");
                Vec::new()
            }
            Packet::PubRec(rec) => {
                let key = CorrelationKey::PacketId(rec.pkid);
                match self.inflight.state(key) {
                    Some(ExchangeState::AwaitingPubRec) | Some(ExchangeState::AwaitingPubComp) => {
                        let deadline = self.deadline(Instant::now());
                        self.inflight.advance(key, ExchangeState::AwaitingPubComp, deadline);
                        vec![Step::Write(codec::create_pubrel(rec.pkid))]
                    }
                    Some(state) => {
                        warn!("Ignoring PUBREC for pkid={} in state {:?}", rec.pkid, state);
                        Vec::new()
                    }
                    None => {
                        debug!("Dropping unsolicited PUBREC for pkid={}", rec.pkid);
                        Vec::new()
                    }
                }
            }
            Packet::PubComp(comp) => {
                self.complete(comp.pkid, ExchangeState::AwaitingPubComp, "PUBCOMP");
                Vec::new()
            }
            Packet::Publish(publish) => self.handle_publish(publish),
            Packet::PubRel(rel) => {
                if !self.incoming.remove(&rel.pkid) {
                    debug!("PUBREL for unknown pkid={}, completing anyway", rel.pkid);
                }
                vec![Step::Write(codec::create_pubcomp(rel.pkid))]
            }
            Packet::PingResp => Vec::new(),
            Packet::SubAck(ack) => {
                debug!("Dropping unsolicited SUBACK for pkid={}", ack.pkid);
                Vec::new()
            }
            Packet::UnsubAck(ack) => {
                debug!("Dropping unsolicited UNSUBACK for pkid={}", ack.pkid);
                Vec::new()
            }
            other => vec![Step::Violation(format!(
                "broker sent {}",
                codec::packet_name(&other)
            ))],
        }
    }

    fn handle_publish(&mut self, publish: codec::Publish) -> Vec<Step> {
        let qos = QoS::from(publish.qos);
        if qos.needs_packet_id() && publish.pkid == 0 {
            return vec![Step::Violation(format!(
                "{:?} PUBLISH on {} without packet id",
                qos, publish.topic
            ))];
        }

        let pkid = publish.pkid;
        let message = Message {
            topic: publish.topic,
            payload: publish.payload,
            qos,
            retain: publish.retain,
        };

        match qos {
            QoS::AtMostOnce => vec![Step::Deliver { message, ack: None }],
            QoS::AtLeastOnce => vec![Step::Deliver {
                message,
                ack: Some(codec::create_puback(pkid)),
            }],
            QoS::ExactlyOnce => {
                if self.incoming.insert(pkid) {
                    vec![Step::Deliver {
                        message,
                        ack: Some(codec::create_pubrec(pkid)),
                    }]
                } else {
                    debug!(
                        "Redelivered QoS 2 PUBLISH pkid={} (dup={}), acknowledging again",
                        pkid, publish.dup
                    );
                    vec![Step::Write(codec::create_pubrec(pkid))]
                }
            }
        }
    }

    /// Forget an inbound message the application did not take, given the
    /// ack that was held back. A QoS 2 redelivery is then treated as new.
    pub fn undelivered(&mut self, ack: &Packet) {
        if let Packet::PubRec(rec) = ack {
            self.incoming.remove(&rec.pkid);
        }
    }

    /// Complete the pending CONNECT with the CONNACK the broker sent.
    ///
    /// Split from [`handle_incoming`](Self::handle_incoming) so the session
    /// can move to its next state before the caller is woken.
    pub fn complete_connect(&mut self, info: ConnackInfo) -> bool {
        let result = if info.reason_code == 0 {
            Ok(Ack::ConnAck(info))
        } else {
            Err(Error::ConnectionRefused {
                code: info.reason_code,
                reason: codec::connack_reason(info.reason_code).to_string(),
            })
        };
        self.finish(CorrelationKey::ConnAck, result)
    }

    /// Fail one pending exchange with `error` and release its identifier.
    pub fn abort(&mut self, key: CorrelationKey, error: Error) -> bool {
        self.finish(key, Err(error))
    }

    /// Expire every exchange past its deadline. Returns the expired keys.
    pub fn expire_due(&mut self, now: Instant) -> Vec<CorrelationKey> {
        let expired = self.inflight.expire_due(now);
        for key in &expired {
            debug!("Exchange {} timed out", key);
            self.release(*key);
        }
        expired
    }

    /// Fail every pending exchange; used once on teardown.
    pub fn fail_all(&mut self, reason: impl Fn() -> Error) -> usize {
        let failed = self.inflight.fail_all(reason);
        for key in &failed {
            self.release(*key);
        }
        self.incoming.clear();
        failed.len()
    }

    /// Earliest deadline of any pending exchange.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight.next_deadline()
    }

    /// Whether `key` is still waiting.
    pub fn is_pending(&self, key: CorrelationKey) -> bool {
        self.inflight.contains(key)
    }

    /// Number of pending exchanges.
    pub fn pending(&self) -> usize {
        self.inflight.len()
    }

    /// Number of packet identifiers in use.
    pub fn ids_in_use(&self) -> usize {
        self.ids.in_use()
    }

    fn complete(&mut self, pkid: u16, expected: ExchangeState, name: &str) {
        let key = CorrelationKey::PacketId(pkid);
        match self.inflight.state(key) {
            Some(state) if state == expected => {
                self.finish(key, Ok(Ack::Acknowledged));
                trace!("{} completed pkid={}", name, pkid);
            }
            Some(state) => warn!("Ignoring {} for pkid={} in state {:?}", name, pkid, state),
            None => debug!("Dropping unsolicited {} for pkid={}", name, pkid),
        }
    }

    /// Resolve `key` and release its identifier in one step.
    fn finish(&mut self, key: CorrelationKey, result: Result<Ack>) -> bool {
        if !self.inflight.resolve(key, result) {
            return false;
        }
        self.release(key);
        true
    }

    fn release(&mut self, key: CorrelationKey) {
        if let Some(pkid) = key.packet_id() {
            if let Err(e) = self.ids.release(pkid) {
                error!("Releasing {}: {}", key, e);
            }
        }
    }

    fn deadline(&self, now: Instant) -> Option<Instant> {
        self.exchange_timeout.map(|timeout| now + timeout)
    }
}
