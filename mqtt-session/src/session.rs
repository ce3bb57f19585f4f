//! MQTT session: one broker connection from CONNECT to teardown.
//!
//! A [`Session`] is a cheap handle. The connection itself is driven by a
//! spawned session task that owns the codec, the [`Sequencer`] and the state.
//! Two helper tasks sit on the transport: a reader that forwards whatever the
//! transport produced, and a writer that writes one packet at a time.
//!
//! ```text
//!  Session::connect/publish/disconnect
//!              │ Command + oneshot
//!              ▼
//!        session task ──WriteRequest──▶ writer task ──▶ transport
//!              ▲
//!              └──────── Inbound ◀──── reader task ◀── transport
//! ```
//!
//! Inbound packets, commands and deadline expirations are handled one at a
//! time by the session task, so exchange state is never mutated concurrently.

use std::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{Instrument, debug, info, info_span, trace, warn};

use crate::codec::{self, Packet, PacketCodec};
use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::inflight::Continuation;
use crate::sequencer::{Ack, Sequencer, Step};
use crate::transport::{self, Transport};
use crate::types::{ConnackInfo, CorrelationKey, Event, Message, QoS, SessionState};

/// How long a graceful disconnect may spend flushing queued writes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Commands queued to the session task before it stops accepting them.
const COMMAND_CAPACITY: usize = 64;

/// Transport notifications queued to the session task.
const INBOUND_CAPACITY: usize = 64;

const READ_BUFFER_SIZE: usize = 4096;

/// Options for [`Session::disconnect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectOptions {
    /// Close the transport right away without sending DISCONNECT or flushing
    /// queued writes.
    pub force: bool,
}

impl DisconnectOptions {
    /// Graceful disconnect.
    pub fn graceful() -> Self {
        Self { force: false }
    }

    /// Forced disconnect.
    pub fn forced() -> Self {
        Self { force: true }
    }
}

enum Command {
    Connect(Continuation<Ack>),
    Publish(Message, Continuation<Ack>),
    Disconnect(bool, oneshot::Sender<()>),
}

enum Inbound {
    Data(Bytes),
    Error(String),
    Closed,
}

struct WriteRequest {
    bytes: Bytes,
    done: Option<Continuation<Ack>>,
}

/// Handle to a running MQTT session.
///
/// Dropping the last handle tears the connection down without sending
/// DISCONNECT.
pub struct Session {
    client_id: String,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    events: Mutex<mpsc::Receiver<Event>>,
    disconnect_requested: AtomicBool,
}

impl Session {
    /// Start a session over an already open transport.
    ///
    /// Nothing is written until [`connect`](Self::connect). Must be called
    /// within a Tokio runtime.
    pub fn new<T: Transport>(transport: T, config: SessionConfig) -> Result<Self> {
        config.validate()?;

        let span = info_span!("mqtt_session", client_id = %config.client_id);
        let (reader, writer) = tokio::io::split(transport);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let queued = Arc::new(AtomicUsize::new(0));

        let reader = tokio::spawn(read_loop(reader, inbound_tx.clone()).instrument(span.clone()));
        let writer = tokio::spawn(
            write_loop(writer, outbox_rx, Arc::clone(&queued), inbound_tx).instrument(span.clone()),
        );

        let client_id = config.client_id.clone();
        let task = SessionTask {
            codec: PacketCodec::new(config.max_packet_size),
            sequencer: Sequencer::new(config.max_inflight, config.exchange_timeout),
            config,
            state: SessionState::Idle,
            state_tx,
            events: event_tx,
            outbox: Some(outbox_tx),
            queued,
            reader: Some(reader),
            writer: Some(writer),
            torn_down: false,
        };
        tokio::spawn(task.run(command_rx, inbound_rx).instrument(span));

        Ok(Self {
            client_id,
            commands: command_tx,
            state: state_rx,
            events: Mutex::new(event_rx),
            disconnect_requested: AtomicBool::new(false),
        })
    }

    /// Dial `config.broker_url` and start a session over it.
    pub async fn dial(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let stream = transport::dial(&config.broker_url).await?;
        Self::new(stream, config)
    }

    /// Get the client ID.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Check if the session is connected.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Send CONNECT and wait for CONNACK.
    ///
    /// Fails with `AlreadyConnecting` or `AlreadyConnected` if a connect
    /// already happened, and with `SessionClosed` once the session was torn
    /// down. A refused CONNACK or a missing one errors the session.
    pub async fn connect(&self) -> Result<ConnackInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect(tx))
            .await
            .map_err(|_| Error::SessionClosed)?;

        let result = match rx.await {
            Ok(Ok(Ack::ConnAck(info))) => Ok(info),
            Ok(Ok(other)) => Err(Error::ProtocolViolation(format!("CONNECT completed with {:?}", other))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::SessionClosed),
        };

        let settle = match &result {
            Ok(_) => true,
            Err(e) => e.is_connection_scoped(),
        };
        if settle {
            // Deadline expiry wakes the caller before the session task has
            // finished tearing down.
            let mut state = self.state.clone();
            let _ = state.wait_for(|s| *s != SessionState::Connecting).await;
        }
        result
    }

    /// Publish a message.
    ///
    /// QoS 0 completes once the packet is written. QoS 1 completes on PUBACK
    /// and QoS 2 on PUBCOMP.
    pub async fn publish(&self, message: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Publish(message, tx))
            .await
            .map_err(|_| Error::NotConnected)?;

        match rx.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::ConnectionLost("write cancelled by teardown".into())),
        }
    }

    /// Close the session.
    ///
    /// Returns immediately if a disconnect is already under way or done.
    /// Only the first call waits for the teardown to finish.
    pub async fn disconnect(&self, options: DisconnectOptions) -> Result<()> {
        if self.state().is_closed() {
            return Ok(());
        }
        let Ok(permit) = self.commands.reserve().await else {
            return Ok(());
        };
        if self.disconnect_requested.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        permit.send(Command::Disconnect(options.force, tx));
        let _ = rx.await;
        Ok(())
    }

    /// Receive the next event. Returns `None` once the session task is gone
    /// and every buffered event was read.
    pub async fn recv(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }

    /// Receive the next event, giving up after `duration`.
    pub async fn recv_timeout(&self, duration: Duration) -> Option<Event> {
        timeout(duration, self.recv()).await.ok().flatten()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    Graceful,
    Forced,
}

struct SessionTask {
    config: SessionConfig,
    codec: PacketCodec,
    sequencer: Sequencer,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    events: mpsc::Sender<Event>,
    outbox: Option<mpsc::UnboundedSender<WriteRequest>>,
    queued: Arc<AtomicUsize>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl SessionTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, inbound: mpsc::Receiver<Inbound>) {
        let mut inbound = Some(inbound);
        loop {
            let deadline = self.sequencer.next_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All session handles dropped");
                        self.teardown(Teardown::Forced, SessionState::Disconnected, || {
                            Error::ConnectionLost("session dropped".into())
                        })
                        .await;
                        break;
                    }
                },
                msg = next_inbound(&mut inbound) => match msg {
                    Some(msg) => self.handle_inbound(msg).await,
                    None => {
                        inbound = None;
                        self.connection_lost("transport tasks exited".into()).await;
                    }
                },
                _ = sleep_until_deadline(deadline) => self.expire_due().await,
            }

            if self.torn_down {
                // Stop acting on a transport that has been discarded.
                inbound = None;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(reply) => self.start_connect(reply).await,
            Command::Publish(message, reply) => self.start_publish(message, reply),
            Command::Disconnect(force, reply) => {
                if self.torn_down {
                    let _ = reply.send(());
                    return;
                }
                let mode = if force { Teardown::Forced } else { Teardown::Graceful };
                info!("Disconnecting ({:?})", mode);
                self.teardown(mode, SessionState::Disconnected, || {
                    Error::ConnectionLost("session disconnected".into())
                })
                .await;
                let _ = reply.send(());
            }
        }
    }

    async fn start_connect(&mut self, reply: Continuation<Ack>) {
        let err = match self.state {
            SessionState::Idle => None,
            SessionState::Connecting => Some(Error::AlreadyConnecting),
            SessionState::Connected => Some(Error::AlreadyConnected),
            _ => Some(Error::SessionClosed),
        };
        if let Some(err) = err {
            let _ = reply.send(Err(err));
            return;
        }

        debug!(
            "Connecting (clean_session={}, keep_alive={}s)",
            self.config.clean_session,
            self.config.keep_alive_secs()
        );
        let password = match self.config.password.as_deref().map(std::str::from_utf8).transpose() {
            Ok(password) => password,
            Err(_) => {
                let _ = reply.send(Err(Error::InvalidConfig("password must be valid UTF-8".into())));
                return;
            }
        };
        let packet = codec::create_connect(
            &self.config.client_id,
            self.config.username.as_deref(),
            password,
            self.config.keep_alive_secs(),
            self.config.clean_session,
            self.config.will.as_ref(),
        );
        // Nothing has been written yet, so the session stays idle.
        let bytes = match self.codec.encode(&packet) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to encode CONNECT: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
        };
        let deadline = Instant::now() + self.config.connect_timeout;
        if self.sequencer.start_connect(packet, reply, deadline).is_none() {
            return;
        }
        self.set_state(SessionState::Connecting);
        self.enqueue(bytes, None);
    }

    fn start_publish(&mut self, message: Message, reply: Continuation<Ack>) {
        if self.state != SessionState::Connected {
            let _ = reply.send(Err(Error::NotConnected));
            return;
        }

        if message.qos == QoS::AtMostOnce {
            trace!("Publishing to {} ({} bytes)", message.topic, message.payload.len());
            match self.codec.encode(&codec::create_publish(&message, 0, false)) {
                Ok(bytes) => self.enqueue(bytes, Some(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
            return;
        }

        let Some(packet) = self.sequencer.start_publish(&message, reply, Instant::now()) else {
            return;
        };
        match self.codec.encode(&packet) {
            Ok(bytes) => self.enqueue(bytes, None),
            Err(e) => {
                if let Packet::Publish(publish) = &packet {
                    warn!("Failed to encode PUBLISH to {}: {}", message.topic, e);
                    self.sequencer.abort(CorrelationKey::PacketId(publish.pkid), e);
                }
            }
        }
    }

    async fn handle_inbound(&mut self, msg: Inbound) {
        match msg {
            Inbound::Data(data) => {
                // A deadline that passed while the bytes were in flight wins
                // over the response they carry.
                self.expire_due().await;
                if self.torn_down {
                    return;
                }
                let packets = match self.codec.decode(&data) {
                    Ok(packets) => packets,
                    Err(e) => {
                        self.protocol_violation(e.to_string()).await;
                        return;
                    }
                };
                for packet in packets {
                    self.handle_packet(packet).await;
                    if self.torn_down {
                        return;
                    }
                }
            }
            Inbound::Error(cause) => self.connection_lost(cause).await,
            Inbound::Closed => self.connection_lost("transport closed".into()).await,
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        trace!("Received {}", codec::packet_name(&packet));
        if self.state == SessionState::Connecting && !matches!(packet, Packet::ConnAck(_)) {
            let msg = format!("expected CONNACK, got {}", codec::packet_name(&packet));
            self.protocol_violation(msg).await;
            return;
        }

        for step in self.sequencer.handle_incoming(packet) {
            match step {
                Step::Write(reply) => self.write_packet(&reply),
                Step::Deliver { message, ack } => self.deliver(message, ack),
                Step::ConnAck(info) => self.on_connack(info).await,
                Step::Violation(msg) => {
                    self.protocol_violation(msg).await;
                    return;
                }
            }
        }
    }

    /// Hand an inbound message to the application. The ack is written only
    /// if it was taken; otherwise the broker is left to redeliver.
    fn deliver(&mut self, message: Message, ack: Option<Packet>) {
        trace!("Received message on {}", message.topic);
        match self.events.try_send(Event::Message(message)) {
            Ok(()) => {
                if let Some(ack) = ack {
                    self.write_packet(&ack);
                }
            }
            Err(e) => {
                let Event::Message(message) = e.into_inner() else {
                    return;
                };
                match &ack {
                    Some(ack) => {
                        warn!(
                            "Event channel full, leaving {:?} message on {} unacknowledged",
                            message.qos, message.topic
                        );
                        self.sequencer.undelivered(ack);
                    }
                    None => warn!("Event channel full, dropping message on {}", message.topic),
                }
            }
        }
    }

    fn write_packet(&mut self, packet: &Packet) {
        match self.codec.encode(packet) {
            Ok(bytes) => self.enqueue(bytes, None),
            Err(e) => warn!("Failed to encode {}: {}", codec::packet_name(packet), e),
        }
    }

    async fn on_connack(&mut self, info: ConnackInfo) {
        if info.reason_code == 0 {
            self.set_state(SessionState::Connected);
            self.sequencer.complete_connect(info);
            info!("Connected, session_present={}", info.session_present);
            return;
        }

        let reason = codec::connack_reason(info.reason_code);
        warn!("Connection refused: {} (code {})", reason, info.reason_code);
        self.set_state(SessionState::Errored);
        self.sequencer.complete_connect(info);
        self.emit(Event::ProtocolError(format!(
            "connection refused: {} (code {})",
            reason, info.reason_code
        )));
        self.teardown(Teardown::Forced, SessionState::Errored, || {
            Error::ConnectionLost("connection refused".into())
        })
        .await;
    }

    async fn expire_due(&mut self) {
        let expired = self.sequencer.expire_due(Instant::now());
        if expired.contains(&CorrelationKey::ConnAck) {
            warn!("No CONNACK within {:?}", self.config.connect_timeout);
            self.teardown(Teardown::Forced, SessionState::Errored, || {
                Error::ConnectionLost("connack timeout".into())
            })
            .await;
        }
    }

    async fn protocol_violation(&mut self, msg: String) {
        if self.torn_down {
            return;
        }
        warn!("Protocol violation: {}", msg);
        self.emit(Event::ProtocolError(msg.clone()));
        self.teardown(Teardown::Forced, SessionState::Errored, || {
            Error::ProtocolViolation(msg.clone())
        })
        .await;
    }

    async fn connection_lost(&mut self, cause: String) {
        if self.torn_down {
            return;
        }
        warn!("Connection lost: {}", cause);
        self.emit(Event::ConnectionLost(cause.clone()));
        self.teardown(Teardown::Forced, SessionState::Errored, || {
            Error::ConnectionLost(cause.clone())
        })
        .await;
    }

    /// Release the transport and fail everything still pending. Runs once.
    async fn teardown(&mut self, mode: Teardown, final_state: SessionState, reason: impl Fn() -> Error) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        let was_connected = self.state == SessionState::Connected;
        self.set_state(match final_state {
            SessionState::Disconnected => SessionState::Disconnecting,
            other => other,
        });

        let failed = self.sequencer.fail_all(reason);
        if failed > 0 {
            debug!("Failed {} pending exchanges", failed);
        }

        if let Some(reader) = self.reader.take() {
            reader.abort();
        }

        let outbox = self.outbox.take();
        if let Some(mut writer) = self.writer.take() {
            match mode {
                Teardown::Graceful => {
                    if let Some(outbox) = &outbox {
                        if was_connected {
                            match self.codec.encode(&codec::create_disconnect()) {
                                Ok(bytes) => {
                                    self.queued.fetch_add(1, Ordering::SeqCst);
                                    let _ = outbox.send(WriteRequest { bytes, done: None });
                                }
                                Err(e) => warn!("Failed to encode DISCONNECT: {}", e),
                            }
                        }
                    }
                    // Closing the outbox lets the writer drain and shut down.
                    drop(outbox);
                    if timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
                        warn!(
                            "Writer did not drain within {:?}, {} writes dropped",
                            DRAIN_TIMEOUT,
                            self.queued.load(Ordering::SeqCst)
                        );
                        writer.abort();
                    }
                }
                Teardown::Forced => {
                    let dropped = self.queued.load(Ordering::SeqCst);
                    if dropped > 0 {
                        debug!("Dropping {} queued writes", dropped);
                    }
                    writer.abort();
                    drop(outbox);
                }
            }
        }

        self.set_state(final_state);
        if final_state == SessionState::Disconnected {
            self.emit(Event::Disconnected);
        }
        info!("Session closed ({})", final_state);
    }

    fn enqueue(&mut self, bytes: Bytes, done: Option<Continuation<Ack>>) {
        let Some(outbox) = &self.outbox else {
            if let Some(done) = done {
                let _ = done.send(Err(Error::NotConnected));
            }
            return;
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        if let Err(mpsc::error::SendError(req)) = outbox.send(WriteRequest { bytes, done }) {
            // Writer already exited; it reported why on the inbound channel.
            self.queued.fetch_sub(1, Ordering::SeqCst);
            if let Some(done) = req.done {
                let _ = done.send(Err(Error::ConnectionLost("writer closed".into())));
            }
        }
    }

    fn emit(&self, event: Event) {
        if let Err(mpsc::error::TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("Event channel full, dropping {:?}", event);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("State {} -> {}", self.state, state);
            self.state = state;
            self.state_tx.send_replace(state);
        }
    }
}

async fn next_inbound(inbound: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => future::pending().await,
    }
}

async fn read_loop<T: Transport>(mut reader: ReadHalf<T>, inbound: mpsc::Sender<Inbound>) {
    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let msg = match reader.read_buf(&mut buf).await {
            Ok(0) => Inbound::Closed,
            Ok(n) => {
                trace!("Read {} bytes", n);
                Inbound::Data(buf.split().freeze())
            }
            Err(e) => Inbound::Error(e.to_string()),
        };
        let last = !matches!(msg, Inbound::Data(_));
        if inbound.send(msg).await.is_err() || last {
            return;
        }
        buf.reserve(READ_BUFFER_SIZE);
    }
}

async fn write_loop<T: Transport>(
    mut writer: WriteHalf<T>,
    mut outbox: mpsc::UnboundedReceiver<WriteRequest>,
    queued: Arc<AtomicUsize>,
    inbound: mpsc::Sender<Inbound>,
) {
    while let Some(req) = outbox.recv().await {
        queued.fetch_sub(1, Ordering::SeqCst);
        let result = async {
            writer.write_all(&req.bytes).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(done) = req.done {
                    let _ = done.send(Ok(Ack::Written));
                }
            }
            Err(e) => {
                debug!("Write failed: {}", e);
                if let Some(done) = req.done {
                    let _ = done.send(Err(Error::ConnectionLost(e.to_string())));
                }
                let _ = inbound.send(Inbound::Error(e.to_string())).await;
                return;
            }
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!("Transport shutdown failed: {}", e);
    }
}
