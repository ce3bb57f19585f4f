//! MQTT 3.1.1 client session engine.
//!
//! Drives a single broker connection: the CONNECT handshake, QoS 0/1/2
//! publish flows, inbound acknowledgments and teardown. Every request that
//! expects a response is tracked until it completes, times out or the
//! connection goes away, and its packet identifier is returned to the pool
//! on all of those paths.
//!
//! ## Components
//!
//! - [`Session`]: client-facing handle (connect, publish, disconnect, events)
//! - [`Sequencer`]: per-exchange protocol state machine
//! - [`InflightRegistry`]: pending exchanges keyed by [`CorrelationKey`]
//! - [`PacketIdAllocator`]: lowest-first packet identifier pool
//! - [`PacketCodec`]: push-based decoder over the rumqttc v4 packet types
//!
//! ## Example
//!
//! ```no_run
//! use giztoy_mqtt_session::{DisconnectOptions, Message, QoS, Session, SessionConfig};
//!
//! #[tokio::main]
//! async fn main() -> giztoy_mqtt_session::Result<()> {
//!     let config = SessionConfig::new("mqtt://127.0.0.1:1883", "client-1");
//!     let session = Session::dial(config).await?;
//!
//!     let connack = session.connect().await?;
//!     println!("session_present={}", connack.session_present);
//!
//!     // Resolves on PUBCOMP.
//!     session
//!         .publish(Message::new("test/topic", "hello").with_qos(QoS::ExactlyOnce))
//!         .await?;
//!
//!     session.disconnect(DisconnectOptions::graceful()).await
//! }
//! ```

pub mod codec;
mod config;
mod error;
pub mod inflight;
pub mod packet_id;
pub mod sequencer;
mod session;
pub mod transport;
mod types;

pub use codec::PacketCodec;
pub use config::{DEFAULT_BROKER_URL, SessionConfig, default_client_id};
pub use error::{Error, Result};
pub use inflight::{Continuation, ExchangeState, InflightRegistry};
pub use packet_id::PacketIdAllocator;
pub use sequencer::{Ack, Sequencer, Step};
pub use session::{DisconnectOptions, Session};
pub use transport::{Transport, TransportType};
pub use types::{ConnackInfo, CorrelationKey, Event, Message, QoS, SessionState};
