//! Session configuration.

use std::time::Duration;

use crate::codec::MAX_PACKET_SIZE;
use crate::error::{Error, Result};
use crate::types::Message;

/// Default broker URL.
pub const DEFAULT_BROKER_URL: &str = "mqtt://127.0.0.1:1883";

/// Session configuration.
///
/// Only the CONNECT exchange and the connect-phase timeout read these values;
/// `exchange_timeout`, `max_inflight` and `event_capacity` size the session's
/// own bookkeeping.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker URL used by [`Session::dial`](crate::Session::dial).
    pub broker_url: String,
    /// Client ID.
    pub client_id: String,
    /// Clean session flag.
    pub clean_session: bool,
    /// Keep alive interval, sent in whole seconds.
    pub keep_alive: Duration,
    /// How long to wait for CONNACK.
    pub connect_timeout: Duration,
    /// Deadline for each QoS 1/2 publish. `None` waits forever.
    pub exchange_timeout: Option<Duration>,
    /// Last will message.
    pub will: Option<Message>,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Maximum packet size.
    pub max_packet_size: usize,
    /// Size of the packet identifier pool (outstanding QoS 1/2 publishes).
    pub max_inflight: u16,
    /// Buffered events before new ones are dropped.
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            broker_url: DEFAULT_BROKER_URL.to_string(),
            client_id: default_client_id(),
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            exchange_timeout: Some(Duration::from_secs(30)),
            will: None,
            username: None,
            password: None,
            max_packet_size: MAX_PACKET_SIZE,
            max_inflight: u16::MAX,
            event_capacity: 100,
        }
    }
}

impl SessionConfig {
    /// Create a config for the given broker URL and client ID.
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set keep alive interval.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set clean session flag.
    pub fn with_clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set CONNACK timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the per-publish deadline for QoS 1/2. `None` disables it.
    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    /// Set last will message.
    pub fn with_will(mut self, will: Message) -> Self {
        self.will = Some(will);
        self
    }

    /// Limit outstanding QoS 1/2 publishes.
    pub fn with_max_inflight(mut self, max: u16) -> Self {
        self.max_inflight = max;
        self
    }

    /// Set event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Keep alive in seconds as carried by CONNECT.
    pub fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }

    /// Check the configuration for values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_inflight == 0 {
            return Err(Error::InvalidConfig("max_inflight must be at least 1".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect_timeout must be nonzero".into()));
        }
        if self.event_capacity == 0 {
            return Err(Error::InvalidConfig("event_capacity must be at least 1".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(Error::InvalidConfig("password requires a username".into()));
        }
        if let Some(password) = &self.password {
            if std::str::from_utf8(password).is_err() {
                return Err(Error::InvalidConfig("password must be valid UTF-8".into()));
            }
        }
        if let Some(will) = &self.will {
            if will.topic.is_empty() {
                return Err(Error::InvalidConfig("will topic is empty".into()));
            }
        }
        Ok(())
    }
}

/// Generate a client ID of the form `giztoy_xxxxxxxx`.
pub fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("giztoy_{}", &id[..8])
}
