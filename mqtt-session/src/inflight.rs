//! Registry of exchanges waiting for a response.
//!
//! Every pending exchange owns a `oneshot` continuation. Removing the entry
//! from the map is the only way to reach the continuation, so `resolve`,
//! `expire` and `fail_all` can each fire it at most once and never race each
//! other on the same key.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::types::CorrelationKey;

/// Completion handle for one exchange.
pub type Continuation<T> = oneshot::Sender<Result<T>>;

/// Where an exchange stands in its handshake, named by what it waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// CONNECT sent.
    AwaitingConnAck,
    /// QoS 1 PUBLISH sent.
    AwaitingPubAck,
    /// QoS 2 PUBLISH sent.
    AwaitingPubRec,
    /// QoS 2 PUBREC received and PUBREL sent.
    AwaitingPubComp,
}

#[derive(Debug)]
struct Pending<T> {
    continuation: Continuation<T>,
    deadline: Option<Instant>,
    state: ExchangeState,
}

/// Pending exchanges keyed by correlation key.
#[derive(Debug)]
pub struct InflightRegistry<T> {
    pending: HashMap<CorrelationKey, Pending<T>>,
}

impl<T> Default for InflightRegistry<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<T> InflightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new exchange.
    ///
    /// If `key` is already pending the new continuation is rejected with
    /// `DuplicateKey` right away and the existing exchange is left alone.
    pub fn register(
        &mut self,
        key: CorrelationKey,
        continuation: Continuation<T>,
        state: ExchangeState,
        deadline: Option<Instant>,
    ) -> Result<()> {
        if self.pending.contains_key(&key) {
            let _ = continuation.send(Err(Error::DuplicateKey(key.to_string())));
            return Err(Error::DuplicateKey(key.to_string()));
        }
        self.pending.insert(
            key,
            Pending {
                continuation,
                deadline,
                state,
            },
        );
        Ok(())
    }

    /// Complete the exchange for `key`.
    ///
    /// Returns false if nothing was pending, which is how late or duplicate
    /// acknowledgments are dropped.
    pub fn resolve(&mut self, key: CorrelationKey, result: Result<T>) -> bool {
        match self.pending.remove(&key) {
            Some(entry) => {
                // The caller may have stopped waiting; the entry is gone either way.
                let _ = entry.continuation.send(result);
                true
            }
            None => false,
        }
    }

    /// Fail the exchange for `key` with its timeout error, if still pending.
    pub fn expire(&mut self, key: CorrelationKey) -> bool {
        let err = match key {
            CorrelationKey::ConnAck => Error::ConnackTimeout,
            CorrelationKey::PacketId(pkid) => Error::ExchangeTimeout { pkid },
        };
        self.resolve(key, Err(err))
    }

    /// Expire every exchange whose deadline is at or before `now`.
    pub fn expire_due(&mut self, now: Instant) -> Vec<CorrelationKey> {
        let due: Vec<CorrelationKey> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(key, _)| *key)
            .collect();
        due.into_iter().filter(|key| self.expire(*key)).collect()
    }

    /// Fail every pending exchange. `reason` builds one error per exchange.
    pub fn fail_all(&mut self, reason: impl Fn() -> Error) -> Vec<CorrelationKey> {
        let mut keys = Vec::with_capacity(self.pending.len());
        for (key, entry) in self.pending.drain() {
            let _ = entry.continuation.send(Err(reason()));
            keys.push(key);
        }
        keys
    }

    /// Earliest deadline among pending exchanges.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().filter_map(|entry| entry.deadline).min()
    }

    /// Handshake state of a pending exchange.
    pub fn state(&self, key: CorrelationKey) -> Option<ExchangeState> {
        self.pending.get(&key).map(|entry| entry.state)
    }

    /// Move a pending exchange to its next waiting state with a fresh deadline.
    pub fn advance(&mut self, key: CorrelationKey, state: ExchangeState, deadline: Option<Instant>) -> bool {
        match self.pending.get_mut(&key) {
            Some(entry) => {
                entry.state = state;
                entry.deadline = deadline;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: CorrelationKey) -> bool {
        self.pending.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
