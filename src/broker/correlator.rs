//! Pending-request table keyed by an opaque correlation id.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Display;
use std::hash::Hash;

use tokio::sync::oneshot;

use crate::error::ProtocolError;

/// How many expired ids are remembered for late-reply detection.
const EXPIRED_MEMORY: usize = 1024;

/// Outcome of a successful [`Correlator::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller already gave up (timeout); the reply was dropped.
    Late,
}

/// Tracks in-flight requests and hands each reply to exactly one waiter.
///
/// An id is consumed at most once: resolving it removes it, and a second
/// resolve of the same id is an error.
pub struct Correlator<K, T> {
    pending: HashMap<K, oneshot::Sender<T>>,
    expired: VecDeque<K>,
    expired_set: HashSet<K>,
}

impl<K, T> Default for Correlator<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Correlator<K, T>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            pending: HashMap::new(),
            expired: VecDeque::new(),
            expired_set: HashSet::new(),
        }
    }

    /// Register a waiter for `id`.
    pub fn register(&mut self, id: K) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(id.clone(), tx).is_some() {
            tracing::warn!(id = %id, "Correlation id registered twice; previous waiter dropped");
        }
        rx
    }

    /// Deliver `value` to the waiter for `id` and forget it.
    pub fn resolve(&mut self, id: &K, value: T) -> Result<Resolution, ProtocolError> {
        if let Some(tx) = self.pending.remove(id) {
            // A dropped receiver means the caller stopped caring; still consumed.
            let _ = tx.send(value);
            return Ok(Resolution::Delivered);
        }
        if self.expired_set.remove(id) {
            self.expired.retain(|e| e != id);
            return Ok(Resolution::Late);
        }
        Err(ProtocolError::UnknownRequest(id.to_string()))
    }

    /// Stop waiting for `id` and remember it so a late reply is recognised.
    /// Returns false if `id` was no longer pending.
    pub fn expire(&mut self, id: &K) -> bool {
        if self.pending.remove(id).is_none() {
            return false;
        }
        self.expired.push_back(id.clone());
        self.expired_set.insert(id.clone());
        while self.expired.len() > EXPIRED_MEMORY {
            if let Some(oldest) = self.expired.pop_front() {
                self.expired_set.remove(&oldest);
            }
        }
        true
    }

    /// Drop a waiter without remembering it (the request was never sent).
    pub fn cancel(&mut self, id: &K) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Resolve every waiter with a value built by `make`. Returns how many
    /// waiters were failed.
    pub fn fail_all(&mut self, mut make: impl FnMut() -> T) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(make());
        }
        count
    }

    pub fn contains(&self, id: &K) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
