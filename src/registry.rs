use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::DeliveryError;
use crate::protocol::ServerLine;
use crate::sink::Sink;
use crate::types::ScreenName;

/// One active session as seen through a snapshot.
#[derive(Debug, Clone)]
pub struct Peer {
    pub name: ScreenName,
    pub sink: Sink,
}

/// Outcome of a fan-out. Failures are per recipient and never stop
/// delivery to the rest.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: Vec<(ScreenName, DeliveryError)>,
}

impl Delivery {
    /// The failure recorded for `name`, if any.
    pub fn failure_for(&self, name: &ScreenName) -> Option<DeliveryError> {
        self.failed
            .iter()
            .find(|(failed, _)| failed == name)
            .map(|&(_, err)| err)
    }
}

#[derive(Debug, Default)]
struct Inner {
    names: BTreeSet<ScreenName>,
    sinks: BTreeMap<ScreenName, Sink>,
}

impl Inner {
    fn is_consistent(&self) -> bool {
        self.names.len() == self.sinks.len() && self.names.iter().eq(self.sinks.keys())
    }

    fn peers(&self) -> Vec<Peer> {
        self.sinks
            .iter()
            .map(|(name, sink)| Peer {
                name: name.clone(),
                sink: sink.clone(),
            })
            .collect()
    }

    fn remove(&mut self, name: &ScreenName) -> bool {
        let removed = self.names.remove(name);
        self.sinks.remove(name);
        debug_assert!(self.is_consistent());
        removed
    }
}

/// Who is connected: claimed names and the sink for each.
///
/// Every mutation and every snapshot goes through one `RwLock`, so a
/// name is present in both `names` and `sinks` or in neither. The lock
/// is only held for map work and non-blocking sink enqueues, never for
/// socket I/O.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the write lock and test `name`.
    ///
    /// Returns `None` if the name is taken. Otherwise the returned
    /// `Claim` keeps the lock until it is published or dropped, so no
    /// other session can claim the same name in between.
    pub fn try_claim(&self, name: &ScreenName) -> Option<Claim<'_>> {
        let guard = self.write();
        if guard.names.contains(name) {
            return None;
        }
        Some(Claim {
            guard,
            name: name.clone(),
        })
    }

    /// Remove `name` from both maps and queue `notices` for every
    /// remaining session, in one critical section. Returns false and
    /// sends nothing if `name` was not registered.
    ///
    /// Notices are queued without waiting; a session with no room for
    /// them is evicted rather than left with a stale roster.
    pub fn release(&self, name: &ScreenName, notices: &[ServerLine]) -> bool {
        let mut inner = self.write();
        if !inner.remove(name) {
            return false;
        }
        if !notices.is_empty() {
            for (peer, sink) in &inner.sinks {
                if let Err(e) = sink.deliver_all(notices.to_vec()) {
                    debug!(name = %peer, error = %e, "departure notice not delivered");
                }
            }
        }
        true
    }

    pub fn lookup(&self, name: &str) -> Option<Sink> {
        self.read().sinks.get(name).cloned()
    }

    /// Every active session, ordered by name, as of one instant.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.read().peers()
    }

    /// Send `line` to every session in a snapshot taken now.
    ///
    /// The lock is released before delivering. Each recipient gets at
    /// most its sink's timeout to make room; one that does not is
    /// evicted and recorded as failed, and delivery moves on.
    pub async fn broadcast(&self, line: &ServerLine) -> Delivery {
        let mut delivery = Delivery::default();
        for peer in self.snapshot() {
            match peer.sink.send(line.clone()).await {
                Ok(()) => delivery.delivered += 1,
                Err(e) => {
                    debug!(name = %peer.name, error = %e, "broadcast not delivered");
                    delivery.failed.push((peer.name, e));
                }
            }
        }
        delivery
    }

    pub fn len(&self) -> usize {
        self.read().names.len()
    }

    #[cfg(test)]
    pub fn contains(&self, name: &str) -> bool {
        self.read().names.contains(name)
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `names` and the keys of `sinks` are the same set.
    #[cfg(test)]
    pub fn is_consistent(&self) -> bool {
        self.read().is_consistent()
    }
}

/// A reserved, not yet published name. Holds the registry write lock.
pub struct Claim<'a> {
    guard: RwLockWriteGuard<'a, Inner>,
    name: ScreenName,
}

impl Claim<'_> {
    /// The sessions already active, ordered by name. Never includes the
    /// claimed name.
    pub fn peers(&self) -> Vec<Peer> {
        self.guard.peers()
    }

    /// Register `sink` under the claimed name and release the lock.
    pub fn publish(mut self, sink: Sink) {
        self.guard.names.insert(self.name.clone());
        self.guard.sinks.insert(self.name, sink);
        debug_assert!(self.guard.is_consistent());
    }
}
