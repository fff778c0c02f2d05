//! Cache Entries
//!
//! A cache entry is a node-local replica of one remote summary's latest
//! outcome, shared by every local consumer of that summary. Each consumer
//! holds its own [`Enumerator`](super::Enumerator) on the entry.
//!
//! # Lifetime
//!
//! An entry lives in the node's [`CacheDirectory`] exactly as long as it has
//! subscribers. The last unsubscribe evicts it synchronously. A later demand
//! for the same key creates a *new* entry; identity, not key, decides whether
//! a caller still talks to the live one. Callers that lose a race against an
//! eviction get `None` from [`CacheEntry::subscribe`] and must retry.
//!
//! # Ordering
//!
//! Pushes for one key can overtake each other in transit. Every push carries
//! the producer's [`Version`], and an entry never replaces its outcome with
//! an older one.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::enumerator::EnumeratorCore;
use super::subscriber::ConsumerId;
use crate::codec::Outcome;
use crate::runtime::{CallKey, TimerHandle, Version};

/// What the entry has received from its producer so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    NotYetReceived,
    HasResult,
    HasException,
}

/// Source of entry subscription ids; increasing for the life of the process.
static SUBSCRIPTION_COUNTER: AtomicU64 = AtomicU64::new(1);

struct CacheInner {
    latest: Option<Outcome>,
    version: Option<Version>,
    enumerators: HashMap<ConsumerId, Arc<EnumeratorCore>>,
    evicted: bool,
}

/// Node-local replica of one summary's outcome.
pub struct CacheEntry {
    key: CallKey,
    subscription: u64,
    inner: Mutex<CacheInner>,
    lease_timer: Mutex<Option<TimerHandle>>,
}

impl CacheEntry {
    fn new(key: CallKey) -> Self {
        Self {
            key,
            subscription: SUBSCRIPTION_COUNTER.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(CacheInner {
                latest: None,
                version: None,
                enumerators: HashMap::new(),
                evicted: false,
            }),
            lease_timer: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &CallKey {
        &self.key
    }

    /// Id this entry uses in its requests to the producer.
    pub fn subscription(&self) -> u64 {
        self.subscription
    }

    pub fn status(&self) -> CacheStatus {
        match &self.inner.lock().latest {
            None => CacheStatus::NotYetReceived,
            Some(outcome) if outcome.is_failure() => CacheStatus::HasException,
            Some(_) => CacheStatus::HasResult,
        }
    }

    /// The most recent outcome pushed by the producer.
    pub fn latest(&self) -> Option<Outcome> {
        self.inner.lock().latest.clone()
    }

    /// Version of [`latest`](Self::latest).
    pub fn version(&self) -> Option<Version> {
        self.inner.lock().version
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().enumerators.len()
    }

    pub fn is_evicted(&self) -> bool {
        self.inner.lock().evicted
    }

    /// Return `consumer`'s enumerator, creating it if absent.
    ///
    /// A new enumerator starts out holding the latest outcome, so a late
    /// subscriber does not wait for the next change. Returns `None` if the
    /// entry has already been evicted.
    pub(crate) fn subscribe(&self, consumer: ConsumerId) -> Option<Arc<EnumeratorCore>> {
        let mut inner = self.inner.lock();
        if inner.evicted {
            return None;
        }
        let latest = inner.latest.clone();
        let enumerator = inner
            .enumerators
            .entry(consumer)
            .or_insert_with(|| Arc::new(EnumeratorCore::preloaded(latest)))
            .clone();
        trace!(key = %self.key, ?consumer, "cache subscribe");
        Some(enumerator)
    }

    /// Accept a pushed outcome and fan it out to every enumerator.
    ///
    /// Returns whether the entry still has subscribers. A push older than the
    /// held outcome is dropped. The fan-out happens under the entry lock so
    /// concurrent pushes reach every enumerator in the same order.
    pub(crate) fn on_push(&self, version: Version, outcome: Outcome) -> bool {
        let mut inner = self.inner.lock();
        if inner.evicted {
            return false;
        }
        if let Some(held) = &inner.version {
            if !version.supersedes(held) {
                trace!(key = %self.key, %version, %held, "stale push ignored");
                return !inner.enumerators.is_empty();
            }
        }
        inner.version = Some(version);
        if inner.latest.as_ref() == Some(&outcome) {
            trace!(key = %self.key, "duplicate push ignored");
            return true;
        }
        for enumerator in inner.enumerators.values() {
            enumerator.push(outcome.clone());
        }
        inner.latest = Some(outcome);
        !inner.enumerators.is_empty()
    }

    pub(crate) fn set_lease_timer(&self, timer: TimerHandle) {
        *self.lease_timer.lock() = Some(timer);
    }

    pub(crate) fn stop_lease_timer(&self) {
        self.lease_timer.lock().take();
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("status", &self.status())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

/// Result of removing a consumer from an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unsubscribed {
    /// The consumer was not subscribed.
    NotSubscribed,
    /// Other consumers remain.
    Remaining(usize),
    /// That was the last consumer; the entry left the directory.
    Evicted,
}

/// Node-wide map from call key to live cache entry.
#[derive(Default)]
pub struct CacheDirectory {
    entries: DashMap<CallKey, Arc<CacheEntry>>,
}

impl CacheDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically fetch the entry for `key`, inserting a fresh one if absent.
    ///
    /// The flag reports whether this call created the entry.
    pub(crate) fn get_or_create(&self, key: &CallKey) -> (Arc<CacheEntry>, bool) {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => (occupied.get().clone(), false),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(CacheEntry::new(key.clone()));
                vacant.insert(entry.clone());
                debug!(%key, "cache entry created");
                (entry, true)
            }
        }
    }

    pub fn get(&self, key: &CallKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Remove `consumer` from `entry`, evicting the entry when it was the last.
    ///
    /// The removed enumerator receives a terminal stop. Eviction only removes
    /// the directory slot if it still holds this very entry.
    pub(crate) fn unsubscribe(&self, entry: &Arc<CacheEntry>, consumer: ConsumerId) -> Unsubscribed {
        let (removed, result) = {
            let mut inner = entry.inner.lock();
            let removed = inner.enumerators.remove(&consumer);
            let result = match (&removed, inner.enumerators.len()) {
                (None, _) => Unsubscribed::NotSubscribed,
                (Some(_), 0) => {
                    inner.evicted = true;
                    self.entries
                        .remove_if(&entry.key, |_, current| Arc::ptr_eq(current, entry));
                    Unsubscribed::Evicted
                }
                (Some(_), remaining) => Unsubscribed::Remaining(remaining),
            };
            (removed, result)
        };

        if let Some(enumerator) = removed {
            enumerator.push(Outcome::stopped());
        }
        if result == Unsubscribed::Evicted {
            debug!(key = %entry.key, "cache entry evicted");
        }
        result
    }

    pub fn contains(&self, key: &CallKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CacheDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheDirectory")
            .field("entries", &self.entries.len())
            .finish()
    }
}
