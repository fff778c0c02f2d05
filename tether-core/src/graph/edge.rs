//! Dependency Edges
//!
//! Two edge collections hang off every summary:
//!
//! - [`EdgeSet`]: pull-side edges, the cache entries the summary read during
//!   its last execution. Dependencies are only discovered by running the
//!   computation, so the set is re-learned every round with a
//!   mark / confirm / sweep cycle.
//! - [`LeaseSet`]: push-side edges, the consumer nodes that must hear about
//!   changes. Each edge carries a [`Lease`] that the consumer renews.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use smallvec::SmallVec;

use crate::runtime::NodeId;

/// An edge plus whether the current round has touched it.
#[derive(Debug)]
struct Edge<V> {
    value: V,
    confirmed: bool,
}

/// Mark-and-sweep set of pull-side dependency edges.
#[derive(Debug)]
pub struct EdgeSet<K, V> {
    edges: HashMap<K, Edge<V>>,
}

impl<K, V> EdgeSet<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            edges: HashMap::new(),
        }
    }

    /// Start a round: every edge is unconfirmed until touched again.
    pub fn mark(&mut self) {
        for edge in self.edges.values_mut() {
            edge.confirmed = false;
        }
    }

    /// Confirm an existing edge for this round.
    pub fn confirm(&mut self, key: &K) -> Option<&V> {
        self.edges.get_mut(key).map(|edge| {
            edge.confirmed = true;
            &edge.value
        })
    }

    /// Add a new, already confirmed edge.
    ///
    /// An edge already present under `key` is replaced and returned.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.edges
            .insert(
                key,
                Edge {
                    value,
                    confirmed: true,
                },
            )
            .map(|old| old.value)
    }

    /// End a round: remove and return every edge the round did not confirm.
    pub fn sweep(&mut self) -> Vec<(K, V)> {
        let stale: SmallVec<[K; 8]> = self
            .edges
            .iter()
            .filter(|(_, edge)| !edge.confirmed)
            .map(|(key, _)| key.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|key| self.edges.remove(&key).map(|edge| (key, edge.value)))
            .collect()
    }

    /// Remove every edge.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        self.edges.drain().map(|(key, edge)| (key, edge.value)).collect()
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.edges.values_mut().map(|edge| &mut edge.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.edges.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

impl<K, V> Default for EdgeSet<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Liveness window of a push-side edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lease {
    pub timeout: Duration,
    pub renewed_at: Instant,
    /// Newest consumer-side subscription that renewed this lease.
    pub subscription: u64,
}

impl Lease {
    pub fn new(timeout: Duration, now: Instant, subscription: u64) -> Self {
        Self {
            timeout,
            renewed_at: now,
            subscription,
        }
    }

    pub fn renew(&mut self, now: Instant, subscription: u64) {
        self.renewed_at = now;
        self.subscription = self.subscription.max(subscription);
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.renewed_at) > self.timeout
    }
}

/// Result of adding or renewing a push-side edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    /// The consumer had no edge; one was created.
    Added,
    /// The consumer's existing lease was extended.
    Renewed,
    /// The set is closed; the owner is being torn down.
    Closed,
}

/// Push-side edges keyed by consumer node.
///
/// Once the last edge goes away the set closes for good, so a summary that
/// is being detached can never silently regain a subscriber.
#[derive(Debug, Default)]
pub struct LeaseSet {
    leases: HashMap<NodeId, Lease>,
    closed: bool,
}

impl LeaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn renew(&mut self, node: NodeId, subscription: u64, timeout: Duration, now: Instant) -> Renewal {
        if self.closed {
            return Renewal::Closed;
        }
        match self.leases.get_mut(&node) {
            Some(lease) => {
                lease.timeout = timeout;
                lease.renew(now, subscription);
                Renewal::Renewed
            }
            None => {
                self.leases.insert(node, Lease::new(timeout, now, subscription));
                Renewal::Added
            }
        }
    }

    /// Remove the edge to `node` on behalf of `subscription`.
    ///
    /// A subscription older than the one holding the lease leaves it in
    /// place. Returns `true` if this closed the set.
    pub fn remove(&mut self, node: NodeId, subscription: u64) -> bool {
        match self.leases.get(&node) {
            Some(lease) if lease.subscription <= subscription => {
                self.leases.remove(&node);
            }
            _ => return false,
        }
        if self.leases.is_empty() {
            self.closed = true;
            return true;
        }
        false
    }


    /// Drop every expired lease. Returns `true` if this closed the set.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.leases.len();
        self.leases.retain(|_, lease| !lease.is_expired(now));
        if before > 0 && self.leases.is_empty() {
            self.closed = true;
            return true;
        }
        false
    }

    /// Nodes whose lease is still valid at `now`, with the subscription
    /// holding each lease.
    pub fn live(&self, now: Instant) -> Vec<(NodeId, u64)> {
        self.leases
            .iter()
            .filter(|(_, lease)| !lease.is_expired(now))
            .map(|(node, lease)| (*node, lease.subscription))
            .collect()
    }

    /// Close the set regardless of remaining edges.
    pub fn close(&mut self) {
        self.closed = true;
        self.leases.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
