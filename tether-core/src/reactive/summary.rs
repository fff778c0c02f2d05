//! Summary Implementation
//!
//! A Summary is a memoized unit of computation bound to one execution
//! context: either a method call (`context.method(args)`) discovered as a
//! dependency of another summary, or a root computation started by client
//! code.
//!
//! # How Summaries Work
//!
//! 1. Before executing, every pull-side edge is marked unconfirmed.
//!
//! 2. While executing, each reactive call confirms its edge or adds a new one.
//!
//! 3. After executing, unconfirmed edges are swept and their cache entries
//!    are released. Dependencies follow runtime control flow, so they are
//!    re-learned on every execution.
//!
//! 4. The new outcome is encoded and compared with the previous encoding.
//!    Only a byte-level change is propagated, tagged with a fresh revision.
//!    Revisions come from one process-wide counter, so a summary that
//!    replaces a torn-down one with the same id still orders after it.
//!
//! # Variants
//!
//! Both variants share the bookkeeping above. They differ in what they run
//! ([`SummaryKind`]) and in where a change goes: call summaries push to
//! consumer nodes, root summaries publish to their [`RootHandle`](super::RootHandle).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::trace;

use super::cache::CacheEntry;
use super::enumerator::EnumeratorCore;
use super::root::RootSink;
use super::subscriber::{ConsumerId, RootId};
use super::worker::Worker;
use crate::codec::Outcome;
use crate::error::Result;
use crate::graph::{EdgeSet, LeaseSet, Renewal};
use crate::runtime::{ActorRuntime, CallKey, ContextId, NodeId};

/// Identity of a summary within its execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SummaryId {
    Call(CallKey),
    Root(RootId),
}

impl fmt::Display for SummaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SummaryId::Call(key) => write!(f, "{key}"),
            SummaryId::Root(id) => write!(f, "{id}"),
        }
    }
}

/// Result state of a summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultState {
    NotYetComputed,
    HasResult,
    HasException,
}

/// Type-erased body of a root computation.
pub(crate) type RootThunk = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// What a summary runs and where its changes go.
pub(crate) enum SummaryKind {
    /// A memoized method call, pushed to consumer nodes.
    Call(CallKey),
    /// A client computation, published to its root handle.
    Root { thunk: RootThunk, sink: Arc<RootSink> },
}

struct ResultSlot {
    outcome: Option<Outcome>,
    canonical: Option<Vec<u8>>,
    revision: u64,
    executions: u64,
}

/// A pull-side edge: the cache entry a summary read, and the summary's own
/// enumerator on it.
pub(crate) struct Dependency {
    pub(crate) cache: Arc<CacheEntry>,
    pub(crate) enumerator: Arc<EnumeratorCore>,
    watcher: Option<JoinHandle<()>>,
}

impl Dependency {
    /// Stop watching the edge and hand back its cache entry.
    ///
    /// The watcher is gone before the caller unsubscribes, so the terminal
    /// stop of the release cannot schedule another execution.
    pub(crate) fn into_cache(mut self) -> Arc<CacheEntry> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.cache.clone()
    }
}

impl Drop for Dependency {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

/// Counter for tracing execution rounds.
static ROUND_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Source of result revisions.
static REVISION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// A memoized computation node tracked by the engine.
pub struct Summary {
    id: SummaryId,
    context: ContextId,
    consumer: ConsumerId,
    kind: SummaryKind,
    worker: Arc<Worker>,
    lease: Duration,
    detached: AtomicBool,
    result: Mutex<ResultSlot>,
    dependencies: Mutex<EdgeSet<CallKey, Dependency>>,
    dependents: Mutex<LeaseSet>,
}

impl Summary {
    fn new(id: SummaryId, context: ContextId, kind: SummaryKind, worker: Arc<Worker>, lease: Duration) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            consumer: ConsumerId::new(),
            kind,
            worker,
            lease,
            detached: AtomicBool::new(false),
            result: Mutex::new(ResultSlot {
                outcome: None,
                canonical: None,
                revision: 0,
                executions: 0,
            }),
            dependencies: Mutex::new(EdgeSet::new()),
            dependents: Mutex::new(LeaseSet::new()),
        })
    }

    /// Create the summary for a memoized method call.
    pub(crate) fn call(key: CallKey, worker: Arc<Worker>, lease: Duration) -> Arc<Self> {
        let context = key.context.clone();
        Self::new(SummaryId::Call(key.clone()), context, SummaryKind::Call(key), worker, lease)
    }

    /// Create a root summary running `thunk` in `context`.
    pub(crate) fn root(
        id: RootId,
        context: ContextId,
        thunk: RootThunk,
        sink: Arc<RootSink>,
        worker: Arc<Worker>,
        lease: Duration,
    ) -> Arc<Self> {
        Self::new(SummaryId::Root(id), context, SummaryKind::Root { thunk, sink }, worker, lease)
    }

    pub fn id(&self) -> &SummaryId {
        &self.id
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// The identity this summary uses when subscribing to cache entries.
    pub fn consumer(&self) -> ConsumerId {
        self.consumer
    }

    pub(crate) fn kind(&self) -> &SummaryKind {
        &self.kind
    }

    pub(crate) fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn is_root(&self) -> bool {
        matches!(self.kind, SummaryKind::Root { .. })
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub fn result_state(&self) -> ResultState {
        match &self.result.lock().outcome {
            None => ResultState::NotYetComputed,
            Some(outcome) if outcome.is_failure() => ResultState::HasException,
            Some(_) => ResultState::HasResult,
        }
    }

    pub fn latest(&self) -> Option<Outcome> {
        self.result.lock().outcome.clone()
    }

    /// The latest outcome with the revision it was stored under.
    pub(crate) fn latest_revision(&self) -> Option<(u64, Outcome)> {
        let slot = self.result.lock();
        slot.outcome.clone().map(|outcome| (slot.revision, outcome))
    }

    /// Number of completed executions.
    pub fn execution_count(&self) -> u64 {
        self.result.lock().executions
    }

    /// Run the underlying computation once.
    pub(crate) fn run(&self, runtime: &dyn ActorRuntime) -> BoxFuture<'static, Result<Vec<u8>>> {
        match &self.kind {
            SummaryKind::Call(key) => runtime.invoke(&key.context, &key.method, key.args.clone()),
            SummaryKind::Root { thunk, .. } => thunk(),
        }
    }

    // ------------------------------------------------------------------
    // Pull side
    // ------------------------------------------------------------------

    /// Mark every pull-side edge unconfirmed before an execution.
    pub(crate) fn begin_round(&self) -> u64 {
        let round = ROUND_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.dependencies.lock().mark();
        trace!(summary = %self.id, round, "round started");
        round
    }

    /// Re-confirm the edge to `key` if this summary already has one.
    pub(crate) fn confirm_dependency(&self, key: &CallKey) -> Option<(Arc<CacheEntry>, Arc<EnumeratorCore>)> {
        self.dependencies
            .lock()
            .confirm(key)
            .map(|dep| (dep.cache.clone(), dep.enumerator.clone()))
    }

    /// Record a newly discovered edge.
    ///
    /// Returns `false` when the summary was detached meanwhile; the caller
    /// then owns the subscription and must release it.
    pub(crate) fn add_dependency(&self, key: CallKey, cache: Arc<CacheEntry>, enumerator: Arc<EnumeratorCore>) -> bool {
        let mut dependencies = self.dependencies.lock();
        if self.is_detached() {
            return false;
        }
        trace!(summary = %self.id, dependency = %key, "dependency added");
        dependencies.insert(
            key,
            Dependency {
                cache,
                enumerator,
                watcher: None,
            },
        );
        true
    }

    /// Remove the edges the last execution did not confirm.
    pub(crate) fn sweep_dependencies(&self) -> Vec<(CallKey, Dependency)> {
        let stale = self.dependencies.lock().sweep();
        for (key, _) in &stale {
            trace!(summary = %self.id, dependency = %key, "dependency swept");
        }
        stale
    }

    /// Start a watcher for every edge that lacks one.
    ///
    /// A watcher re-enqueues the summary whenever its dependency delivers a
    /// new outcome, and stops after a terminal stop.
    pub(crate) fn watch_dependencies(self: &Arc<Self>) {
        let mut dependencies = self.dependencies.lock();
        if self.is_detached() {
            return;
        }
        for dependency in dependencies.values_mut() {
            if dependency.watcher.is_some() {
                continue;
            }
            let summary = Arc::downgrade(self);
            let worker = self.worker.clone();
            let enumerator = dependency.enumerator.clone();
            dependency.watcher = Some(tokio::spawn(watch(summary, worker, enumerator)));
        }
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.lock().len()
    }

    pub fn depends_on(&self, key: &CallKey) -> bool {
        self.dependencies.lock().contains(key)
    }

    /// Tear the summary down and hand back every pull-side edge.
    ///
    /// Idempotent: later calls return whatever edges were added since.
    pub(crate) fn detach(&self) -> Vec<(CallKey, Dependency)> {
        let mut dependencies = self.dependencies.lock();
        self.detached.store(true, Ordering::Release);
        self.dependents.lock().close();
        dependencies.drain()
    }

    // ------------------------------------------------------------------
    // Result
    // ------------------------------------------------------------------

    /// Store a new outcome if its canonical bytes differ from the previous one.
    ///
    /// Returns the revision of a changed outcome, which must be propagated,
    /// or `None` if nothing changed.
    pub(crate) fn update_result(&self, outcome: &Outcome) -> Result<Option<u64>> {
        let canonical = outcome.canonical()?;
        let mut slot = self.result.lock();
        slot.executions += 1;
        if slot.canonical.as_deref() == Some(canonical.as_slice()) {
            return Ok(None);
        }
        slot.canonical = Some(canonical);
        slot.outcome = Some(outcome.clone());
        slot.revision = REVISION_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(Some(slot.revision))
    }

    // ------------------------------------------------------------------
    // Push side
    // ------------------------------------------------------------------

    /// Add or renew the push-side edge to `node` for its cache entry `subscription`.
    pub(crate) fn renew(&self, node: NodeId, subscription: u64, now: Instant) -> Renewal {
        self.dependents.lock().renew(node, subscription, self.lease, now)
    }

    /// Drop the push-side edge to `node` if `subscription` still holds it.
    /// Returns `true` if none remain.
    pub(crate) fn remove_dependent(&self, node: NodeId, subscription: u64) -> bool {
        self.dependents.lock().remove(node, subscription)
    }

    /// Drop expired push-side edges. Returns `true` if none remain.
    pub(crate) fn expire_dependents(&self, now: Instant) -> bool {
        self.dependents.lock().expire(now)
    }

    /// Consumer nodes whose lease is still valid, with the subscription
    /// holding each lease.
    pub(crate) fn live_dependents(&self, now: Instant) -> Vec<(NodeId, u64)> {
        self.dependents.lock().live(now)
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }
}

async fn watch(summary: Weak<Summary>, worker: Arc<Worker>, enumerator: Arc<EnumeratorCore>) {
    loop {
        let outcome = enumerator.next().await;
        let Some(dependent) = summary.upgrade().filter(|dependent| !dependent.is_detached()) else {
            break;
        };
        trace!(summary = %dependent.id(), stopped = outcome.is_stopped(), "dependency changed");
        worker.enqueue(dependent);
        if outcome.is_stopped() {
            break;
        }
    }
}

impl fmt::Debug for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Summary")
            .field("id", &self.id)
            .field("state", &self.result_state())
            .field("dependencies", &self.dependency_count())
            .field("dependents", &self.dependent_count())
            .field("detached", &self.is_detached())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
