//! Reactive Manager
//!
//! One manager runs per node. It owns the node's cache directory, the
//! execution contexts hosted on the node and every summary living in them,
//! and it speaks the three-message propagation protocol with other nodes:
//!
//! | message                 | direction           | effect                                  |
//! |-------------------------|---------------------|-----------------------------------------|
//! | `initiate_summary`      | consumer → producer | create/refresh a summary, renew a lease |
//! | `cancel_summary`        | consumer → producer | drop the consumer's push-side edge      |
//! | `update_summary_result` | producer → consumer | deliver a new outcome to a cache entry  |
//!
//! The protocol is the same whether both ends live on one node or not; the
//! host [`ActorRuntime`] decides how messages travel.
//!
//! # Reading a dependency
//!
//! [`Manager::call`] made from inside a summary body resolves the cache entry
//! for the call, subscribes the running summary to it and returns the entry's
//! latest outcome. If the entry has never received one, the call waits up to
//! `dependency_timeout`; on expiry the execution is abandoned and the summary
//! keeps its previous result until the value arrives.
//!
//! # Leases
//!
//! A cache entry renews its lease on the producer every `renewal_interval`.
//! The producer drops edges not renewed within `lease` on its periodic sweep,
//! and tears down summaries that lost their last edge. An execution context
//! left without summaries is forgotten once its worker is idle.

use std::fmt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::cache::{CacheDirectory, CacheEntry, Unsubscribed};
use super::context::{Frame, ReactiveContext};
use super::enumerator::{Enumerator, EnumeratorCore};
use super::root::{RootHandle, RootSink};
use super::subscriber::{ConsumerId, RootId};
use super::summary::{RootThunk, Summary, SummaryId, SummaryKind};
use super::worker::Worker;
use crate::codec::{self, Outcome};
use crate::config::ReactiveConfig;
use crate::error::{ReactiveError, Result};
use crate::graph::Renewal;
use crate::runtime::{
    ActorRuntime, CallKey, ContextId, MethodId, NodeId, RequestKind, ResultUpdate, SummaryRequest, TimerHandle,
    Version,
};

/// The summaries of one execution context and the worker that runs them.
pub struct ExecutionContext {
    id: ContextId,
    worker: Arc<Worker>,
    summaries: DashMap<SummaryId, Arc<Summary>>,
}

impl ExecutionContext {
    fn new(id: ContextId, manager: Weak<Manager>) -> Self {
        Self {
            worker: Worker::new(id.clone(), manager),
            id,
            summaries: DashMap::new(),
        }
    }

    pub fn id(&self) -> &ContextId {
        &self.id
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    pub fn summary(&self, id: &SummaryId) -> Option<Arc<Summary>> {
        self.summaries.get(id).map(|summary| summary.value().clone())
    }

    pub fn summary_count(&self) -> usize {
        self.summaries.len()
    }

    fn snapshot(&self) -> Vec<Arc<Summary>> {
        self.summaries.iter().map(|summary| summary.value().clone()).collect()
    }
}

/// Per-node owner of caches, summaries and the propagation protocol.
pub struct Manager {
    node: NodeId,
    runtime: Arc<dyn ActorRuntime>,
    config: ReactiveConfig,
    directory: CacheDirectory,
    contexts: DashMap<ContextId, Arc<ExecutionContext>>,
    sweeper: Mutex<Option<TimerHandle>>,
    weak: Weak<Manager>,
}

impl Manager {
    /// Create the manager for the node `runtime` belongs to.
    ///
    /// Registers the lease sweep timer, so this must be called from within a
    /// Tokio runtime.
    pub fn new(runtime: Arc<dyn ActorRuntime>, config: ReactiveConfig) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| Self {
            node: runtime.local_node(),
            runtime,
            config,
            directory: CacheDirectory::new(),
            contexts: DashMap::new(),
            sweeper: Mutex::new(None),
            weak: weak.clone(),
        });

        let weak = manager.weak.clone();
        let sweeper = manager.runtime.register_timer(
            manager.config.sweep_interval,
            Box::new(move || {
                if let Some(manager) = weak.upgrade() {
                    manager.expire_leases();
                }
            }),
        );
        *manager.sweeper.lock() = Some(sweeper);

        debug!(node = %manager.node, "manager started");
        manager
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn config(&self) -> &ReactiveConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ActorRuntime> {
        &self.runtime
    }

    /// The node-wide cache directory.
    pub fn directory(&self) -> &CacheDirectory {
        &self.directory
    }

    pub fn cache_count(&self) -> usize {
        self.directory.len()
    }

    pub fn context(&self, id: &ContextId) -> Option<Arc<ExecutionContext>> {
        self.contexts.get(id).map(|context| context.value().clone())
    }

    /// The summary memoizing `key`, if this node hosts one.
    pub fn call_summary(&self, key: &CallKey) -> Option<Arc<Summary>> {
        self.context(&key.context)?.summary(&SummaryId::Call(key.clone()))
    }

    /// Number of summaries hosted on this node, roots included.
    pub fn summary_count(&self) -> usize {
        self.contexts.iter().map(|context| context.summary_count()).sum()
    }

    /// Run `f` on the execution context `id`, creating the context if needed.
    ///
    /// `f` runs while the context map entry is locked, so the context cannot
    /// be pruned before `f` has registered its summary. `f` must not touch
    /// the context map itself.
    fn with_context<R>(&self, id: &ContextId, f: impl FnOnce(&Arc<ExecutionContext>) -> R) -> R {
        if let Some(context) = self.contexts.get(id) {
            return f(context.value());
        }
        let context = self
            .contexts
            .entry(id.clone())
            .or_insert_with(|| Arc::new(ExecutionContext::new(id.clone(), self.weak.clone())));
        f(context.value())
    }

    /// Forget the execution context `id` if it hosts no summary and its
    /// worker is idle.
    pub(crate) fn prune_context(&self, id: &ContextId) {
        let pruned = self
            .contexts
            .remove_if(id, |_, context| context.summaries.is_empty() && !context.worker.is_running());
        if pruned.is_some() {
            trace!(context = %id, "execution context pruned");
        }
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    /// Call `method` on `target`.
    ///
    /// Inside a summary body the call is memoized: it becomes a dependency of
    /// the running summary and returns the cached result, which is kept fresh
    /// by the producing node. Outside a summary it is a plain invocation.
    pub async fn call<A, R>(
        &self,
        target: impl Into<ContextId> + Send,
        method: impl Into<MethodId> + Send,
        args: &A,
    ) -> Result<R>
    where
        A: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let key = CallKey::encode(target.into(), method.into(), args)?;
        let Some(frame) = ReactiveContext::current() else {
            let bytes = self.runtime.invoke(&key.context, &key.method, key.args).await?;
            return codec::decode(&bytes);
        };
        self.read_dependency(&frame, key).await?.decode()
    }

    async fn read_dependency(&self, frame: &Arc<Frame>, key: CallKey) -> Result<Outcome> {
        let summary = frame.summary();
        let (cache, enumerator) = match summary.confirm_dependency(&key) {
            Some(edge) => edge,
            None => {
                let (cache, enumerator) = self.subscribe_cache(&key, summary.consumer());
                if !summary.add_dependency(key.clone(), cache.clone(), enumerator.clone()) {
                    self.release_dependency(&cache, summary.consumer());
                    return Err(ReactiveError::Stopped);
                }
                (cache, enumerator)
            }
        };

        // Reading the entry consumes whatever the edge had buffered.
        enumerator.take_buffered();
        if let Some(outcome) = cache.latest() {
            return Ok(outcome);
        }

        match tokio::time::timeout(self.config.dependency_timeout, enumerator.next()).await {
            Ok(outcome) => Ok(outcome),
            Err(_) => {
                debug!(summary = %summary.id(), dependency = %key, "dependency wait timed out");
                frame.mark_timed_out();
                Err(ReactiveError::Timeout)
            }
        }
    }

    /// Subscribe a fresh client consumer to the result of `target.method(args)`.
    ///
    /// The enumerator sees the current result first, if there is one, then
    /// every change. Dropping it releases the subscription.
    pub fn observe<A, R>(
        &self,
        target: impl Into<ContextId>,
        method: impl Into<MethodId>,
        args: &A,
    ) -> Result<Enumerator<R>>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let key = CallKey::encode(target.into(), method.into(), args)?;
        let consumer = ConsumerId::new();
        let (cache, enumerator) = self.subscribe_cache(&key, consumer);
        let manager = self.weak.clone();
        Ok(Enumerator::new(
            enumerator,
            Some(Box::new(move || {
                if let Some(manager) = manager.upgrade() {
                    manager.release_dependency(&cache, consumer);
                }
            })),
        ))
    }

    /// Subscribe `consumer` to the live cache entry for `key`, creating and
    /// activating the entry if needed.
    fn subscribe_cache(&self, key: &CallKey, consumer: ConsumerId) -> (Arc<CacheEntry>, Arc<EnumeratorCore>) {
        loop {
            let (cache, created) = self.directory.get_or_create(key);
            if created {
                self.activate_cache(&cache);
            }
            if let Some(enumerator) = cache.subscribe(consumer) {
                return (cache, enumerator);
            }
            trace!(%key, "cache entry evicted while subscribing, retrying");
        }
    }

    /// Ask the producer for the entry's summary and start renewing the lease.
    fn activate_cache(&self, cache: &Arc<CacheEntry>) {
        let key = cache.key().clone();
        let subscription = cache.subscription();
        self.send_initiate(key.clone(), subscription, RequestKind::Initiate);

        let manager = self.weak.clone();
        let entry = Arc::downgrade(cache);
        let timer = self.runtime.register_timer(
            self.config.renewal_interval,
            Box::new(move || {
                let (Some(manager), Some(entry)) = (manager.upgrade(), entry.upgrade()) else {
                    return;
                };
                if !entry.is_evicted() {
                    manager.send_initiate(key.clone(), subscription, RequestKind::KeepAlive);
                }
            }),
        );
        cache.set_lease_timer(timer);
    }

    fn send_initiate(&self, key: CallKey, subscription: u64, kind: RequestKind) {
        let owner = self.runtime.locate(&key.context);
        trace!(%key, node = %owner, subscription, ?kind, "sending summary request");
        let send = self.runtime.initiate_summary(
            owner,
            SummaryRequest {
                key: key.clone(),
                consumer: self.node,
                subscription,
                kind,
            },
        );
        spawn_request(async move {
            if let Err(err) = send.await {
                warn!(%key, node = %owner, error = %err, "summary request failed");
            }
        });
    }

    /// Drop `consumer`'s subscription on `cache`. The last subscriber evicts
    /// the entry and cancels the push-side edge on the producer.
    fn release_dependency(&self, cache: &Arc<CacheEntry>, consumer: ConsumerId) {
        if self.directory.unsubscribe(cache, consumer) != Unsubscribed::Evicted {
            return;
        }
        cache.stop_lease_timer();

        let key = cache.key().clone();
        let owner = self.runtime.locate(&key.context);
        let send = self.runtime.cancel_summary(
            owner,
            SummaryRequest {
                key: key.clone(),
                consumer: self.node,
                subscription: cache.subscription(),
                kind: RequestKind::KeepAlive,
            },
        );
        spawn_request(async move {
            if let Err(err) = send.await {
                warn!(%key, node = %owner, error = %err, "cancel request failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Root computations
    // ------------------------------------------------------------------

    /// Start a reactive computation in the caller's execution context.
    pub fn start_reactive_computation<F, Fut, T>(&self, thunk: F) -> RootHandle<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.start_reactive_computation_in(self.runtime.current_context(), thunk)
    }

    /// Start a reactive computation in `context`.
    ///
    /// Returns immediately; the first execution is scheduled on the context's
    /// worker.
    pub fn start_reactive_computation_in<F, Fut, T>(&self, context: ContextId, thunk: F) -> RootHandle<T>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        let thunk: RootThunk = Arc::new(move || {
            let run = thunk();
            async move { codec::encode(&run.await?) }.boxed()
        });

        let id = RootId::new();
        let sink = Arc::new(RootSink::new());
        let summary = self.with_context(&context, |execution| {
            let summary = Summary::root(
                id,
                context.clone(),
                thunk,
                sink.clone(),
                execution.worker.clone(),
                self.config.lease,
            );
            execution.summaries.insert(summary.id().clone(), summary.clone());
            execution.worker.enqueue(summary.clone());
            summary
        });

        debug!(root = %id, context = %summary.context(), "root computation started");
        RootHandle::new(id, summary, sink, self.weak.clone())
    }

    /// Re-run every summary of `context`, for hosts whose actor-local state
    /// changed. Returns the number of summaries scheduled.
    pub fn invalidate(&self, context: &ContextId) -> usize {
        let Some(execution) = self.context(context) else {
            return 0;
        };
        let summaries = execution.snapshot();
        let scheduled = summaries.len();
        for summary in summaries {
            execution.worker.enqueue(summary);
        }
        debug!(%context, scheduled, "context invalidated");
        scheduled
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Execute `summary` once and store its outcome.
    ///
    /// Returns the propagation of a changed outcome, for the worker to await
    /// with the rest of its batch.
    pub(crate) async fn execute(&self, summary: &Arc<Summary>) -> Option<BoxFuture<'static, ()>> {
        summary.begin_round();
        let frame = Arc::new(Frame::new(summary.clone()));
        let runtime = self.runtime.as_ref();
        let run = ReactiveContext::scope(frame.clone(), async { summary.run(runtime).await });
        let result = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(summary = %summary.id(), %message, "summary panicked");
                Err(ReactiveError::computation(format!("panicked: {message}")))
            }
        };

        for (_, dependency) in summary.sweep_dependencies() {
            self.release_dependency(&dependency.into_cache(), summary.consumer());
        }
        if summary.is_detached() {
            // Edges added after the summary was torn down.
            for (_, dependency) in summary.detach() {
                self.release_dependency(&dependency.into_cache(), summary.consumer());
            }
            return None;
        }
        summary.watch_dependencies();

        if frame.timed_out() {
            debug!(summary = %summary.id(), "execution abandoned, keeping previous result");
            return None;
        }

        let outcome = Outcome::from_result(result);
        match summary.update_result(&outcome) {
            Ok(Some(revision)) => {
                debug!(summary = %summary.id(), revision, failed = outcome.is_failure(), "summary changed");
                self.propagate(summary, revision, outcome)
            }
            Ok(None) => {
                trace!(summary = %summary.id(), "summary unchanged");
                None
            }
            Err(err) => {
                warn!(summary = %summary.id(), error = %err, "could not encode summary outcome");
                None
            }
        }
    }

    fn propagate(&self, summary: &Arc<Summary>, revision: u64, outcome: Outcome) -> Option<BoxFuture<'static, ()>> {
        match summary.kind() {
            SummaryKind::Root { sink, .. } => {
                sink.publish(outcome);
                None
            }
            SummaryKind::Call(key) => {
                let consumers = summary.live_dependents(Instant::now());
                if consumers.is_empty() {
                    return None;
                }
                let deliveries: Vec<_> = consumers
                    .into_iter()
                    .map(|(node, subscription)| {
                        let update = ResultUpdate {
                            key: key.clone(),
                            version: Version::new(self.node, revision),
                            outcome: outcome.clone(),
                        };
                        self.deliver(summary.clone(), node, subscription, update)
                    })
                    .collect();
                Some(join_all(deliveries).map(|_| ()).boxed())
            }
        }
    }

    /// Push `update` to `node`. A failed or rejected push drops the edge,
    /// unless a newer subscription than `subscription` renewed it meanwhile.
    fn deliver(
        &self,
        summary: Arc<Summary>,
        node: NodeId,
        subscription: u64,
        update: ResultUpdate,
    ) -> BoxFuture<'static, ()> {
        let send = self.runtime.update_summary_result(node, update);
        let manager = self.weak.clone();
        async move {
            match send.await {
                Ok(true) => return,
                Ok(false) => debug!(summary = %summary.id(), %node, "consumer no longer subscribed"),
                Err(err) => warn!(summary = %summary.id(), %node, error = %err, "push failed, dropping edge"),
            }
            if summary.remove_dependent(node, subscription) {
                if let Some(manager) = manager.upgrade() {
                    manager.detach_summary(&summary);
                }
            }
        }
        .boxed()
    }

    /// Tear `summary` down, release its dependencies and forget it.
    pub(crate) fn detach_summary(&self, summary: &Arc<Summary>) {
        for (_, dependency) in summary.detach() {
            self.release_dependency(&dependency.into_cache(), summary.consumer());
        }
        if let Some(context) = self.context(summary.context()) {
            context
                .summaries
                .remove_if(summary.id(), |_, current| Arc::ptr_eq(current, summary));
        }
        self.prune_context(summary.context());
        debug!(summary = %summary.id(), "summary detached");
    }

    /// Drop expired push-side edges and detach summaries left without any.
    ///
    /// Runs on the sweep timer. Returns the number of detached summaries.
    pub fn expire_leases(&self) -> usize {
        let now = Instant::now();
        let summaries: Vec<Arc<Summary>> = self
            .contexts
            .iter()
            .flat_map(|context| context.snapshot())
            .filter(|summary| !summary.is_root())
            .collect();

        let mut detached = 0;
        for summary in summaries {
            if summary.expire_dependents(now) {
                debug!(summary = %summary.id(), "last lease expired");
                self.detach_summary(&summary);
                detached += 1;
            }
        }
        detached
    }

    // ------------------------------------------------------------------
    // Inbound messages
    // ------------------------------------------------------------------

    /// Handle a start or keep-alive request from a consumer node.
    ///
    /// Creates the summary on first demand, adds or renews the consumer's
    /// lease and schedules an execution. A consumer that is new to the
    /// summary, or that just created its cache entry, is sent the current
    /// result right away.
    pub fn initiate_summary(&self, request: SummaryRequest) {
        let SummaryRequest {
            key,
            consumer,
            subscription,
            kind,
        } = request;
        let id = SummaryId::Call(key.clone());
        let now = Instant::now();

        let (summary, renewal) = self.with_context(&key.context, |execution| {
            let (summary, renewal) = loop {
                let summary = match execution.summaries.entry(id.clone()) {
                    Entry::Occupied(occupied) => occupied.get().clone(),
                    Entry::Vacant(vacant) => {
                        let summary = Summary::call(key.clone(), execution.worker.clone(), self.config.lease);
                        vacant.insert(summary.clone());
                        debug!(%key, "summary created");
                        summary
                    }
                };
                match summary.renew(consumer, subscription, now) {
                    Renewal::Closed => {
                        // Lost a race with teardown; replace the dying summary.
                        execution
                            .summaries
                            .remove_if(&id, |_, current| Arc::ptr_eq(current, &summary));
                    }
                    renewal => break (summary, renewal),
                }
            };
            execution.worker.enqueue(summary.clone());
            (summary, renewal)
        });
        trace!(%key, node = %consumer, subscription, ?renewal, ?kind, "summary requested");

        // The catch-up push may race the worker's own propagation; its
        // version lets the consumer drop it if it arrives late.
        if renewal == Renewal::Added || kind == RequestKind::Initiate {
            if let Some((revision, outcome)) = summary.latest_revision() {
                let update = ResultUpdate {
                    key,
                    version: Version::new(self.node, revision),
                    outcome,
                };
                spawn_request(self.deliver(summary, consumer, subscription, update));
            }
        }
    }

    /// Handle a consumer dropping its cache entry.
    ///
    /// A cancel from an entry the consumer already replaced leaves the
    /// replacement's edge alone.
    pub fn cancel_summary(&self, request: SummaryRequest) {
        let Some(summary) = self.call_summary(&request.key) else {
            return;
        };
        trace!(
            key = %request.key,
            node = %request.consumer,
            subscription = request.subscription,
            "summary cancelled by consumer"
        );
        if summary.remove_dependent(request.consumer, request.subscription) {
            self.detach_summary(&summary);
        }
    }

    /// Handle a pushed outcome. Returns whether anyone on this node still
    /// subscribes to it.
    pub fn update_summary_result(&self, update: ResultUpdate) -> bool {
        match self.directory.get(&update.key) {
            Some(cache) => cache.on_push(update.version, update.outcome),
            None => {
                trace!(key = %update.key, "push for unknown cache entry");
                false
            }
        }
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("node", &self.node)
            .field("contexts", &self.contexts.len())
            .field("caches", &self.directory.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn a fire-and-forget request if a runtime is available.
///
/// Releases can run from `Drop` after the runtime shut down; the request is
/// then dropped, which the producer's lease expiry covers.
fn spawn_request<F>(request: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(request);
        }
        Err(_) => debug!("no runtime available, request dropped"),
    }
}
