//! In-process cluster.
//!
//! [`LocalCluster`] hosts any number of nodes inside one process, each with
//! its own [`Manager`]. Contexts are placed on nodes explicitly, methods are
//! registered as typed async closures, and every inter-node message is
//! encoded and decoded on the way so that nothing relies on shared memory
//! between nodes. Nodes can be disconnected to exercise delivery failures.
//!
//! # Example
//!
//! ```rust,ignore
//! let cluster = LocalCluster::new(ReactiveConfig::default())?;
//! let producer = cluster.add_node();
//! let consumer = cluster.add_node();
//! cluster.place("store", producer.node());
//! cluster.register("store", "get", |key: String| async move { Ok(key.len()) });
//!
//! let root = consumer.start_reactive_computation({
//!     let manager = Arc::downgrade(&consumer);
//!     move || { ... manager.call("store", "get", &"foo").await ... }
//! });
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use futures_util::future::{self, BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

use super::{
    ActorRuntime, ContextId, MethodId, NodeId, ResultUpdate, SummaryRequest, TimerCallback, TimerHandle,
};
use crate::codec;
use crate::config::ReactiveConfig;
use crate::error::{ReactiveError, Result};
use crate::reactive::Manager;

tokio::task_local! {
    static CURRENT_ACTOR: ContextId;
}

/// Type-erased method body: encoded arguments in, encoded result out.
pub type MethodHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

struct ClusterShared {
    next_node: AtomicU64,
    nodes: DashMap<NodeId, Weak<Manager>>,
    placement: DashMap<ContextId, NodeId>,
    methods: DashMap<(ContextId, MethodId), MethodHandler>,
    disconnected: DashSet<NodeId>,
}

impl ClusterShared {
    /// The manager of `node`, if a message from `from` can reach it.
    fn route(&self, from: NodeId, node: NodeId) -> Result<Arc<Manager>> {
        if self.disconnected.contains(&from) || self.disconnected.contains(&node) {
            return Err(ReactiveError::Unreachable(node));
        }
        self.nodes
            .get(&node)
            .and_then(|manager| manager.upgrade())
            .ok_or(ReactiveError::Unreachable(node))
    }
}

/// A set of nodes sharing one process.
#[derive(Clone)]
pub struct LocalCluster {
    shared: Arc<ClusterShared>,
    config: ReactiveConfig,
}

impl LocalCluster {
    pub fn new(config: ReactiveConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(ClusterShared {
                next_node: AtomicU64::new(1),
                nodes: DashMap::new(),
                placement: DashMap::new(),
                methods: DashMap::new(),
                disconnected: DashSet::new(),
            }),
            config,
        })
    }

    pub fn config(&self) -> &ReactiveConfig {
        &self.config
    }

    /// Start a new node and return its manager.
    ///
    /// The cluster only keeps a weak reference; the node lives as long as
    /// the returned manager. Must be called from within a Tokio runtime.
    pub fn add_node(&self) -> Arc<Manager> {
        self.add_node_with(|runtime| runtime)
    }

    /// Start a new node whose runtime is wrapped by `wrap`.
    ///
    /// The wrapper sees every outbound message and timer of the node, which
    /// lets callers add latency or faults. It must keep `local_node`.
    pub fn add_node_with<F>(&self, wrap: F) -> Arc<Manager>
    where
        F: FnOnce(Arc<dyn ActorRuntime>) -> Arc<dyn ActorRuntime>,
    {
        let node = NodeId(self.shared.next_node.fetch_add(1, Ordering::Relaxed));
        let runtime = wrap(Arc::new(LocalRuntime {
            node,
            shared: self.shared.clone(),
        }));
        let manager = Manager::new(runtime, self.config.clone());
        self.shared.nodes.insert(node, Arc::downgrade(&manager));
        debug!(%node, "node added");
        manager
    }

    /// The manager of `node`, if it is still alive.
    pub fn manager(&self, node: NodeId) -> Option<Arc<Manager>> {
        self.shared.nodes.get(&node).and_then(|manager| manager.upgrade())
    }

    /// Host `context` on `node`. Unplaced contexts live on the calling node.
    pub fn place(&self, context: impl Into<ContextId>, node: NodeId) {
        self.shared.placement.insert(context.into(), node);
    }

    /// Register `handler` as `context.method`.
    pub fn register<A, R, F, Fut>(&self, context: impl Into<ContextId>, method: impl Into<MethodId>, handler: F)
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let erased: MethodHandler = Arc::new(move |args: Vec<u8>| match codec::decode::<A>(&args) {
            Ok(args) => {
                let call = handler(args);
                async move { codec::encode(&call.await?) }.boxed()
            }
            Err(err) => future::ready(Err(err)).boxed(),
        });
        self.shared.methods.insert((context.into(), method.into()), erased);
    }

    /// Make `node` unreachable: every message to or from it fails.
    pub fn disconnect(&self, node: NodeId) {
        self.shared.disconnected.insert(node);
        debug!(%node, "node disconnected");
    }

    pub fn reconnect(&self, node: NodeId) {
        self.shared.disconnected.remove(&node);
        debug!(%node, "node reconnected");
    }
}

/// The [`ActorRuntime`] view of one node in a [`LocalCluster`].
pub struct LocalRuntime {
    node: NodeId,
    shared: Arc<ClusterShared>,
}

impl ActorRuntime for LocalRuntime {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn current_context(&self) -> ContextId {
        CURRENT_ACTOR
            .try_with(|context| context.clone())
            .unwrap_or_else(|_| ContextId::client(self.node))
    }

    fn locate(&self, context: &ContextId) -> NodeId {
        self.shared
            .placement
            .get(context)
            .map(|node| *node.value())
            .unwrap_or(self.node)
    }

    fn invoke(&self, target: &ContextId, method: &MethodId, args: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> {
        let owner = self.locate(target);
        if owner != self.node {
            if let Err(err) = self.shared.route(self.node, owner) {
                return future::ready(Err(err)).boxed();
            }
        }

        let handler = self
            .shared
            .methods
            .get(&(target.clone(), method.clone()))
            .map(|handler| handler.value().clone());
        let Some(handler) = handler else {
            return future::ready(Err(ReactiveError::MethodNotFound {
                context: target.clone(),
                method: method.clone(),
            }))
            .boxed();
        };

        trace!(context = %target, %method, "invoke");
        // Runs in the caller's task so an active execution frame stays visible.
        CURRENT_ACTOR.scope(target.clone(), async move { handler(args).await }).boxed()
    }

    fn initiate_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>> {
        let target = self.shared.route(self.node, node);
        let wire = codec::encode(&request);
        async move {
            let manager = target?;
            manager.initiate_summary(codec::decode(&wire?)?);
            Ok(())
        }
        .boxed()
    }

    fn cancel_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>> {
        let target = self.shared.route(self.node, node);
        let wire = codec::encode(&request);
        async move {
            let manager = target?;
            manager.cancel_summary(codec::decode(&wire?)?);
            Ok(())
        }
        .boxed()
    }

    fn update_summary_result(&self, node: NodeId, update: ResultUpdate) -> BoxFuture<'static, Result<bool>> {
        let target = self.shared.route(self.node, node);
        let wire = codec::encode(&update);
        async move {
            let manager = target?;
            Ok(manager.update_summary_result(codec::decode(&wire?)?))
        }
        .boxed()
    }

    fn register_timer(&self, interval: Duration, callback: TimerCallback) -> TimerHandle {
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                callback();
            }
        });
        let abort = task.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}
