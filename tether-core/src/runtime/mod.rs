//! Host Runtime Interface
//!
//! The reactive engine does not own actors, addressing or the network. It
//! consumes them through [`ActorRuntime`], a deliberately narrow trait:
//!
//! - addressing: which node hosts an execution context
//! - dispatch: run a method of an execution context
//! - messaging: deliver the three engine messages to another node's
//!   [`Manager`](crate::reactive::Manager)
//! - timers: periodic callbacks for lease renewal and lease sweeping
//!
//! The identities and wire messages shared by both sides live here as well.
//! [`local::LocalCluster`] implements the trait for a set of nodes living in
//! one process.

pub mod local;

use std::fmt;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::codec::{self, Outcome};
use crate::error::Result;

/// Identity of one node (process) in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Identity of one execution context (an actor activation).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContextId(String);

impl ContextId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The context used for client code that runs outside any actor.
    pub fn client(node: NodeId) -> Self {
        Self(format!("client@{node}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ContextId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Name of a method exposed by an execution context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(String);

impl MethodId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MethodId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Structural identity of a memoized method call.
///
/// The arguments are kept in their canonical encoded form, so two calls with
/// equal arguments map to the same key regardless of how they print.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallKey {
    pub context: ContextId,
    pub method: MethodId,
    pub args: Vec<u8>,
}

impl CallKey {
    pub fn new(context: ContextId, method: MethodId, args: Vec<u8>) -> Self {
        Self {
            context,
            method,
            args,
        }
    }

    /// Build a key by encoding `args`.
    pub fn encode<A: Serialize + ?Sized>(
        context: ContextId,
        method: MethodId,
        args: &A,
    ) -> Result<Self> {
        Ok(Self::new(context, method, codec::encode(args)?))
    }
}

impl fmt::Display for CallKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({} bytes)", self.context, self.method, self.args.len())
    }
}

/// Why a consumer contacts the producing node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// A cache entry was just created and needs the current result.
    Initiate,
    /// Periodic lease renewal from an existing cache entry.
    KeepAlive,
}

/// Consumer-to-producer request: start, refresh or cancel a summary on behalf
/// of `consumer`.
///
/// `subscription` identifies the consumer's cache entry. Entry ids only grow
/// on a node, so the producer can tell a cancel of an evicted entry from the
/// demand of its replacement when the two race.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRequest {
    pub key: CallKey,
    pub consumer: NodeId,
    pub subscription: u64,
    pub kind: RequestKind,
}

/// Position of a pushed outcome in its producer's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub producer: NodeId,
    pub revision: u64,
}

impl Version {
    pub fn new(producer: NodeId, revision: u64) -> Self {
        Self { producer, revision }
    }

    /// Whether an outcome tagged `self` may replace one tagged `held`.
    ///
    /// Revisions are only ordered within one producer node. An outcome from
    /// another node means the context moved, and the newcomer wins.
    pub fn supersedes(&self, held: &Version) -> bool {
        self.producer != held.producer || self.revision > held.revision
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.revision, self.producer)
    }
}

/// Producer-to-consumer push: the summary behind `key` has a new outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultUpdate {
    pub key: CallKey,
    pub version: Version,
    pub outcome: Outcome,
}

/// Callback invoked on every timer tick.
pub type TimerCallback = Box<dyn Fn() + Send + Sync>;

/// A registered periodic timer. Dropping the handle cancels the timer.
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl TimerHandle {
    pub fn new<F>(cancel: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle that owns no timer.
    pub fn detached() -> Self {
        Self { cancel: None }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Services the reactive engine needs from the actor runtime that hosts it.
///
/// Implementations must deliver the messaging calls to the target node's
/// [`Manager`](crate::reactive::Manager) handlers of the same name.
pub trait ActorRuntime: Send + Sync + 'static {
    /// The node this runtime instance belongs to.
    fn local_node(&self) -> NodeId;

    /// The execution context of the caller.
    fn current_context(&self) -> ContextId;

    /// The node hosting `context`.
    fn locate(&self, context: &ContextId) -> NodeId;

    /// Run `method` of `target` with encoded `args` and return the encoded result.
    ///
    /// When the engine uses this to execute a summary, the method body must
    /// run in the calling task so that nested reactive calls are attributed
    /// to the executing summary.
    fn invoke(
        &self,
        target: &ContextId,
        method: &MethodId,
        args: Vec<u8>,
    ) -> BoxFuture<'static, Result<Vec<u8>>>;

    /// Deliver a start or keep-alive request to the producing node.
    fn initiate_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>>;

    /// Tell the producing node that a consumer dropped its edge.
    fn cancel_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>>;

    /// Push a new outcome to a consumer node. `Ok(false)` means the consumer
    /// no longer subscribes.
    fn update_summary_result(&self, node: NodeId, update: ResultUpdate) -> BoxFuture<'static, Result<bool>>;

    /// Call `callback` every `interval` until the handle is dropped.
    fn register_timer(&self, interval: Duration, callback: TimerCallback) -> TimerHandle;
}
