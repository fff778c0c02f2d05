//! Tether Core
//!
//! This crate provides a reactive result cache for distributed actor
//! runtimes. It implements:
//!
//! - Memoized method calls ("summaries") with automatic dependency discovery
//! - Node-local cache entries kept fresh by push notifications
//! - A lease-based protocol that tears down unused summaries across nodes
//! - Pull-style async iteration over changing results
//!
//! The engine does not own actors or the network. It consumes them through
//! the [`ActorRuntime`](runtime::ActorRuntime) trait; an in-process
//! implementation is provided by [`LocalCluster`](runtime::local::LocalCluster).
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - `reactive`: summaries, cache entries, enumerators and the manager
//! - `graph`: per-summary dependency edge bookkeeping
//! - `runtime`: host runtime interface, identities and wire messages
//! - `codec`: canonical encoding and the value-or-failure payload
//! - `config`: timing configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_core::prelude::*;
//!
//! let cluster = LocalCluster::new(ReactiveConfig::default())?;
//! let node = cluster.add_node();
//! cluster.register("counter", "get", |_: ()| async { Ok(5u32) });
//!
//! let manager = Arc::downgrade(&node);
//! let root = node.start_reactive_computation(move || {
//!     let manager = manager.clone();
//!     async move {
//!         let manager = manager.upgrade().ok_or(ReactiveError::Stopped)?;
//!         let count: u32 = manager.call("counter", "get", &()).await?;
//!         Ok(count * 2)
//!     }
//! });
//!
//! let values = root.get_iterator();
//! assert_eq!(values.next().await?, 10);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod runtime;

pub use codec::{Failure, Outcome};
pub use config::ReactiveConfig;
pub use error::{ReactiveError, Result};

/// Commonly used types.
pub mod prelude {
    pub use crate::config::ReactiveConfig;
    pub use crate::error::{ReactiveError, Result};
    pub use crate::reactive::{Enumerator, Manager, ReactiveContext, RootHandle};
    pub use crate::runtime::local::LocalCluster;
    pub use crate::runtime::{ActorRuntime, CallKey, ContextId, MethodId, NodeId};
}
