//! Reactive Engine
//!
//! This module implements memoized, push-refreshed method results: summaries,
//! cache entries, enumerators and the per-node manager tying them together.
//!
//! # Concepts
//!
//! ## Summaries
//!
//! A Summary is a memoized computation bound to one execution context. It
//! records which cache entries it read while running and re-runs whenever one
//! of them changes. A changed result is pushed to every consumer node.
//!
//! ## Cache entries
//!
//! A cache entry is a node-local replica of a summary's latest result, shared
//! by every local consumer of that summary. It exists exactly as long as it
//! has subscribers.
//!
//! ## Enumerators
//!
//! An Enumerator turns pushed results into a pull-style sequence. It keeps
//! only the newest unseen result, so slow consumers skip values but never go
//! back in time.
//!
//! # Implementation Notes
//!
//! Dependencies are discovered by running the computation: every reactive
//! call made while a summary executes is attributed to it through a
//! task-local execution frame. Edges that are not re-discovered by the next
//! execution are dropped after it.
//!
//! Summaries of one execution context never run concurrently; each context
//! has a [`Worker`] that executes pending summaries one at a time.

mod cache;
mod context;
mod enumerator;
mod manager;
mod root;
mod subscriber;
mod summary;
mod worker;

pub use cache::{CacheDirectory, CacheEntry, CacheStatus, Unsubscribed};
pub use context::ReactiveContext;
pub use enumerator::{Enumerator, EnumeratorState};
pub use manager::{ExecutionContext, Manager};
pub use root::RootHandle;
pub use subscriber::{ConsumerId, RootId};
pub use summary::{ResultState, Summary, SummaryId};
pub use worker::Worker;
