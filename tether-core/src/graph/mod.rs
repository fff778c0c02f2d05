//! Dependency Graph
//!
//! The reactive engine never builds a global graph. Each summary keeps the
//! edges it owns and re-learns them on every execution, so the "graph" is the
//! union of many small, local edge sets.
//!
//! # Edge kinds
//!
//! - Pull-side: summary -> cache entry it read. Maintained with a
//!   mark / confirm / sweep cycle around every execution.
//! - Push-side: summary -> consumer node that must be notified. Kept alive by
//!   leases the consumer renews.

mod edge;

pub use edge::{EdgeSet, Lease, LeaseSet, Renewal};
