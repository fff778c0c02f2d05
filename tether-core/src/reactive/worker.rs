//! Update Worker
//!
//! Every execution context owns one worker. The worker guarantees that at most
//! one summary of its context executes at any time, because summary bodies
//! may touch the same actor-local state as ordinary method calls.
//!
//! # Algorithm
//!
//! 1. `enqueue` adds a summary to an ordered pending set. A summary that is
//!    already pending is not added twice. A pending summary that was torn
//!    down and replaced under the same id gives its slot to the replacement.
//! 2. If the worker is idle, a batch run is spawned.
//! 3. A batch run drains the pending set and, for each summary in order:
//!    marks its edges, executes it, sweeps stale edges and stores the result.
//! 4. The propagation tasks of all changed summaries are awaited together.
//! 5. Summaries enqueued meanwhile form the next batch; the run ends when the
//!    pending set is empty, and the manager may then drop the idle context.

use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::future::{join_all, BoxFuture};
use indexmap::IndexMap;
use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::trace;

use super::manager::Manager;
use super::summary::{Summary, SummaryId};
use crate::runtime::ContextId;

struct WorkerState {
    pending: IndexMap<SummaryId, Arc<Summary>>,
    running: bool,
    batches: u64,
}

/// Single-flight scheduler for the summaries of one execution context.
pub struct Worker {
    context: ContextId,
    manager: Weak<Manager>,
    state: Mutex<WorkerState>,
}

impl Worker {
    pub(crate) fn new(context: ContextId, manager: Weak<Manager>) -> Arc<Self> {
        Arc::new(Self {
            context,
            manager,
            state: Mutex::new(WorkerState {
                pending: IndexMap::new(),
                running: false,
                batches: 0,
            }),
        })
    }

    pub fn context(&self) -> &ContextId {
        &self.context
    }

    /// Schedule `summary` for execution.
    ///
    /// Returns `false` if this very summary was already pending. Must be
    /// called from within a Tokio runtime.
    pub(crate) fn enqueue(self: &Arc<Self>, summary: Arc<Summary>) -> bool {
        let (added, start) = {
            let mut state = self.state.lock();
            let added = match state.pending.get(summary.id()) {
                Some(pending) => !Arc::ptr_eq(pending, &summary),
                None => true,
            };
            if added {
                // Replacing keeps the slot's position in the queue.
                state.pending.insert(summary.id().clone(), summary);
            }
            let start = !state.running;
            state.running = true;
            (added, start)
        };

        if start {
            tokio::spawn(self.clone().run());
        }
        added
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether `summary` itself, not just its id, is waiting to run.
    pub fn is_pending(&self, summary: &Arc<Summary>) -> bool {
        self.state
            .lock()
            .pending
            .get(summary.id())
            .is_some_and(|pending| Arc::ptr_eq(pending, summary))
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Number of batches executed so far.
    pub fn batch_count(&self) -> u64 {
        self.state.lock().batches
    }

    async fn run(self: Arc<Self>) {
        loop {
            let batch: Vec<Arc<Summary>> = {
                let mut state = self.state.lock();
                if state.pending.is_empty() {
                    state.running = false;
                    drop(state);
                    if let Some(manager) = self.manager.upgrade() {
                        manager.prune_context(&self.context);
                    }
                    return;
                }
                state.batches += 1;
                state.pending.drain(..).map(|(_, summary)| summary).collect()
            };

            let Some(manager) = self.manager.upgrade() else {
                let mut state = self.state.lock();
                state.pending.clear();
                state.running = false;
                return;
            };

            self.run_batch(&manager, batch).await;
        }
    }

    async fn run_batch(&self, manager: &Arc<Manager>, batch: Vec<Arc<Summary>>) {
        trace!(context = %self.context, size = batch.len(), "batch started");

        let mut propagations: SmallVec<[BoxFuture<'static, ()>; 4]> = SmallVec::new();
        for summary in batch {
            if summary.is_detached() {
                trace!(summary = %summary.id(), "skipping detached summary");
                continue;
            }
            if let Some(propagation) = manager.execute(&summary).await {
                propagations.push(propagation);
            }
        }

        if !propagations.is_empty() {
            join_all(propagations).await;
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Worker")
            .field("context", &self.context)
            .field("pending", &state.pending.len())
            .field("running", &state.running)
            .finish()
    }
}
