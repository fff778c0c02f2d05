//! Reactive Context
//!
//! The reactive context tracks which summary is currently executing. This
//! enables automatic dependency tracking: when a summary body makes a
//! reactive call, the call is recorded as a dependency of that summary.
//!
//! # Implementation
//!
//! Summary bodies are async and may hop threads between polls, so the frame
//! lives in a Tokio task-local rather than a thread-local. The worker enters
//! a frame around each execution with [`ReactiveContext::scope`]; nested
//! scopes shadow outer ones for their duration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::summary::{Summary, SummaryId};

tokio::task_local! {
    static FRAME: Arc<Frame>;
}

/// State of one summary execution.
pub(crate) struct Frame {
    summary: Arc<Summary>,
    timed_out: AtomicBool,
}

impl Frame {
    pub(crate) fn new(summary: Arc<Summary>) -> Self {
        Self {
            summary,
            timed_out: AtomicBool::new(false),
        }
    }

    pub(crate) fn summary(&self) -> &Arc<Summary> {
        &self.summary
    }

    /// Record that a dependency wait gave up during this execution.
    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::Release);
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::Acquire)
    }
}

/// Accessors for the current execution frame.
pub struct ReactiveContext;

impl ReactiveContext {
    /// Run `future` with `frame` as the active frame.
    pub(crate) async fn scope<F: Future>(frame: Arc<Frame>, future: F) -> F::Output {
        FRAME.scope(frame, future).await
    }

    pub(crate) fn current() -> Option<Arc<Frame>> {
        FRAME.try_with(|frame| frame.clone()).ok()
    }

    /// Check if a summary is executing in the current task.
    pub fn is_active() -> bool {
        FRAME.try_with(|_| ()).is_ok()
    }

    /// Identity of the summary executing in the current task, if any.
    pub fn current_summary() -> Option<SummaryId> {
        FRAME.try_with(|frame| frame.summary.id().clone()).ok()
    }
}
