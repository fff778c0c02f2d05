//! Root Handles
//!
//! A root handle is the client-visible side of a reactive computation started
//! with [`Manager::start_reactive_computation`]. It owns the root summary and
//! multiplexes the summary's latest outcome to any number of enumerators.
//!
//! # Late subscribers
//!
//! An enumerator created after the first result starts out holding the latest
//! outcome, so its first `next()` resolves immediately.
//!
//! # Disposal
//!
//! Disposing (or dropping) the handle detaches the root summary, releases its
//! dependencies and delivers a terminal stop to every enumerator, including
//! ones created afterwards.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::enumerator::{Enumerator, EnumeratorCore};
use super::manager::Manager;
use super::subscriber::{ConsumerId, RootId};
use super::summary::Summary;
use crate::codec::Outcome;
use crate::error::Result;

struct RootState {
    latest: Option<Outcome>,
    enumerators: HashMap<ConsumerId, Arc<EnumeratorCore>>,
    disposed: bool,
}

/// Fan-out point between a root summary and its enumerators.
pub(crate) struct RootSink {
    state: Mutex<RootState>,
}

impl RootSink {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(RootState {
                latest: None,
                enumerators: HashMap::new(),
                disposed: false,
            }),
        }
    }

    /// Record a new outcome and hand it to every enumerator.
    ///
    /// Ignored once the root is disposed.
    pub(crate) fn publish(&self, outcome: Outcome) -> bool {
        let mut state = self.state.lock();
        if state.disposed {
            return false;
        }
        for enumerator in state.enumerators.values() {
            enumerator.push(outcome.clone());
        }
        state.latest = Some(outcome);
        true
    }

    pub(crate) fn subscribe(&self, consumer: ConsumerId) -> Arc<EnumeratorCore> {
        let mut state = self.state.lock();
        let enumerator = Arc::new(EnumeratorCore::preloaded(state.latest.clone()));
        if !state.disposed {
            state.enumerators.insert(consumer, enumerator.clone());
        }
        enumerator
    }

    pub(crate) fn unsubscribe(&self, consumer: ConsumerId) {
        self.state.lock().enumerators.remove(&consumer);
    }

    /// Stop the sink. Returns `false` if it was already stopped.
    pub(crate) fn close(&self) -> bool {
        let enumerators = {
            let mut state = self.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            state.latest = Some(Outcome::stopped());
            std::mem::take(&mut state.enumerators)
        };
        for enumerator in enumerators.into_values() {
            enumerator.push(Outcome::stopped());
        }
        true
    }

    pub(crate) fn latest(&self) -> Option<Outcome> {
        self.state.lock().latest.clone()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.state.lock().enumerators.len()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

/// Handle on a running reactive computation.
///
/// Dropping the handle disposes the computation.
pub struct RootHandle<T> {
    id: RootId,
    summary: Arc<Summary>,
    sink: Arc<RootSink>,
    manager: Weak<Manager>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> RootHandle<T> {
    pub(crate) fn new(id: RootId, summary: Arc<Summary>, sink: Arc<RootSink>, manager: Weak<Manager>) -> Self {
        Self {
            id,
            summary,
            sink,
            manager,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> RootId {
        self.id
    }

    /// The root summary backing this handle.
    pub fn summary(&self) -> &Arc<Summary> {
        &self.summary
    }

    /// Number of live enumerators.
    pub fn subscriber_count(&self) -> usize {
        self.sink.subscriber_count()
    }

    pub fn is_disposed(&self) -> bool {
        self.sink.is_disposed()
    }

    /// Stop the computation. Idempotent.
    pub fn dispose(&self) {
        if !self.sink.close() {
            return;
        }
        match self.manager.upgrade() {
            Some(manager) => manager.detach_summary(&self.summary),
            // The node is gone; nothing left to release remotely.
            None => drop(self.summary.detach()),
        }
        debug!(root = %self.id, "root disposed");
    }
}

impl<T> RootHandle<T>
where
    T: DeserializeOwned + Send + 'static,
{
    /// A new enumerator over this computation's values.
    pub fn get_iterator(&self) -> Enumerator<T> {
        let consumer = ConsumerId::new();
        let core = self.sink.subscribe(consumer);
        let sink = Arc::downgrade(&self.sink);
        Enumerator::new(
            core,
            Some(Box::new(move || {
                if let Some(sink) = sink.upgrade() {
                    sink.unsubscribe(consumer);
                }
            })),
        )
    }

    /// The most recent value or failure, if the computation produced one.
    pub fn latest(&self) -> Option<Result<T>> {
        self.sink.latest().map(|outcome| outcome.decode())
    }
}

impl<T> Drop for RootHandle<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T> fmt::Debug for RootHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootHandle")
            .field("id", &self.id)
            .field("subscribers", &self.sink.subscriber_count())
            .field("disposed", &self.sink.is_disposed())
            .finish()
    }
}
