//! Enumerator Implementation
//!
//! An Enumerator bridges push-style delivery (a cache entry or root handle
//! receiving new outcomes) and pull-style consumption (`next().await`).
//!
//! # State Machine
//!
//! | state      | `push(o)`                         | `next()`                         |
//! |------------|-----------------------------------|----------------------------------|
//! | `CaughtUp` | buffer `o`, go `Behind`           | register waiter, go `Ahead`      |
//! | `Behind`   | overwrite buffer                  | return buffer, go `CaughtUp`     |
//! | `Ahead`    | resolve waiter with `o`, `CaughtUp` | return the same waiter         |
//!
//! Only the most recent unseen outcome is kept, so a slow consumer skips
//! intermediate values but never observes an older value after a newer one.
//!
//! Callers of `next()` that overlap while the enumerator is `Ahead` share one
//! waiter and are all woken by the same push.
//!
//! A pushed stop closes the enumerator: later pushes are ignored and, once
//! the stop has been consumed, `next()` keeps resolving with it.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt, Shared};
use futures_util::stream::{self, Stream};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;

use crate::codec::Outcome;
use crate::error::{ReactiveError, Result};

/// Observable state of an enumerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnumeratorState {
    /// No unseen outcome and nobody waiting.
    CaughtUp,
    /// An unseen outcome is buffered.
    Behind,
    /// A waiter is registered and no outcome has arrived yet.
    Ahead,
}

enum Slot {
    CaughtUp,
    Behind(Outcome),
    Ahead {
        sender: oneshot::Sender<Outcome>,
        waiter: Shared<oneshot::Receiver<Outcome>>,
    },
}

struct Inner {
    slot: Slot,
    closed: bool,
}

/// Untyped single-producer, single-consumer outcome slot.
///
/// Shared between the producer side (cache entry, root handle) and the
/// consumer side (a typed [`Enumerator`] or a summary's dependency edge).
pub(crate) struct EnumeratorCore {
    inner: Mutex<Inner>,
}

impl EnumeratorCore {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::CaughtUp,
                closed: false,
            }),
        }
    }

    /// Create an enumerator that already holds `latest` as unseen.
    pub(crate) fn preloaded(latest: Option<Outcome>) -> Self {
        let core = Self::new();
        if let Some(outcome) = latest {
            core.push(outcome);
        }
        core
    }

    /// Deliver an outcome. Never blocks and never runs consumer code.
    pub(crate) fn push(&self, outcome: Outcome) {
        let sender = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            if outcome.is_stopped() {
                inner.closed = true;
            }
            match std::mem::replace(&mut inner.slot, Slot::CaughtUp) {
                Slot::CaughtUp | Slot::Behind(_) => {
                    inner.slot = Slot::Behind(outcome);
                    return;
                }
                Slot::Ahead { sender, .. } => sender,
            }
        };
        // The waiter may have been dropped; the outcome is then lost, which
        // matches a consumer that stopped listening.
        let _ = sender.send(outcome);
    }

    /// Future resolving with the next unseen outcome.
    pub(crate) fn next(&self) -> BoxFuture<'static, Outcome> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slot, Slot::CaughtUp) {
            Slot::Behind(outcome) => future::ready(outcome).boxed(),
            Slot::CaughtUp if inner.closed => future::ready(Outcome::stopped()).boxed(),
            Slot::CaughtUp => {
                let (sender, receiver) = oneshot::channel();
                let waiter = receiver.shared();
                inner.slot = Slot::Ahead {
                    sender,
                    waiter: waiter.clone(),
                };
                wait(waiter)
            }
            Slot::Ahead { sender, waiter } => {
                inner.slot = Slot::Ahead {
                    sender,
                    waiter: waiter.clone(),
                };
                wait(waiter)
            }
        }
    }

    /// Consume a buffered outcome without waiting, if there is one.
    pub(crate) fn take_buffered(&self) -> Option<Outcome> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slot, Slot::CaughtUp) {
            Slot::Behind(outcome) => Some(outcome),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    pub(crate) fn state(&self) -> EnumeratorState {
        match self.inner.lock().slot {
            Slot::CaughtUp => EnumeratorState::CaughtUp,
            Slot::Behind(_) => EnumeratorState::Behind,
            Slot::Ahead { .. } => EnumeratorState::Ahead,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

fn wait(waiter: Shared<oneshot::Receiver<Outcome>>) -> BoxFuture<'static, Outcome> {
    // A dropped sender means the producer side is gone for good.
    async move { waiter.await.unwrap_or_else(|_| Outcome::stopped()) }.boxed()
}

/// Detach hook run when a typed enumerator is dropped.
pub(crate) type Detach = Box<dyn FnOnce() + Send + Sync>;

/// A consumer's handle on successive values of a reactive computation.
///
/// # Example
///
/// ```rust,ignore
/// let root = manager.start_reactive_computation(|| async { Ok(40 + 2) });
/// let values = root.get_iterator();
/// assert_eq!(values.next().await?, 42);
/// ```
pub struct Enumerator<T> {
    core: Arc<EnumeratorCore>,
    detach: Option<Detach>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Enumerator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(core: Arc<EnumeratorCore>, detach: Option<Detach>) -> Self {
        Self {
            core,
            detach,
            _marker: PhantomData,
        }
    }

    /// Wait for the next value not yet seen through this enumerator.
    ///
    /// Resolves with [`ReactiveError::Computation`] when the computation
    /// failed, and with [`ReactiveError::Stopped`] once it has been torn down.
    /// The returned future does not borrow the enumerator.
    pub fn next(&self) -> impl Future<Output = Result<T>> + Send + 'static {
        let next = self.core.next();
        async move { next.await.decode::<T>() }
    }

    pub fn state(&self) -> EnumeratorState {
        self.core.state()
    }

    /// Whether a stop has been delivered to this enumerator.
    pub fn is_stopped(&self) -> bool {
        self.core.is_closed()
    }

    /// Turn the enumerator into a stream that ends when the computation stops.
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send + 'static {
        stream::unfold(self, |enumerator| async move {
            match enumerator.next().await {
                Err(ReactiveError::Stopped) => None,
                item => Some((item, enumerator)),
            }
        })
    }
}

impl<T> Drop for Enumerator<T> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl<T> fmt::Debug for Enumerator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enumerator")
            .field("state", &self.core.state())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
