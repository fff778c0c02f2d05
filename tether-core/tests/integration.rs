//! Integration Tests for the Reactive Engine
//!
//! These tests run several nodes of a `LocalCluster` in one process and
//! verify that summaries, cache entries and enumerators work together across
//! them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::time::timeout;

use tether_core::prelude::*;
use tether_core::reactive::EnumeratorState;
use tether_core::runtime::{ResultUpdate, SummaryRequest, TimerCallback, TimerHandle};
use tether_core::Outcome;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);

fn config() -> ReactiveConfig {
    ReactiveConfig::default()
        .with_dependency_timeout(Duration::from_secs(2))
        .with_lease(Duration::from_secs(30))
        .with_renewal_interval(Duration::from_secs(10))
        .with_sweep_interval(Duration::from_secs(15))
}

/// A mutable value exposed as `context.get`.
fn register_cell<T>(cluster: &LocalCluster, context: &str, initial: T) -> Arc<Mutex<T>>
where
    T: serde::Serialize + Clone + Send + Sync + 'static,
{
    let cell = Arc::new(Mutex::new(initial));
    let value = cell.clone();
    cluster.register(context, "get", move |_: ()| {
        let current = value.lock().clone();
        async move { Ok(current) }
    });
    cell
}

fn upgrade(manager: &Weak<Manager>) -> Result<Arc<Manager>> {
    manager.upgrade().ok_or(ReactiveError::Stopped)
}

/// Root computation on `node` returning `context.get()`.
fn read_root<T>(node: &Arc<Manager>, context: &'static str) -> RootHandle<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Send + 'static,
{
    let manager = Arc::downgrade(node);
    node.start_reactive_computation(move || {
        let manager = manager.clone();
        async move {
            let value: T = upgrade(&manager)?.call(context, "get", &()).await?;
            Ok::<_, ReactiveError>(value)
        }
    })
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

fn key(context: &str) -> CallKey {
    CallKey::encode(context.into(), "get".into(), &()).unwrap()
}

/// Runtime wrapper that holds back pushes of one particular outcome.
struct DelayedPushes {
    inner: Arc<dyn ActorRuntime>,
    held: Outcome,
    delay: Duration,
}

impl ActorRuntime for DelayedPushes {
    fn local_node(&self) -> NodeId {
        self.inner.local_node()
    }

    fn current_context(&self) -> ContextId {
        self.inner.current_context()
    }

    fn locate(&self, context: &ContextId) -> NodeId {
        self.inner.locate(context)
    }

    fn invoke(&self, target: &ContextId, method: &MethodId, args: Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> {
        self.inner.invoke(target, method, args)
    }

    fn initiate_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>> {
        self.inner.initiate_summary(node, request)
    }

    fn cancel_summary(&self, node: NodeId, request: SummaryRequest) -> BoxFuture<'static, Result<()>> {
        self.inner.cancel_summary(node, request)
    }

    fn update_summary_result(&self, node: NodeId, update: ResultUpdate) -> BoxFuture<'static, Result<bool>> {
        let delay = if update.outcome == self.held {
            self.delay
        } else {
            Duration::ZERO
        };
        let send = self.inner.update_summary_result(node, update);
        async move {
            tokio::time::sleep(delay).await;
            send.await
        }
        .boxed()
    }

    fn register_timer(&self, interval: Duration, callback: TimerCallback) -> TimerHandle {
        self.inner.register_timer(interval, callback)
    }
}

/// Identical results are not pushed; a changed result is.
#[tokio::test]
async fn unchanged_result_is_not_observed() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", "foo".to_string());

    let root = read_root::<String>(&consumer, "store");
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "foo");

    // Same value again: the producer re-runs but nothing reaches the consumer.
    *store.lock() = "foo".to_string();
    assert_eq!(producer.invalidate(&"store".into()), 1);
    assert!(timeout(QUIET, values.next()).await.is_err());

    *store.lock() = "bar".to_string();
    producer.invalidate(&"store".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "bar");
}

/// An iterator created after the first result starts with it.
#[tokio::test]
async fn late_iterator_sees_latest_value() {
    let cluster = LocalCluster::new(config()).unwrap();
    let node = cluster.add_node();
    register_cell(&cluster, "store", 7u32);

    let root = read_root::<u32>(&node, "store");
    let early = root.get_iterator();
    assert_eq!(timeout(WAIT, early.next()).await.unwrap().unwrap(), 7);

    let late = root.get_iterator();
    assert_eq!(late.state(), EnumeratorState::Behind);
    assert_eq!(timeout(QUIET, late.next()).await.unwrap().unwrap(), 7);
    assert!(matches!(root.latest(), Some(Ok(7))));
}

/// Two iterators on one root observe the same sequence.
#[tokio::test]
async fn iterators_share_one_sequence() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", 1u32);

    let root = read_root::<u32>(&consumer, "store");
    let a = root.get_iterator();
    let b = root.get_iterator();
    assert_eq!(root.subscriber_count(), 2);

    for expected in [1u32, 2, 3] {
        if expected > 1 {
            *store.lock() = expected;
            producer.invalidate(&"store".into());
        }
        assert_eq!(timeout(WAIT, a.next()).await.unwrap().unwrap(), expected);
        assert_eq!(timeout(WAIT, b.next()).await.unwrap().unwrap(), expected);
    }

    drop(b);
    assert_eq!(root.subscriber_count(), 1);
}

/// Disposing a root wakes a pending `next()` with a stop.
#[tokio::test]
async fn dispose_stops_pending_next() {
    let cluster = LocalCluster::new(config()).unwrap();
    let node = cluster.add_node();

    let root = node.start_reactive_computation(|| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, ReactiveError>(1u32)
    });
    let values = root.get_iterator();
    let pending = values.next();

    root.dispose();
    let err = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(err.is_stopped());
    assert!(root.is_disposed());

    // Iterators created after disposal are stopped from the start.
    let after = root.get_iterator();
    assert!(timeout(QUIET, after.next()).await.unwrap().unwrap_err().is_stopped());
}

/// Failures travel like values.
#[tokio::test]
async fn computation_error_reaches_consumer() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("broken", producer.node());
    cluster.register("broken", "get", |_: ()| async {
        Err::<u32, _>(ReactiveError::computation("boom"))
    });

    let root = read_root::<u32>(&consumer, "broken");
    let values = root.get_iterator();
    let err = timeout(WAIT, values.next()).await.unwrap().unwrap_err();
    assert!(matches!(err, ReactiveError::Computation(ref message) if message == "boom"));
}

/// A dependency not read by the latest execution is released, and the
/// producer tears its summary down.
#[tokio::test]
async fn unused_dependency_is_released() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    for context in ["flag", "left", "right"] {
        cluster.place(context, producer.node());
    }
    let flag = register_cell(&cluster, "flag", true);
    register_cell(&cluster, "left", "left".to_string());
    register_cell(&cluster, "right", "right".to_string());

    let manager = Arc::downgrade(&consumer);
    let root = consumer.start_reactive_computation(move || {
        let manager = manager.clone();
        async move {
            let manager = upgrade(&manager)?;
            let use_left: bool = manager.call("flag", "get", &()).await?;
            let side = if use_left { "left" } else { "right" };
            let value: String = manager.call(side, "get", &()).await?;
            Ok::<_, ReactiveError>(value)
        }
    });
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "left");
    assert!(consumer.directory().contains(&key("left")));
    assert_eq!(root.summary().dependency_count(), 2);

    *flag.lock() = false;
    producer.invalidate(&"flag".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "right");

    assert!(!root.summary().depends_on(&key("left")));
    assert!(!consumer.directory().contains(&key("left")));
    assert!(consumer.directory().contains(&key("right")));
    eventually(|| producer.call_summary(&key("left")).is_none()).await;
    assert!(producer.call_summary(&key("right")).is_some());
}

/// Cache entries live exactly as long as they have subscribers.
#[tokio::test]
async fn cache_entry_is_reference_counted() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    register_cell(&cluster, "store", 3u32);

    let first: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    let second: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    assert_eq!(consumer.cache_count(), 1);
    assert_eq!(timeout(WAIT, first.next()).await.unwrap().unwrap(), 3);
    assert_eq!(timeout(WAIT, second.next()).await.unwrap().unwrap(), 3);

    let entry = consumer.directory().get(&key("store")).unwrap();
    assert_eq!(entry.subscriber_count(), 2);

    drop(first);
    assert_eq!(entry.subscriber_count(), 1);
    assert!(consumer.directory().contains(&key("store")));

    drop(second);
    assert!(entry.is_evicted());
    assert_eq!(consumer.cache_count(), 0);
    eventually(|| producer.call_summary(&key("store")).is_none()).await;
}

/// Summaries can depend on summaries on other nodes.
#[tokio::test]
async fn changes_cross_several_hops() {
    let cluster = LocalCluster::new(config()).unwrap();
    let a = cluster.add_node();
    let b = cluster.add_node();
    let c = cluster.add_node();
    cluster.place("store", a.node());
    cluster.place("view", b.node());
    let store = register_cell(&cluster, "store", 2u32);

    let view_manager = Arc::downgrade(&b);
    cluster.register("view", "get", move |_: ()| {
        let manager = view_manager.clone();
        async move {
            let n: u32 = upgrade(&manager)?.call("store", "get", &()).await?;
            Ok::<_, ReactiveError>(format!("n = {n}"))
        }
    });

    let root = read_root::<String>(&c, "view");
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "n = 2");

    *store.lock() = 5;
    a.invalidate(&"store".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "n = 5");

    let view = b.call_summary(&key("view")).unwrap();
    assert!(view.depends_on(&key("store")));
    assert_eq!(view.dependent_count(), 1);
}

/// Summaries on one node talk to themselves through the same protocol.
#[tokio::test]
async fn single_node_round_trip() {
    let cluster = LocalCluster::new(config()).unwrap();
    let node = cluster.add_node();
    let store = register_cell(&cluster, "store", "one".to_string());

    let root = read_root::<String>(&node, "store");
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "one");

    *store.lock() = "two".to_string();
    node.invalidate(&"store".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "two");

    drop(values);
    drop(root);
    assert_eq!(node.cache_count(), 0);
    eventually(|| node.call_summary(&key("store")).is_none()).await;
}

/// A failed push drops the edge; the producer forgets the summary once no
/// consumer is left.
#[tokio::test]
async fn failed_push_drops_the_edge() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", 1u32);

    let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);

    cluster.disconnect(consumer.node());
    *store.lock() = 2;
    producer.invalidate(&"store".into());

    eventually(|| producer.call_summary(&key("store")).is_none()).await;
    assert!(timeout(QUIET, values.next()).await.is_err());
}

/// Edges that are not renewed expire on the producer.
#[tokio::test]
async fn unrenewed_lease_expires() {
    let config = config()
        .with_lease(Duration::from_millis(150))
        .with_renewal_interval(Duration::from_millis(50));
    let cluster = LocalCluster::new(config).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    register_cell(&cluster, "store", 1u32);

    let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);

    // Keep-alives still arrive: the lease survives a sweep.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(producer.expire_leases(), 0);
    assert!(producer.call_summary(&key("store")).is_some());

    cluster.disconnect(consumer.node());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(producer.expire_leases(), 1);
    assert!(producer.call_summary(&key("store")).is_none());
}

/// A slow dependency does not fail its dependent; the value shows up once
/// it arrives.
#[tokio::test]
async fn slow_dependency_is_picked_up_later() {
    let config = config().with_dependency_timeout(Duration::from_millis(50));
    let cluster = LocalCluster::new(config).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("slow", producer.node());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    cluster.register("slow", "get", move |_: ()| {
        counter.fetch_add(1, Ordering::SeqCst);
        async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("done".to_string())
        }
    });

    let root = read_root::<String>(&consumer, "slow");
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), "done");
    assert!(root.summary().execution_count() >= 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Outside a summary, `call` is a plain invocation.
#[tokio::test]
async fn call_outside_summary_is_not_cached() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    register_cell(&cluster, "store", 9u32);

    assert!(!ReactiveContext::is_active());
    let value: u32 = consumer.call("store", "get", &()).await.unwrap();
    assert_eq!(value, 9);
    assert_eq!(consumer.cache_count(), 0);
    assert_eq!(producer.summary_count(), 0);
}

/// A computation that returns `Stopped` itself produces a failure; its
/// consumers keep receiving later results.
#[tokio::test]
async fn returned_stop_is_an_ordinary_failure() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("gate", producer.node());
    let open = Arc::new(Mutex::new(false));
    let gate = open.clone();
    cluster.register("gate", "get", move |_: ()| {
        let open = *gate.lock();
        async move {
            if open {
                Ok(1u32)
            } else {
                Err(ReactiveError::Stopped)
            }
        }
    });

    let root = read_root::<u32>(&consumer, "gate");
    let values = root.get_iterator();
    let err = timeout(WAIT, values.next()).await.unwrap().unwrap_err();
    assert!(matches!(err, ReactiveError::Computation(_)));
    assert!(!values.is_stopped());

    *open.lock() = true;
    producer.invalidate(&"gate".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);
}

/// A panic in a summary body becomes a failure, and the context keeps
/// running later executions.
#[tokio::test]
async fn panicking_computation_is_a_failure() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("fragile", producer.node());
    let broken = Arc::new(Mutex::new(true));
    let state = broken.clone();
    cluster.register("fragile", "get", move |_: ()| {
        let broken = *state.lock();
        async move {
            if broken {
                panic!("fragile state");
            }
            Ok::<_, ReactiveError>(4u32)
        }
    });

    let root = read_root::<u32>(&consumer, "fragile");
    let values = root.get_iterator();
    let err = timeout(WAIT, values.next()).await.unwrap().unwrap_err();
    assert!(matches!(err, ReactiveError::Computation(ref message) if message.contains("fragile state")));

    *broken.lock() = false;
    assert_eq!(producer.invalidate(&"fragile".into()), 1);
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 4);
}

/// Execution contexts are forgotten once their last summary is gone.
#[tokio::test]
async fn idle_contexts_are_pruned() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    register_cell(&cluster, "store", 1u32);

    let root = read_root::<u32>(&consumer, "store");
    let values = root.get_iterator();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);

    let client = ContextId::client(consumer.node());
    assert!(consumer.context(&client).is_some());
    assert!(producer.context(&"store".into()).is_some());

    drop(values);
    drop(root);
    eventually(|| consumer.context(&client).is_none()).await;
    eventually(|| producer.context(&"store".into()).is_none()).await;
    assert_eq!(producer.summary_count(), 0);

    // A pruned context comes back on demand.
    let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);
    assert!(producer.context(&"store".into()).is_some());
}

// ----------------------------------------------------------------------------
// Races on a multi-threaded runtime
// ----------------------------------------------------------------------------

/// The current result sent to a newly attached consumer can arrive after a
/// newer push; the consumer keeps the newer one.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_catch_up_push_does_not_roll_back() {
    let cluster = LocalCluster::new(config()).unwrap();
    let held = Outcome::value(&1u32).unwrap();
    let producer = cluster.add_node_with(|inner| {
        let delayed: Arc<dyn ActorRuntime> = Arc::new(DelayedPushes {
            inner,
            held,
            delay: Duration::from_millis(300),
        });
        delayed
    });
    let early = cluster.add_node();
    let late = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", 1u32);

    let first: Enumerator<u32> = early.observe("store", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, first.next()).await.unwrap().unwrap(), 1);

    // The second consumer's catch-up push of 1 is held back while the
    // producer moves on to 2.
    let values: Enumerator<u32> = late.observe("store", "get", &()).unwrap();
    eventually(|| {
        producer
            .call_summary(&key("store"))
            .is_some_and(|summary| summary.dependent_count() == 2)
    })
    .await;
    *store.lock() = 2;
    producer.invalidate(&"store".into());

    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 2);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(timeout(QUIET, values.next()).await.is_err());

    let entry = late.directory().get(&key("store")).unwrap();
    assert_eq!(entry.latest().unwrap().decode::<u32>().unwrap(), 2);
    assert_eq!(timeout(WAIT, first.next()).await.unwrap().unwrap(), 2);
}

/// A summary torn down while queued behind a running execution is replaced;
/// the replacement runs without waiting for a keep-alive.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replacement_summary_runs_after_teardown() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("slow", producer.node());
    let current = Arc::new(AtomicUsize::new(1));
    let source = current.clone();
    cluster.register("slow", "get", move |_: ()| {
        let value = source.load(Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ReactiveError>(value)
        }
    });

    let values: Enumerator<usize> = consumer.observe("slow", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);
    let old = producer.call_summary(&key("slow")).unwrap();

    // One execution running, another queued.
    current.store(2, Ordering::SeqCst);
    producer.invalidate(&"slow".into());
    tokio::time::sleep(Duration::from_millis(50)).await;
    producer.invalidate(&"slow".into());

    drop(values);
    eventually(|| old.is_detached()).await;

    let values: Enumerator<usize> = consumer.observe("slow", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 2);
    let replacement = producer.call_summary(&key("slow")).unwrap();
    assert!(!Arc::ptr_eq(&old, &replacement));
    assert!(replacement.execution_count() >= 1);
}

/// Consumers that attach while the producer keeps re-executing never go
/// back in time and all end on the final result.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumers_attaching_mid_execution_converge() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumers: Vec<Arc<Manager>> = (0..3).map(|_| cluster.add_node()).collect();
    cluster.place("counter", producer.node());
    let current = Arc::new(AtomicUsize::new(0));
    let source = current.clone();
    cluster.register("counter", "get", move |_: ()| {
        let value = source.load(Ordering::SeqCst);
        async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, ReactiveError>(value)
        }
    });

    let mut observers: Vec<Enumerator<usize>> = Vec::new();
    for round in 1..=5 {
        current.store(round, Ordering::SeqCst);
        producer.invalidate(&"counter".into());
        tokio::time::sleep(Duration::from_millis(10)).await;
        for node in &consumers {
            observers.push(node.observe("counter", "get", &()).unwrap());
        }
    }

    for values in &observers {
        let mut last = 0;
        while last < 5 {
            let value = timeout(WAIT, values.next()).await.unwrap().unwrap();
            assert!(value >= last, "went back from {last} to {value}");
            last = value;
        }
    }
}

/// Dropping and re-creating a cache entry in quick succession leaves the
/// live entry subscribed, whatever order its requests arrive in.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn quick_resubscribe_keeps_the_producer_edge() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", 1u32);

    for _ in 0..20 {
        let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
        drop(values);
    }
    let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 1);

    tokio::time::sleep(QUIET).await;
    let summary = producer.call_summary(&key("store")).unwrap();
    assert_eq!(summary.dependent_count(), 1);

    *store.lock() = 2;
    producer.invalidate(&"store".into());
    assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 2);
}

/// Many tasks creating and evicting the same cache entry at once always end
/// up on a live entry.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribe_and_evict() {
    let cluster = LocalCluster::new(config()).unwrap();
    let producer = cluster.add_node();
    let consumer = cluster.add_node();
    cluster.place("store", producer.node());
    let store = register_cell(&cluster, "store", 5u32);

    let tasks = (0..8).map(|_| {
        let consumer = consumer.clone();
        tokio::spawn(async move {
            for _ in 0..20 {
                let values: Enumerator<u32> = consumer.observe("store", "get", &()).unwrap();
                assert_eq!(timeout(WAIT, values.next()).await.unwrap().unwrap(), 5);
            }
        })
    });
    for task in join_all(tasks).await {
        task.unwrap();
    }
    assert_eq!(consumer.cache_count(), 0);

    // A summary kept alive by a reordered request loses its edge on the
    // next change, since nobody on the consumer takes the push.
    *store.lock() = 6;
    producer.invalidate(&"store".into());
    eventually(|| producer.call_summary(&key("store")).is_none()).await;
}
