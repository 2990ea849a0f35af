//! Integration Tests for the Reactive System
//!
//! These tests verify that containers, computed values, effects, watchers and
//! the job queue work together correctly.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use ripple_core::{
    Depth, EffectOptions, ErrorPhase, FlushMode, OnCleanup, ReactiveError, Runtime,
    RuntimeConfig, Traversal, Traverse, WatchOptions,
};

#[derive(Debug, Clone, PartialEq)]
struct Counter {
    a: i32,
    b: i32,
}

impl Traverse for Counter {}

/// Test that a read location, once written, schedules its reader exactly once.
#[test]
fn dependency_soundness() {
    let runtime = Runtime::new();
    let state = runtime.reactive(Counter { a: 1, b: 1 });
    let runs = Arc::new(AtomicI32::new(0));

    let reader = state.clone();
    let counter = runs.clone();
    runtime.effect_with(
        move || {
            reader.get("a", |s| s.a);
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EffectOptions::new().queued(1),
    );

    state.set("a", |s| &mut s.a, 2);
    assert_eq!(runtime.stats().queued, 1);

    runtime.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Nothing pending: another flush runs nothing.
    runtime.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a branch no longer taken stops scheduling the effect.
#[test]
fn stale_dependencies_are_pruned() {
    let runtime = Runtime::new();
    let use_a = runtime.create_ref(true);
    let state = runtime.reactive(Counter { a: 1, b: 1 });
    let runs = Arc::new(AtomicI32::new(0));

    let flag = use_a.clone();
    let reader = state.clone();
    let counter = runs.clone();
    runtime.effect(move || {
        if flag.get() {
            reader.get("a", |s| s.a);
        } else {
            reader.get("b", |s| s.b);
        }
        counter.fetch_add(1, Ordering::SeqCst);
    });

    use_a.set(false);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // `a` was not read by the last run.
    state.set("a", |s| &mut s.a, 10);
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    state.set("b", |s| &mut s.b, 10);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
}

/// Test that K synchronous triggers produce one run in the next flush.
#[test]
fn at_most_once_per_flush() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(0);
    let runs = Arc::new(AtomicI32::new(0));

    let reader = count.clone();
    let counter = runs.clone();
    runtime.effect_with(
        move || {
            reader.get();
            counter.fetch_add(1, Ordering::SeqCst);
        },
        EffectOptions::new().queued(1),
    );

    for value in 1..=10 {
        count.set(value);
    }
    runtime.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that repeated reads without changes run the getter once.
#[test]
fn computed_laziness() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(2);
    let calls = Arc::new(AtomicI32::new(0));

    let reader = count.clone();
    let counter = calls.clone();
    let squared = runtime.computed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        reader.get() * reader.get()
    });

    assert_eq!(squared.get(), 4);
    assert_eq!(squared.get(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Test that an effect reading a computed re-runs once per upstream change.
#[test]
fn computed_propagation() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(1);
    let runs = Arc::new(AtomicI32::new(0));
    let seen = Arc::new(AtomicI32::new(0));

    let reader = count.clone();
    let plus_one = runtime.computed(move || reader.get() + 1);

    let value = plus_one.clone();
    let counter = runs.clone();
    let sink = seen.clone();
    runtime.effect(move || {
        sink.store(value.get(), Ordering::SeqCst);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    count.set(2);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(seen.load(Ordering::SeqCst), 3);
}

/// Test that effects with ids 1, 2, 3 run in id order in one flush.
#[test]
fn order_stability() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(0);
    let order = Arc::new(Mutex::new(Vec::new()));

    for id in [3u64, 1, 2] {
        let reader = count.clone();
        let order = order.clone();
        runtime.effect_with(
            move || {
                if reader.get() > 0 {
                    order.lock().push(id);
                }
            },
            EffectOptions::new().queued(id),
        );
    }

    count.set(1);
    runtime.flush();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

/// Test that stopping twice is the same as stopping once.
#[test]
fn idempotent_stop() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(0);
    let runs = Arc::new(AtomicI32::new(0));

    let reader = count.clone();
    let counter = runs.clone();
    let effect = runtime.effect(move || {
        reader.get();
        counter.fetch_add(1, Ordering::SeqCst);
    });

    effect.stop();
    effect.stop();
    count.set(1);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!effect.is_active());
}

/// Test: `r = ref(1)`, an effect stores `r * 2`, `r = 5` gives 10 after flush.
#[test]
fn scenario_ref_effect() {
    let runtime = Runtime::new();
    let r = runtime.create_ref(1);
    let seen = Arc::new(AtomicI32::new(0));

    let reader = r.clone();
    let sink = seen.clone();
    runtime.effect_with(
        move || sink.store(reader.get() * 2, Ordering::SeqCst),
        EffectOptions::new().queued(1),
    );

    r.set(5);
    runtime.flush();
    assert_eq!(seen.load(Ordering::SeqCst), 10);
}

/// Test: a computed over `o.a` does not recompute until it is read.
#[test]
fn scenario_lazy_computed_over_object() {
    let runtime = Runtime::new();
    let o = runtime.reactive(Counter { a: 1, b: 0 });
    let calls = Arc::new(AtomicI32::new(0));

    let reader = o.clone();
    let counter = calls.clone();
    let c = runtime.computed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        reader.get("a", |s| s.a) + 1
    });
    assert_eq!(c.get(), 2);

    o.set("a", |s| &mut s.a, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert_eq!(c.get(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Test: watching `o.a` logs exactly one `(9, 2)` after the flush.
#[test]
fn scenario_watch_getter() {
    let runtime = Runtime::new();
    let o = runtime.reactive(Counter { a: 2, b: 0 });
    let log = Arc::new(Mutex::new(Vec::new()));

    let reader = o.clone();
    let sink = log.clone();
    runtime.watch(
        move || reader.get("a", |s| s.a),
        move |new: &i32, old: Option<&i32>, _| sink.lock().push((*new, old.copied())),
        WatchOptions::new(),
    );

    o.set("a", |s| &mut s.a, 9);
    assert!(log.lock().is_empty());

    runtime.flush();
    assert_eq!(*log.lock(), vec![(9, Some(2))]);
}

/// Test that the configured default flush applies to watchers.
#[test]
fn config_default_flush_applies_to_watchers() {
    let config = RuntimeConfig::from_json(r#"{"label":"sync-app","default_flush":"sync"}"#).unwrap();
    let runtime = Runtime::with_config(config);
    let count = runtime.create_ref(0);
    let fired = Arc::new(AtomicI32::new(0));

    let counter = fired.clone();
    runtime.watch(
        count.clone(),
        move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        WatchOptions::new(),
    );

    count.set(1);
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Test that a deep watcher on a map sees additions and nested changes.
#[test]
fn deep_watch_over_map_of_vecs() {
    let runtime = Runtime::new();
    let scores = runtime.reactive_map(indexmap::IndexMap::new());
    let fired = Arc::new(AtomicI32::new(0));

    let counter = fired.clone();
    runtime.watch(
        scores.clone(),
        move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        WatchOptions::new().flush(FlushMode::Sync),
    );

    let ada = runtime.reactive_vec(vec![1]);
    scores.insert("ada".to_string(), ada.clone());
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    ada.push(2);
    assert_eq!(fired.load(Ordering::SeqCst), 2);
}

/// Test that a bounded deep watch ignores writes below its depth.
#[test]
fn bounded_depth_stops_descending() {
    let runtime = Runtime::new();
    let leaf = runtime.reactive_vec(vec![0]);
    let middle = runtime.reactive_vec(vec![leaf.clone()]);
    let top = runtime.create_ref(middle.clone());
    let fired = Arc::new(AtomicI32::new(0));

    let reader = top.clone();
    let counter = fired.clone();
    runtime.watch(
        move || reader.get(),
        move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        WatchOptions::new()
            .flush(FlushMode::Sync)
            .deep(Depth::Bounded(1)),
    );

    leaf.push(1);
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    middle.push(runtime.reactive_vec(Vec::new()));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}

/// Test that watcher callbacks failing in a flush reach the error handler.
#[test]
fn callback_panics_reach_error_handler() {
    let runtime = Runtime::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    runtime.set_error_handler(move |err: &ReactiveError| sink.lock().push(err.to_string()));

    let count = runtime.create_ref(0);
    let after = Arc::new(AtomicI32::new(0));
    runtime.watch(
        count.clone(),
        |_, _, _| panic!("callback failed"),
        WatchOptions::new().label("broken").id(1),
    );
    let counter = after.clone();
    runtime.watch(
        count.clone(),
        move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        },
        WatchOptions::new().id(2),
    );

    count.set(1);
    runtime.flush();
    assert_eq!(after.load(Ordering::SeqCst), 1);
    assert_eq!(
        *errors.lock(),
        vec![format!("`broken` panicked during {}: callback failed", ErrorPhase::WatchCallback)]
    );
}

/// Test that disposing the runtime stops everything and runs cleanups.
#[test]
fn dispose_stops_effects_and_watchers() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(0);
    let runs = Arc::new(AtomicI32::new(0));
    let cleanups = Arc::new(AtomicI32::new(0));

    let reader = count.clone();
    let counter = runs.clone();
    runtime.effect(move || {
        reader.get();
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let cleaned = cleanups.clone();
    runtime.watch(
        count.clone(),
        move |_, _, on_cleanup: &mut OnCleanup| {
            let cleaned = cleaned.clone();
            on_cleanup.register(move || {
                cleaned.fetch_add(1, Ordering::SeqCst);
            });
        },
        WatchOptions::new().immediate(),
    );

    runtime.dispose();
    assert_eq!(runtime.stats().effects, 0);
    assert_eq!(cleanups.load(Ordering::SeqCst), 1);

    count.set(1);
    runtime.flush();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(count.get(), 1);
}

/// Test that a computed read after dispose reflects current state.
#[test]
fn computed_recomputes_after_dispose() {
    let runtime = Runtime::new();
    let base = runtime.create_ref(1);
    let calls = Arc::new(AtomicI32::new(0));

    let reader = base.clone();
    let counter = calls.clone();
    let doubled = runtime.computed(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        reader.get() * 2
    });
    assert_eq!(doubled.get(), 2);

    runtime.dispose();
    base.set(5);
    assert_eq!(doubled.get(), 10);
    assert_eq!(doubled.get(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(runtime.stats().deps, 0);
}

/// Test that a panicking inline effect does not starve the effects
/// triggered by the same write.
#[test]
fn panicking_inline_effect_does_not_stop_siblings() {
    let runtime = Runtime::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    runtime.set_error_handler(move |err: &ReactiveError| sink.lock().push(err.to_string()));

    let count = runtime.create_ref(0);
    let runs = Arc::new(AtomicI32::new(0));

    let failing = count.clone();
    runtime.effect_with(
        move || {
            if failing.get() == 1 {
                panic!("bad value");
            }
        },
        EffectOptions::new().label("strict"),
    );
    let reader = count.clone();
    let counter = runs.clone();
    runtime.effect(move || {
        reader.get();
        counter.fetch_add(1, Ordering::SeqCst);
    });

    count.set(1);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(
        *errors.lock(),
        vec![format!("`strict` panicked during {}: bad value", ErrorPhase::Effect)]
    );

    // Both effects are still subscribed.
    count.set(2);
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(errors.lock().len(), 1);
}

/// Test that batching defers schedulers until the batch closes.
#[test]
fn batch_runs_inline_effects_once() {
    let runtime = Runtime::new();
    let state = runtime.reactive(Counter { a: 0, b: 0 });
    let runs = Arc::new(AtomicI32::new(0));

    let reader = state.clone();
    let counter = runs.clone();
    runtime.effect(move || {
        reader.with(|s| s.a + s.b);
        counter.fetch_add(1, Ordering::SeqCst);
    });

    runtime.batch(|| {
        state.set("a", |s| &mut s.a, 1);
        state.set("b", |s| &mut s.b, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    });
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a container reachable twice is traversed once.
#[test]
fn traversal_visits_shared_containers_once() {
    let runtime = Runtime::new();
    let list = runtime.reactive_vec(Vec::<ripple_core::ReactiveVec<i32>>::new());
    let inner = runtime.reactive_vec(vec![1]);
    list.push(inner.clone());
    list.push(inner);

    let mut traversal = Traversal::new(None);
    list.traverse(&mut traversal);
    assert_eq!(traversal.visited(), 2);
}

/// Test that `next_tick` resolves once watchers queued by a write have run.
#[tokio::test]
async fn next_tick_flushes_watchers() {
    let runtime = Runtime::new();
    let count = runtime.create_ref(0);
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = log.clone();
    runtime.watch(
        count.clone(),
        move |new: &i32, _, _| sink.lock().push(*new),
        WatchOptions::new().flush(FlushMode::Post),
    );

    count.set(1);
    count.set(2);
    runtime.next_tick().await;
    assert_eq!(*log.lock(), vec![2]);
}
