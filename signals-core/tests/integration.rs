//! Integration Tests for the Reactive System
//!
//! These tests drive state, computed cells and effects together through the
//! public API only.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use signals_core::reactive::{chain_scope, Computed, SignalContext, SignalExt, State};
use signals_core::{NodeId, SignalError};

fn counted_plus_one(ctx: &SignalContext, state: &State<i32>) -> (Computed<i32>, Arc<AtomicI32>) {
    let calls = Arc::new(AtomicI32::new(0));
    let computed = {
        let (state, calls) = (state.clone(), calls.clone());
        ctx.computed_fn(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            state.get() + 1
        })
    };
    (computed, calls)
}

/// Reading a clean computed twice evaluates it once and returns the same value.
#[tokio::test]
async fn clean_read_is_idempotent() {
    let ctx = SignalContext::new();
    let state = ctx.state(1);
    let (computed, calls) = counted_plus_one(&ctx, &state);

    let first = computed.get().await.unwrap();
    let second = computed.get().await.unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Writing A re-evaluates only the computeds downstream of A.
#[tokio::test]
async fn propagation_is_exact() {
    let ctx = SignalContext::new();
    let a = ctx.state(1);
    let b = ctx.state(10);
    let (from_a, calls_a) = counted_plus_one(&ctx, &a);
    let (from_b, calls_b) = counted_plus_one(&ctx, &b);
    let sum = {
        let (from_a, from_b) = (from_a.clone(), from_b.clone());
        ctx.computed(move |_| {
            let (from_a, from_b) = (from_a.clone(), from_b.clone());
            async move { Ok::<_, SignalError>(from_a.get().await? + from_b.get().await?) }
        })
    };

    assert_eq!(sum.get().await.unwrap(), 13);

    a.set(2).await.unwrap();
    assert!(from_a.is_dirty());
    assert!(sum.is_dirty());
    assert!(!from_b.is_dirty());

    assert_eq!(sum.get().await.unwrap(), 14);
    assert_eq!(calls_a.load(Ordering::SeqCst), 2);
    assert_eq!(calls_b.load(Ordering::SeqCst), 1);
}

/// Writing an equal value changes nothing and notifies nobody.
#[tokio::test]
async fn equal_write_is_a_no_op() {
    let ctx = SignalContext::new();
    let state = ctx.state(5);
    let (computed, calls) = counted_plus_one(&ctx, &state);
    computed.get().await.unwrap();

    let fired = Arc::new(AtomicI32::new(0));
    let _subscription = {
        let fired = fired.clone();
        computed.subscribe_fn(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    state.set(5).await.unwrap();

    assert!(!computed.is_dirty());
    assert_eq!(fired.load(Ordering::SeqCst), 0);
    computed.get().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// Three writes in one batch notify a dependent's subscriber exactly once,
/// and only after the batch closes.
#[tokio::test]
async fn batch_coalesces_notifications() {
    let ctx = SignalContext::new();
    let state = ctx.state(0);
    let (computed, _) = counted_plus_one(&ctx, &state);
    computed.get().await.unwrap();

    let fired = Arc::new(AtomicI32::new(0));
    let _subscription = {
        let fired = fired.clone();
        computed.subscribe_fn(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    let scope = ctx.write_scope();
    state.set(1).await.unwrap();
    state.set(2).await.unwrap();
    state.set(3).await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    scope.release().await.unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert_eq!(computed.get().await.unwrap(), 4);
}

/// An effect over `s` runs once on registration and once per unbatched write.
#[tokio::test]
async fn effect_replays_on_every_invalidation() {
    let ctx = SignalContext::new();
    let s = ctx.state(0);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let effect = {
        let (s, seen) = (s.clone(), seen.clone());
        ctx.effect_fn(move || seen.lock().push(s.get())).await.unwrap()
    };

    s.set(1).await.unwrap();
    s.set(2).await.unwrap();

    assert_eq!(*seen.lock(), vec![0, 1, 2]);
    assert_eq!(effect.run_count(), 3);
}

/// After disposal the action never runs again and the reverse index no
/// longer lists the effect.
#[tokio::test]
async fn disposal_halts_notification() {
    let ctx = SignalContext::new();
    let s = ctx.state(0);
    let runs = Arc::new(AtomicI32::new(0));

    let effect = {
        let (s, runs) = (s.clone(), runs.clone());
        ctx.effect_fn(move || {
            s.get();
            runs.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap()
    };
    assert_eq!(ctx.dependents_of(s.id()), vec![effect.id()]);

    effect.dispose();
    s.set(1).await.unwrap();
    s.set(2).await.unwrap();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!ctx.dependents_of(s.id()).contains(&effect.id()));
    assert!(ctx.is_consistent());
}

/// A frozen state rejects writes and keeps its value.
#[tokio::test]
async fn frozen_cell_rejects_writes() {
    let ctx = SignalContext::new();
    let state = ctx.state(7);
    state.freeze();

    let err = state.set(8).await.unwrap_err();
    assert!(matches!(err, SignalError::Frozen(id) if id == state.id()));
    assert!(err.is_contract_violation());
    assert_eq!(state.get(), 7);
}

/// Finishing the outer of two nested compute scopes first is rejected.
#[test]
fn out_of_order_scope_finish_is_detected() {
    let ctx = SignalContext::new();
    let outer = NodeId::new();
    let inner = NodeId::new();

    let outer_scope = ctx.compute_scope(outer);
    let inner_scope = ctx.compute_scope(inner);

    let err = outer_scope.finish().unwrap_err();
    assert!(matches!(
        err,
        SignalError::ScopeOutOfOrder { owner, innermost: Some(top) } if owner == outer && top == inner
    ));
    assert!(err.is_contract_violation());

    inner_scope.finish().unwrap();
}

/// A diamond re-evaluates its bottom once per upstream change.
#[tokio::test]
async fn diamond_evaluates_bottom_once() {
    let ctx = SignalContext::new();
    let top = ctx.state(1);
    let left = {
        let top = top.clone();
        ctx.computed_fn(move || top.get() * 2)
    };
    let right = {
        let top = top.clone();
        ctx.computed_fn(move || top.get() * 3)
    };
    let bottom_calls = Arc::new(AtomicI32::new(0));
    let bottom = {
        let (left, right, calls) = (left.clone(), right.clone(), bottom_calls.clone());
        ctx.computed(move |_| {
            let (left, right, calls) = (left.clone(), right.clone(), calls.clone());
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, SignalError>(left.get().await? + right.get().await?)
            }
        })
    };

    assert_eq!(bottom.get().await.unwrap(), 5);
    top.set(2).await.unwrap();
    assert_eq!(bottom.get().await.unwrap(), 10);
    assert_eq!(bottom_calls.load(Ordering::SeqCst), 2);
    assert_eq!(ctx.dependencies_of(bottom.id()).len(), 2);
}

/// Tasks sharing one context keep their own scopes and batches.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_chains_share_one_graph() {
    let ctx = SignalContext::new();
    let cells: Vec<State<i32>> = (0..8).map(|i| ctx.state(i)).collect();
    let total = {
        let cells = cells.clone();
        ctx.computed_fn(move || cells.iter().map(State::get).sum::<i32>())
    };
    assert_eq!(total.get().await.unwrap(), 28);

    let writers: Vec<_> = cells
        .iter()
        .cloned()
        .map(|cell| {
            let ctx = ctx.clone();
            tokio::spawn(chain_scope(async move {
                ctx.batch(async {
                    cell.update(|v| v + 100).await?;
                    tokio::task::yield_now().await;
                    cell.update(|v| v + 1).await
                })
                .await?
            }))
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    assert_eq!(total.get().await.unwrap(), 28 + 8 * 101);
    assert_eq!(ctx.write_depth(), 0);
    assert_eq!(ctx.pending_notifications(), 0);
    assert!(ctx.is_consistent());
}

/// A batch held open in one spawned task does not hold back another task's
/// writes, even when neither task runs under `chain_scope`.
#[tokio::test]
async fn open_batch_does_not_delay_other_tasks() {
    use tokio::sync::oneshot;

    let ctx = SignalContext::new();
    let batched = ctx.state(0);
    let other = ctx.state(0);
    let fired = Arc::new(AtomicI32::new(0));
    let _subscription = {
        let fired = fired.clone();
        other.subscribe_fn(move |_| {
            fired.fetch_add(1, Ordering::SeqCst);
        })
    };

    let (entered_tx, entered_rx) = oneshot::channel::<()>();
    let (finish_tx, finish_rx) = oneshot::channel::<()>();
    let holder = {
        let (ctx, batched) = (ctx.clone(), batched.clone());
        tokio::spawn(async move {
            ctx.batch(async {
                batched.set(1).await?;
                entered_tx.send(()).ok();
                finish_rx.await.ok();
                Ok::<_, SignalError>(())
            })
            .await?
        })
    };
    entered_rx.await.unwrap();

    let writer = {
        let other = other.clone();
        tokio::spawn(async move { other.set(5).await })
    };
    writer.await.unwrap().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    finish_tx.send(()).unwrap();
    holder.await.unwrap().unwrap();
    assert_eq!(batched.get(), 1);
    assert_eq!(ctx.write_depth(), 0);
}

/// A computed whose first evaluation raced a write to a cell it read does
/// not cache the outdated result as clean.
#[tokio::test]
async fn write_racing_first_evaluation_is_not_lost() {
    let ctx = SignalContext::new();
    let s = ctx.state(1);
    let gate = Arc::new(tokio::sync::Notify::new());
    let started = Arc::new(tokio::sync::Notify::new());
    let first_run = Arc::new(std::sync::atomic::AtomicBool::new(true));

    let computed = {
        let (s, gate, started, first_run) = (s.clone(), gate.clone(), started.clone(), first_run.clone());
        ctx.computed(move |_| {
            let value = s.get();
            let wait = first_run.swap(false, Ordering::SeqCst);
            let (gate, started) = (gate.clone(), started.clone());
            async move {
                if wait {
                    started.notify_one();
                    gate.notified().await;
                }
                Ok::<_, SignalError>(value * 10)
            }
        })
    };

    let reader = {
        let computed = computed.clone();
        tokio::spawn(chain_scope(async move { computed.get().await }))
    };
    started.notified().await;
    s.set(2).await.unwrap();
    gate.notify_one();

    assert_eq!(reader.await.unwrap().unwrap(), 10);
    assert!(computed.is_dirty());
    assert_eq!(computed.get().await.unwrap(), 20);
    assert_eq!(computed.get().await.unwrap(), 20);
}
