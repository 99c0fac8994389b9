//! Integration tests for the cell engine: propagation, cancellation,
//! pointers, errors, collection and persistence working together.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use cellflow_core::{
    json_marshaller, Compute, DeriveOptions, Engine, EngineError, MemoryStorage, Storage,
};

#[tokio::test]
async fn values_propagate_through_derived_cells() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(3);
    let b = engine.new_source(5);
    let sum = engine
        .derive(&[a.id(), b.id()], |v| Compute::Value(v[0] + v[1]))
        .unwrap();
    // first computation runs at construction
    assert_eq!(sum.value(), Some(Ok(8)));

    a.set(8).await;
    assert_eq!(sum.value(), Some(Ok(13)));

    b.set(0).await;
    assert_eq!(sum.value(), Some(Ok(8)));
}

#[tokio::test]
async fn diamond_recomputes_each_cell_once_per_write() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(1);
    let left = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    let right = engine.derive(&[a.id()], |v| Compute::Value(v[0] * 2)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let tip = {
        let runs = runs.clone();
        engine
            .derive(&[left.id(), right.id()], move |v| {
                runs.fetch_add(1, Ordering::SeqCst);
                Compute::Value(v[0] + v[1])
            })
            .unwrap()
    };
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(tip.value(), Some(Ok(4)));

    a.set(10).await;
    assert_eq!(runs.load(Ordering::SeqCst), 2);
    assert_eq!(tip.value(), Some(Ok(31)));
}

#[tokio::test]
async fn writing_an_equal_value_does_nothing() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(4);
    let runs = Arc::new(AtomicUsize::new(0));
    let b = {
        let runs = runs.clone();
        engine
            .derive(&[a.id()], move |v| {
                runs.fetch_add(1, Ordering::SeqCst);
                Compute::Value(v[0] + 1)
            })
            .unwrap()
    };
    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sub = {
        let seen = seen.clone();
        b.subscribe(move |v| {
            if let Ok(x) = v {
                seen.lock().push(*x);
            }
        })
    };
    assert_eq!(*seen.lock(), vec![5]);
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    a.set(4).await;
    assert_eq!(runs.load(Ordering::SeqCst), 1, "no downstream recomputation");
    assert_eq!(*seen.lock(), vec![5], "no notification");
    sub.unsubscribe();
}

#[tokio::test]
async fn subscribers_see_each_net_change_exactly_once() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(3);
    let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    let c = engine
        .derive(&[a.id(), b.id()], |v| Compute::Value(v[0] + v[1]))
        .unwrap();

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sub = {
        let seen = seen.clone();
        c.subscribe(move |v| {
            if let Ok(x) = v {
                seen.lock().push(*x);
            }
        })
    };
    assert_eq!(*seen.lock(), vec![7]);

    // two inputs of c change in the same pass; one notification
    a.set(5).await;
    assert_eq!(*seen.lock(), vec![7, 11]);

    sub.unsubscribe();
    a.set(9).await;
    assert_eq!(*seen.lock(), vec![7, 11], "unsubscribed callback stays quiet");
}

#[tokio::test]
async fn previous_value_feeds_the_next_computation() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(10);
    let total = engine
        .derive_with(
            &[a.id()],
            |v, prev| Compute::Value(prev.copied().unwrap_or(0) + v[0]),
            DeriveOptions { use_previous: true, ..DeriveOptions::default() },
        )
        .unwrap();
    assert_eq!(total.value(), Some(Ok(10)));

    a.set(5).await;
    assert_eq!(total.value(), Some(Ok(15)));
    a.set(7).await;
    assert_eq!(total.value(), Some(Ok(22)));
}

#[tokio::test]
async fn a_direct_write_wins_over_a_slower_pending_value() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(0);
    a.set_future(async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(1)
    });
    a.set(2).await;
    engine.wait().await;
    // the pending value resolved under a superseded rank and was discarded
    assert_eq!(a.value(), Some(Ok(2)));
}

#[tokio::test]
async fn get_waits_for_a_pending_first_value() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source_pending(async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(41)
    });
    let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    assert_eq!(b.get().await, Ok(42));
}

#[tokio::test]
async fn a_failed_pending_value_becomes_an_error_value() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source_pending(async { Err("unreachable backend".to_string()) });
    let err = a.get().await.unwrap_err();
    assert_eq!(err.source(), a.id());
    assert_eq!(err.reason(), "unreachable backend");
}

#[tokio::test]
async fn errors_cascade_and_recover() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(1);
    let b = engine
        .derive_named(
            &[a.id()],
            |v| {
                if v[0] < 0 {
                    Compute::Error("negative input".to_string())
                } else {
                    Compute::Value(v[0] * 2)
                }
            },
            "doubler",
        )
        .unwrap();
    let c = engine.derive(&[b.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    assert_eq!(c.value(), Some(Ok(3)));

    a.set(-1).await;
    let at_b = b.value().unwrap().unwrap_err();
    let at_c = c.value().unwrap().unwrap_err();
    // downstream cells share the origin error
    assert_eq!(at_b.source(), b.id());
    assert_eq!(at_c.source(), b.id());
    assert_eq!(at_c.source_name(), Some("doubler"));
    assert!(Arc::ptr_eq(&at_b, &at_c));
    // only the origin is registered
    let errors = engine.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, b.id());

    a.set(3).await;
    assert!(engine.errors().is_empty());
    assert_eq!(b.value(), Some(Ok(6)));
    assert_eq!(c.value(), Some(Ok(7)));
}

#[tokio::test]
async fn pointers_are_transparent_to_readers() {
    let engine: Engine<i64> = Engine::new();
    let first = engine.new_source(10);
    let second = engine.new_source(20);
    let selector = engine.new_source_unset();
    selector.set_cell(first.id()).await;

    let shown = engine.derive(&[selector.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    assert_eq!(selector.value(), Some(Ok(10)));
    assert_eq!(shown.value(), Some(Ok(11)));

    // a write to the pointed-at cell flows through the pointer
    first.set(100).await;
    assert_eq!(shown.value(), Some(Ok(101)));

    // retargeting the pointer recomputes the consumers
    selector.set_cell(second.id()).await;
    assert_eq!(selector.value(), Some(Ok(20)));
    assert_eq!(shown.value(), Some(Ok(21)));
}

#[tokio::test]
async fn computations_may_return_freshly_created_cells() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(2);
    let via = {
        let inner_engine = engine.clone();
        engine
            .derive(&[a.id()], move |v| {
                let cell = inner_engine.new_source(v[0] * 10);
                Compute::Cell(cell.id())
            })
            .unwrap()
    };
    assert_eq!(via.consolidated().await, Ok(20));

    a.set(3).await;
    assert_eq!(via.consolidated().await, Ok(30));
}

#[tokio::test]
async fn pointer_chains_consolidate_to_the_final_target() {
    let engine: Engine<i64> = Engine::new();
    let base = engine.new_source(7);
    let mid = engine.new_source_unset();
    mid.set_cell(base.id()).await;
    let top = engine.new_source_unset();
    top.set_cell(mid.id()).await;

    assert_eq!(top.value(), Some(Ok(7)));
    assert_eq!(top.consolidated().await, Ok(7));
}

#[tokio::test]
async fn collection_drains_after_the_next_update() {
    let engine: Engine<i64> = Engine::new();
    let unrelated = engine.new_source(0);
    let a = engine.new_source(1);
    let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    let c = engine.derive(&[b.id()], |v| Compute::Value(v[0] + 1)).unwrap();
    assert_eq!(engine.stats().size, 4);

    // marking the tip marks its transitive inputs too
    engine.collect(&[c.id()]);
    assert_eq!(engine.stats().size, 4, "marks drain lazily");

    unrelated.set(1).await;
    assert_eq!(engine.stats().size, 1);
    assert_eq!(a.value(), None, "deleted cells read as unset");
}

#[tokio::test]
async fn functional_update_refusals() {
    let engine: Engine<i64> = Engine::new();
    let unset = engine.new_source_unset();
    assert!(matches!(
        unset.update(|v| v + 1).await,
        Err(EngineError::Uninitialized(_))
    ));

    let target = engine.new_source(1);
    let pointer = engine.new_source_unset();
    pointer.set_cell(target.id()).await;
    assert!(matches!(
        pointer.update(|v| v + 1).await,
        Err(EngineError::PointerCell(_))
    ));

    let plain = engine.new_source(41);
    plain.update(|v| v + 1).await.unwrap();
    assert_eq!(plain.value(), Some(Ok(42)));
}

#[tokio::test]
async fn stored_cells_seed_from_and_write_through_storage() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set("counter", "5");

    let (marshal, unmarshal) = json_marshaller::<i64>();
    let engine: Engine<i64> = Engine::builder()
        .storage(storage.clone())
        .marshaller(marshal.clone(), unmarshal.clone())
        .build();
    let counter = engine.new_source_stored(0, "counter");
    assert_eq!(counter.value(), Some(Ok(5)), "stored value wins over the default");

    counter.set(9).await;
    assert_eq!(storage.get("counter").as_deref(), Some("9"));

    // a fresh engine over the same backend picks the write up
    let engine2: Engine<i64> = Engine::builder()
        .storage(storage.clone())
        .marshaller(marshal, unmarshal)
        .build();
    let counter2 = engine2.new_source_stored(0, "counter");
    assert_eq!(counter2.value(), Some(Ok(9)));
}

#[tokio::test]
async fn scoped_cells_settle_and_tear_down_together() {
    let engine: Engine<i64> = Engine::new();
    let scope = engine.scope();
    let a = scope.new_source(1);
    let b = scope.derive(&[a.id()], |v| Compute::Value(v[0] * 3)).unwrap();
    scope.wait().await;
    assert_eq!(b.value(), Some(Ok(3)));

    a.set(2).await;
    assert_eq!(b.value(), Some(Ok(6)));

    scope.destroy().unwrap();
    assert_eq!(engine.stats().size, 0);
}

#[tokio::test]
async fn a_queued_write_supersedes_the_running_update() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(0);
    let b = engine
        .derive(&[a.id()], |v| {
            let x = v[0];
            Compute::from_future(async move {
                tokio::time::sleep(Duration::from_millis(40)).await;
                x * 10
            })
        })
        .unwrap();
    engine.wait().await;

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sub = {
        let seen = seen.clone();
        b.subscribe(move |v| {
            if let Ok(x) = v {
                seen.lock().push(*x);
            }
        })
    };
    assert_eq!(*seen.lock(), vec![0]);

    // the second write lands while the first update still awaits b
    let writer = tokio::spawn({
        let a = a.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            a.set(2).await;
        }
    });
    a.set(1).await;
    writer.await.unwrap();
    engine.wait().await;

    assert_eq!(b.value(), Some(Ok(20)));
    assert_eq!(*seen.lock(), vec![0, 20], "the superseded chain is never observed");
    sub.unsubscribe();
}

#[tokio::test]
async fn pointer_subscribers_observe_target_writes() {
    let engine: Engine<i64> = Engine::new();
    let target = engine.new_source(1);
    let holder = engine.new_source_unset();
    holder.set_cell(target.id()).await;
    let outer = engine.new_source_unset();
    outer.set_cell(holder.id()).await;

    let seen: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
    let sub = {
        let seen = seen.clone();
        outer.subscribe(move |v| {
            if let Ok(x) = v {
                seen.lock().push(*x);
            }
        })
    };
    assert_eq!(*seen.lock(), vec![1]);

    // the holders never commit, yet their delivered value changed
    target.set(5).await;
    assert_eq!(*seen.lock(), vec![1, 5], "writes surface through the whole chain");
    sub.unsubscribe();
}

#[tokio::test]
async fn consolidated_waits_out_a_canceled_first_computation() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source_unset();
    let b = engine.derive(&[a.id()], |v| Compute::Value(v[0] * 2)).unwrap();
    // the first computation cancels on the unset input; b settles undefined
    assert_eq!(b.value(), None);

    let waiter = tokio::spawn({
        let b = b.clone();
        async move { b.consolidated().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    a.set(3).await;
    assert_eq!(waiter.await.unwrap(), Ok(6));
}

#[tokio::test]
async fn no_fail_cells_still_commit_the_error_value() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(1);
    let b = engine
        .derive_with(
            &[a.id()],
            |v, _| {
                if v[0] < 0 {
                    Compute::Error("negative".to_string())
                } else {
                    Compute::Value(v[0] + 1)
                }
            },
            DeriveOptions { no_fail: true, ..DeriveOptions::default() },
        )
        .unwrap();
    assert_eq!(b.value(), Some(Ok(2)));

    a.set(-1).await;
    let err = b.value().unwrap().unwrap_err();
    assert_eq!(err.source(), b.id());
    assert_eq!(err.reason(), "negative");
    assert_eq!(engine.errors().len(), 1);
}

#[tokio::test]
async fn async_computations_deliver_through_the_graph() {
    let engine: Engine<i64> = Engine::new();
    let a = engine.new_source(4);
    let slow = engine
        .derive(&[a.id()], |v| {
            let x = v[0];
            Compute::from_future(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                x * x
            })
        })
        .unwrap();
    let plus = engine.derive(&[slow.id()], |v| Compute::Value(v[0] + 1)).unwrap();

    assert_eq!(plus.get().await, Ok(17));

    a.set(5).await;
    assert_eq!(plus.value(), Some(Ok(26)), "set waits for the region to settle");
}
