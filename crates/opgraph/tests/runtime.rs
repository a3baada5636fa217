use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use opgraph::backend::client::ClientError;
use opgraph::backend::mesh::{LocalMesh, MeshClient};
use opgraph::runtime::{AsyncTask, Cache, MultiWait, WaitError, WorkerPool};

#[test]
fn cache_evicts_least_recently_used() {
    let cache: Cache<&str, u32> = Cache::new(2);
    cache.add("a", Arc::new(1));
    cache.add("b", Arc::new(2));
    assert_eq!(cache.get(&"a").as_deref(), Some(&1));

    cache.add("c", Arc::new(3));
    assert!(cache.contains(&"a"));
    assert!(!cache.contains(&"b"));
    assert!(cache.contains(&"c"));
    assert_eq!(cache.len(), 2);

    assert!(cache.get(&"b").is_none());
    let stats = cache.stats();
    assert_eq!((stats.hits, stats.misses, stats.evictions), (1, 1, 1));

    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(cache.capacity(), 2);
}

#[test]
fn cache_is_shared_across_threads() {
    let cache: Arc<Cache<usize, usize>> = Arc::new(Cache::new(64));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for key in 0..32 {
                    if cache.get(&key).is_none() {
                        cache.add(key, Arc::new(key * 10));
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("cache worker panicked");
    }
    assert_eq!(cache.len(), 32);
    for key in 0..32 {
        assert_eq!(cache.peek(&key).as_deref(), Some(&(key * 10)));
    }
}

#[test]
fn multi_wait_releases_only_after_every_unit() {
    let mwait = Arc::new(MultiWait::new(3));
    mwait.done();
    mwait.done();
    match mwait.wait_for(Duration::from_millis(20)) {
        Err(WaitError::TimedOut {
            completed, count, ..
        }) => assert_eq!((completed, count), (2, 3)),
        other => panic!("expected a timeout, got {other:?}"),
    }

    let finisher = {
        let mwait = Arc::clone(&mwait);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            mwait.done();
        })
    };
    mwait.wait().expect("all units succeeded");
    finisher.join().expect("finisher panicked");
    assert_eq!(mwait.completed(), 3);

    // Extra completions are ignored.
    mwait.done();
    assert_eq!(mwait.completed(), 3);
}

#[test]
fn multi_wait_with_zero_units_returns_immediately() -> Result<()> {
    let mwait = MultiWait::new(0);
    mwait.wait()?;
    mwait.wait_for(Duration::from_millis(1))?;
    Ok(())
}

#[test]
fn multi_wait_keeps_the_first_error() {
    let mwait = MultiWait::new(3);
    mwait.completer(|| Err(anyhow!("first")))();
    mwait.completer(|| Ok(()))();
    mwait.completer(|| Err(anyhow!("second")))();

    let err = mwait.wait().expect_err("a unit failed");
    assert_eq!(err.to_string(), "first");
    assert_eq!(mwait.completed(), 3);
}

#[test]
fn multi_wait_preserves_the_concrete_error_type() {
    let mwait = MultiWait::new(1);
    mwait.completer(|| {
        Err(ClientError::unimplemented("reduce", "predicate reductions").into())
    })();
    let err = mwait.wait().expect_err("unit failed");
    assert!(matches!(
        err.downcast_ref::<ClientError>(),
        Some(ClientError::Unimplemented { op: "reduce", .. })
    ));
}

#[test]
fn multi_wait_reset_rearms_the_barrier() -> Result<()> {
    let mwait = MultiWait::new(1);
    mwait.completer(|| Err(anyhow!("round one")))();
    assert!(mwait.wait().is_err());

    mwait.reset(2);
    assert_eq!((mwait.count(), mwait.completed()), (2, 0));
    mwait.done();
    mwait.done();
    mwait.wait()?;
    Ok(())
}

#[test]
fn completers_report_from_pool_workers() -> Result<()> {
    let pool = WorkerPool::new(Some(4))?;
    let mwait = MultiWait::new(16);
    let ran = AtomicUsize::new(0);
    pool.scope(|scope| {
        for _ in 0..16 {
            let task = mwait.completer(|| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            scope.spawn(move |_| task());
        }
    });
    mwait.wait()?;
    assert_eq!(ran.load(Ordering::SeqCst), 16);
    Ok(())
}

#[test]
fn pool_scopes_nest_from_workers() -> Result<()> {
    let pool = Arc::new(WorkerPool::new(Some(1))?);
    let inner_pool = Arc::clone(&pool);
    let task = AsyncTask::new(move || {
        let total = AtomicUsize::new(0);
        inner_pool.scope(|scope| {
            for value in 1..=4 {
                let total = &total;
                scope.spawn(move |_| {
                    total.fetch_add(value, Ordering::SeqCst);
                });
            }
        });
        Ok(total.load(Ordering::SeqCst))
    });
    task.schedule(&pool);
    assert_eq!(task.consume_value()?, 10);
    Ok(())
}

#[test]
fn async_task_delivers_its_value() -> Result<()> {
    let pool = WorkerPool::new(Some(2))?;
    let task = AsyncTask::new(|| Ok(vec![1, 2, 3]));
    assert!(!task.is_scheduled());
    task.schedule(&pool);
    assert!(task.is_scheduled());

    assert_eq!(task.with_value(|value| value.len())?, 3);
    assert!(task.is_completed());
    assert_eq!(task.consume_value()?, vec![1, 2, 3]);
    assert!(task.consume_value().is_err());
    Ok(())
}

#[test]
fn async_task_failure_reaches_every_waiter() -> Result<()> {
    let pool = WorkerPool::new(Some(2))?;
    let task: AsyncTask<u32> = AsyncTask::new(|| Err(anyhow!("boom")));
    let observer = task.clone();
    task.schedule(&pool);

    assert_eq!(task.wait().expect_err("task failed").to_string(), "boom");
    assert_eq!(observer.wait().expect_err("task failed").to_string(), "boom");
    assert!(matches!(
        observer.wait_for(Duration::from_secs(1)),
        Err(WaitError::Failed(_))
    ));
    Ok(())
}

#[test]
fn async_task_wait_for_times_out() -> Result<()> {
    let pool = WorkerPool::new(Some(1))?;
    let gate = Arc::new(Barrier::new(2));
    let task = {
        let gate = Arc::clone(&gate);
        AsyncTask::new(move || {
            gate.wait();
            Ok(7)
        })
    };
    task.schedule(&pool);

    assert!(matches!(
        task.wait_for(Duration::from_millis(20)),
        Err(WaitError::TimedOut { .. })
    ));
    gate.wait();
    assert_eq!(task.consume_value()?, 7);
    Ok(())
}

#[test]
#[should_panic(expected = "scheduled twice")]
fn async_task_cannot_be_scheduled_twice() {
    let pool = WorkerPool::new(Some(1)).expect("pool");
    let task = AsyncTask::new(|| Ok(()));
    task.schedule(&pool);
    task.schedule(&pool);
}

#[test]
fn local_mesh_orders_payloads_by_ordinal() -> Result<()> {
    let mesh = Arc::new(LocalMesh::new(3).with_timeout(Duration::from_secs(5)));
    let handles: Vec<_> = (0..3)
        .rev()
        .map(|ordinal| {
            let mesh = Arc::clone(&mesh);
            thread::spawn(move || mesh.rendezvous(ordinal, "init", &[ordinal as u8]))
        })
        .collect();
    for handle in handles {
        let payloads = handle.join().expect("participant panicked")?;
        assert_eq!(payloads, vec![vec![0], vec![1], vec![2]]);
    }
    assert_eq!(mesh.address(), "local");
    Ok(())
}

#[test]
fn local_mesh_times_out_without_quorum() {
    let mesh = LocalMesh::new(2).with_timeout(Duration::from_millis(20));
    let err = mesh
        .rendezvous(0, "lonely", b"x")
        .expect_err("second participant never arrives");
    assert!(err.to_string().contains("timed out"), "{err}");
    assert!(mesh.rendezvous(5, "lonely", b"x").is_err());
}

#[test]
fn timed_out_participants_withdraw_their_payload() -> Result<()> {
    let mesh = Arc::new(LocalMesh::new(2).with_timeout(Duration::from_millis(250)));
    assert!(mesh.rendezvous(0, "retry", b"stale").is_err());
    // The stale payload must not complete a quorum on its own.
    assert!(mesh.rendezvous(1, "retry", b"alone").is_err());

    let handles: Vec<_> = (0..2)
        .map(|ordinal| {
            let mesh = Arc::clone(&mesh);
            thread::spawn(move || mesh.rendezvous(ordinal, "retry", &[ordinal as u8]))
        })
        .collect();
    for handle in handles {
        let payloads = handle.join().expect("participant panicked")?;
        assert_eq!(payloads, vec![vec![0], vec![1]]);
    }
    Ok(())
}
