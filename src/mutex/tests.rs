use {
    crate::{
        CancellationToken, Flow, LockError, ReentrantMutex,
        test_util::{run_in_thread, yield_now},
    },
    futures::{channel::oneshot, executor::block_on, join},
    std::{
        panic::{self, AssertUnwindSafe},
        sync::{
            Barrier,
            atomic::{AtomicBool, AtomicU32, Ordering::SeqCst},
        },
        thread,
        time::Duration,
    },
};

fn assert_default(mutex: &ReentrantMutex) {
    assert_eq!(mutex.shared.gate.available(), 1);
    assert_eq!(mutex.shared.gate.waiters(), 0);
    assert!(!mutex.is_held_by_current_flow());
}

fn wait_for_waiters(mutex: &ReentrantMutex, n: usize) {
    while mutex.shared.gate.waiters() != n {
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn default() {
    let mutex = ReentrantMutex::default();
    assert_default(&mutex);
    assert!(!mutex.is_locked());
}

#[test]
fn clone_shares_the_lock() {
    let a = ReentrantMutex::default();
    let b = a.clone();
    assert_eq!(a, b);
    assert_ne!(a, ReentrantMutex::default());
    a.with_lock(|| {
        assert!(b.is_locked());
        assert!(b.is_held_by_current_flow());
    });
}

#[test]
fn with_lock_reenters() {
    let mutex = ReentrantMutex::default();
    let value = mutex.with_lock(|| {
        assert!(mutex.is_locked());
        assert!(mutex.is_held_by_current_flow());
        mutex.with_lock(|| {
            assert!(mutex.is_locked());
            run_in_thread(|| assert!(mutex.try_with_lock(|| ()).is_none()));
            5
        })
    });
    assert_eq!(value, 5);
    assert_default(&mutex);
}

#[test]
fn nested_call_does_not_release() {
    let mutex = ReentrantMutex::default();
    mutex.with_lock(|| {
        mutex.with_lock(|| ());
        assert!(mutex.is_locked());
        run_in_thread(|| assert!(mutex.try_with_lock(|| ()).is_none()));
    });
    run_in_thread(|| assert_eq!(mutex.try_with_lock(|| 1), Some(1)));
}

#[test]
fn released_after_panic() {
    let mutex = ReentrantMutex::default();
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        mutex.with_lock(|| -> u32 { panic!("inside") })
    }));
    assert_eq!(*res.unwrap_err().downcast::<&str>().unwrap(), "inside");
    assert_default(&mutex);
    run_in_thread(|| assert_eq!(mutex.try_with_lock(|| 1), Some(1)));
}

#[test]
fn excludes_other_threads() {
    let mutex = ReentrantMutex::default();
    let barrier = Barrier::new(2);
    let released = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            mutex.with_lock(|| {
                barrier.wait();
                thread::sleep(Duration::from_millis(50));
                released.store(true, SeqCst);
            });
        });
        barrier.wait();
        mutex.with_lock(|| assert!(released.load(SeqCst)));
    });
    assert_default(&mutex);
}

#[test]
fn counter_from_many_threads() {
    let mutex = ReentrantMutex::default();
    let counter = AtomicU32::new(0);
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..500 {
                    mutex.with_lock(|| {
                        let n = counter.load(SeqCst);
                        thread::yield_now();
                        counter.store(n + 1, SeqCst);
                    });
                }
            });
        }
    });
    assert_eq!(counter.load(SeqCst), 2000);
}

#[test]
fn nested_region_releases_only_its_own_lock() {
    let a = ReentrantMutex::default();
    let b = ReentrantMutex::default();
    a.with_lock(|| {
        b.with_lock(|| assert!(a.is_held_by_current_flow() && b.is_held_by_current_flow()));
        assert!(a.is_held_by_current_flow());
        assert!(!b.is_held_by_current_flow());
        run_in_thread(|| assert_eq!(b.try_with_lock(|| 1), Some(1)));
        run_in_thread(|| assert_eq!(a.try_with_lock(|| 1), None));
    });
    assert_default(&a);
    assert_default(&b);
}

#[test]
fn released_lock_is_contended_again() {
    let a = ReentrantMutex::default();
    let b = ReentrantMutex::default();
    b.with_lock(|| a.with_lock(|| ()));
    assert!(!a.is_held_by_current_flow());
    let entered = Barrier::new(2);
    let release = Barrier::new(2);
    thread::scope(|s| {
        s.spawn(|| {
            a.with_lock(|| {
                entered.wait();
                release.wait();
            })
        });
        entered.wait();
        // Another flow holds the lock now, so this flow must not get in.
        assert_eq!(a.try_with_lock(|| ()), None);
        assert!(!a.is_held_by_current_flow());
        release.wait();
    });
    assert_default(&a);
    assert_default(&b);
}

#[test]
fn async_hold_ends_with_its_region() {
    let a = ReentrantMutex::default();
    let b = ReentrantMutex::default();
    block_on(b.with_lock_async(|| async {
        a.with_lock_async(|| async {
            yield_now().await;
            assert!(a.is_held_by_current_flow());
        })
        .await;
        yield_now().await;
        assert!(!a.is_held_by_current_flow());
        assert!(!a.is_locked());
        assert!(b.is_held_by_current_flow());
    }));
    assert_default(&a);
    assert_default(&b);
}

#[test]
fn cancellable_when_contended() {
    let mutex = ReentrantMutex::default();
    let token = CancellationToken::new();
    mutex.with_lock(|| {
        thread::scope(|s| {
            let waiter = s.spawn(|| mutex.with_lock_cancellable(&token, || ()));
            wait_for_waiters(&mutex, 1);
            token.cancel();
            assert_eq!(waiter.join().unwrap(), Err(LockError::Cancelled));
        });
        assert_eq!(mutex.shared.gate.waiters(), 0);
    });
    assert_default(&mutex);
}

#[test]
fn reentrant_call_ignores_cancellation() {
    let mutex = ReentrantMutex::default();
    let token = CancellationToken::new();
    token.cancel();
    let res = mutex.with_lock(|| mutex.with_lock_cancellable(&token, || 1));
    assert_eq!(res, Ok(1));
    // Uncontended acquisitions do not wait and therefore succeed as well.
    assert_eq!(mutex.with_lock_cancellable(&token, || 2), Ok(2));
    assert_default(&mutex);
}

#[test]
fn cancellable_succeeds_after_release() {
    let mutex = ReentrantMutex::default();
    let token = CancellationToken::new();
    let held = Barrier::new(2);
    thread::scope(|s| {
        s.spawn(|| {
            mutex.with_lock(|| {
                held.wait();
                wait_for_waiters(&mutex, 1);
            })
        });
        held.wait();
        assert_eq!(mutex.with_lock_cancellable(&token, || 7), Ok(7));
    });
    assert_default(&mutex);
}

#[test]
fn async_reenters() {
    let mutex = ReentrantMutex::default();
    let value = block_on(mutex.with_lock_async(|| async {
        assert!(mutex.is_held_by_current_flow());
        yield_now().await;
        let nested = mutex.with_lock_async(|| async { 1 }).await;
        // Synchronous calls from inside the asynchronous region re-enter as well.
        nested + mutex.with_lock(|| 1)
    }));
    assert_eq!(value, 2);
    assert_default(&mutex);
}

#[test]
fn async_counter_two_flows() {
    let mutex = ReentrantMutex::default();
    let counter = AtomicU32::new(0);
    let increment = || async {
        for _ in 0..1000 {
            mutex
                .with_lock_async(|| async {
                    let n = counter.load(SeqCst);
                    yield_now().await;
                    counter.store(n + 1, SeqCst);
                })
                .await;
        }
    };
    block_on(async { join!(increment(), increment()) });
    assert_eq!(counter.load(SeqCst), 2000);
    assert_default(&mutex);
}

#[test]
fn async_counter_two_threads() {
    let mutex = ReentrantMutex::default();
    let counter = AtomicU32::new(0);
    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                block_on(async {
                    for _ in 0..1000 {
                        mutex
                            .with_lock_async(|| async {
                                let n = counter.load(SeqCst);
                                yield_now().await;
                                counter.store(n + 1, SeqCst);
                            })
                            .await;
                    }
                })
            });
        }
    });
    assert_eq!(counter.load(SeqCst), 2000);
}

#[test]
fn async_flows_on_one_thread_exclude_each_other() {
    let mutex = ReentrantMutex::default();
    let (tx, rx) = oneshot::channel::<()>();
    let inside = AtomicBool::new(false);
    block_on(async {
        let holder = mutex.with_lock_async(|| async {
            inside.store(true, SeqCst);
            rx.await.unwrap();
            inside.store(false, SeqCst);
        });
        let waiter = mutex.with_lock_async(|| async {
            // Only runs after the holder has left its region.
            assert!(!inside.load(SeqCst));
        });
        let driver = async {
            yield_now().await;
            assert!(inside.load(SeqCst));
            assert_eq!(mutex.shared.gate.waiters(), 1);
            tx.send(()).unwrap();
        };
        join!(holder, waiter, driver);
    });
    assert_default(&mutex);
}

#[test]
fn async_cancellable_when_contended() {
    let mutex = ReentrantMutex::default();
    let token = CancellationToken::new();
    let (tx, rx) = oneshot::channel::<()>();
    block_on(async {
        let holder = mutex.with_lock_async(|| async { rx.await.unwrap() });
        let waiter = mutex.with_lock_async_cancellable(&token, || async {});
        let driver = async {
            yield_now().await;
            token.cancel();
            yield_now().await;
            tx.send(()).unwrap();
        };
        let ((), res, ()) = join!(holder, waiter, driver);
        assert_eq!(res, Err(LockError::Cancelled));
    });
    assert_default(&mutex);
}

#[test]
fn async_released_when_dropped() {
    let mutex = ReentrantMutex::default();
    let (_tx, rx) = oneshot::channel::<()>();
    block_on(async {
        let mut holder = Box::pin(mutex.with_lock_async(|| async {
            let _ = rx.await;
        }));
        assert!(futures::poll!(holder.as_mut()).is_pending());
        assert!(mutex.is_locked());
        // The holding flow is the future, not the thread polling it.
        assert!(!mutex.is_held_by_current_flow());
    });
    assert_default(&mutex);
}

#[test]
fn async_released_after_panic() {
    let mutex = ReentrantMutex::default();
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        block_on(mutex.with_lock_async(|| async { panic!("async") }))
    }));
    assert!(res.is_err());
    assert_default(&mutex);
}

#[test]
fn captured_flow_reenters_from_another_thread() {
    let mutex = ReentrantMutex::default();
    mutex.with_lock(|| {
        let flow = Flow::capture();
        run_in_thread(|| flow.run(|| assert_eq!(mutex.with_lock(|| 1), 1)));
    });
    assert_default(&mutex);
}

#[test]
fn debug() {
    let mutex = ReentrantMutex::default();
    assert!(format!("{mutex:?}").contains("locked: false"));
    mutex.with_lock(|| assert!(format!("{mutex:?}").contains("locked: true")));
}
