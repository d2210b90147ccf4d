use {
    crate::{
        flow::{self, Flow, Hold, LockId},
        test_util::{run_in_thread, yield_now},
    },
    futures::{executor::block_on, future::poll_fn, join},
    std::{
        future::Future,
        panic::{self, AssertUnwindSafe},
        task::Poll,
    },
};

#[test]
fn lock_ids_are_unique() {
    let a = LockId::next();
    let b = LockId::next();
    assert_ne!(a, b);
    assert_ne!(a, run_in_thread(LockId::next));
}

#[test]
fn empty() {
    let flow = Flow::empty();
    assert!(flow.is_empty());
    assert_eq!(flow.hold(LockId::next()), None);
}

#[test]
fn with_hold() {
    let a = LockId::next();
    let b = LockId::next();
    let flow = Flow::empty().with_hold(a, Hold::Exclusive);
    assert_eq!(flow.hold(a), Some(Hold::Exclusive));
    assert_eq!(flow.hold(b), None);
    let nested = flow.with_hold(b, Hold::Reader);
    assert_eq!(nested.hold(a), Some(Hold::Exclusive));
    assert_eq!(nested.hold(b), Some(Hold::Reader));
    // The original snapshot is unchanged.
    assert_eq!(flow.hold(b), None);
}

#[test]
fn run_restores_previous_flow() {
    let a = LockId::next();
    assert!(Flow::capture().is_empty());
    Flow::empty().with_hold(a, Hold::Exclusive).run(|| {
        assert_eq!(flow::current_hold(a), Some(Hold::Exclusive));
        Flow::empty().run(|| assert_eq!(flow::current_hold(a), None));
        assert_eq!(flow::current_hold(a), Some(Hold::Exclusive));
    });
    assert_eq!(flow::current_hold(a), None);
}

#[test]
fn run_restores_after_panic() {
    let a = LockId::next();
    let res = panic::catch_unwind(|| {
        Flow::empty()
            .with_hold(a, Hold::Writer)
            .run(|| panic!("inside"))
    });
    assert!(res.is_err());
    assert_eq!(flow::current_hold(a), None);
}

#[test]
fn threads_start_empty() {
    let a = LockId::next();
    Flow::empty().with_hold(a, Hold::Exclusive).run(|| {
        assert_eq!(run_in_thread(|| flow::current_hold(a)), None);
        let captured = Flow::capture();
        assert_eq!(
            run_in_thread(|| captured.run(|| flow::current_hold(a))),
            Some(Hold::Exclusive),
        );
    });
}

#[test]
fn scope_is_installed_on_every_poll() {
    let a = LockId::next();
    let scoped = Flow::empty().with_hold(a, Hold::Reader).scope(async move {
        assert_eq!(flow::current_hold(a), Some(Hold::Reader));
        yield_now().await;
        assert_eq!(flow::current_hold(a), Some(Hold::Reader));
    });
    let outside = async move {
        assert_eq!(flow::current_hold(a), None);
        yield_now().await;
        assert_eq!(flow::current_hold(a), None);
    };
    block_on(async { join!(scoped, outside) });
    assert_eq!(flow::current_hold(a), None);
}

#[test]
fn scope_restores_after_panicking_poll() {
    let a = LockId::next();
    let mut scoped = Box::pin(
        Flow::empty()
            .with_hold(a, Hold::Exclusive)
            .scope(poll_fn(|_| -> Poll<()> { panic!("poll") })),
    );
    let res = panic::catch_unwind(AssertUnwindSafe(|| {
        block_on(poll_fn(|cx| scoped.as_mut().poll(cx)))
    }));
    assert!(res.is_err());
    assert_eq!(flow::current_hold(a), None);
}

#[test]
fn debug() {
    let a = LockId::next();
    let flow = Flow::empty().with_hold(a, Hold::Writer);
    let debug = format!("{flow:?}");
    assert!(debug.starts_with("Flow { holds: ["));
    assert!(debug.contains("Writer"));
}
