use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use crate::Ring;

#[test]
fn smoke() {
    let hit = Rc::new(Cell::new(false));
    let hit2 = hit.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |_| {
        hit2.set(true);
    });
    assert!(!hit.get());
    assert!(!fiber.is_finished());
    ring.yield_now();
    assert!(hit.get());
    assert!(fiber.is_finished());
    fiber.destroy();
}

#[test]
fn suspend_and_resume() {
    let steps = Rc::new(Cell::new(0));
    let steps2 = steps.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |y| {
        steps2.set(1);
        y.yield_now();
        steps2.set(2);
        y.yield_now();
        steps2.set(3);
    });
    ring.yield_now();
    assert_eq!(steps.get(), 1);
    assert!(!fiber.is_finished());
    ring.yield_now();
    assert_eq!(steps.get(), 2);
    assert!(!fiber.is_finished());
    ring.yield_now();
    assert_eq!(steps.get(), 3);
    assert!(fiber.is_finished());
}

// Port of the reference test_yield_order scenario: two 2-step fibers driven
// by the sentinel. The newest fiber takes the first step, and each fiber
// logs exactly as many steps as its body performs.
#[test]
fn rotation_is_last_created_first_resumed() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let ring = Ring::default();

    let mut fibers = Vec::new();
    for id in [1, 2] {
        let log = log.clone();
        fibers.push(ring.spawn(move |y| {
            for _ in 0..2 {
                log.borrow_mut().push(id);
                y.yield_now();
            }
        }));
    }

    while fibers.iter().any(|f| !f.is_finished()) {
        ring.yield_now();
        log.borrow_mut().push(0);
    }

    let log = log.borrow();
    let first_fiber_entry = log.iter().copied().find(|&id| id != 0);
    assert_eq!(first_fiber_entry, Some(2), "newest fiber must run first");
    assert_eq!(log.iter().filter(|&&id| id == 1).count(), 2);
    assert_eq!(log.iter().filter(|&&id| id == 2).count(), 2);
}

// Port of the reference test_core switch_direct scenario.
#[test]
fn switch_runs_target_to_completion() {
    let called = Rc::new(Cell::new(0));
    let called2 = called.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |_| {
        called2.set(called2.get() + 1);
    });

    ring.switch_to(&fiber);

    assert_eq!(called.get(), 1);
    assert!(fiber.is_finished());
    fiber.destroy();
}

#[test]
fn switch_bypasses_rotation_order() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let ring = Ring::default();

    let mut fibers = Vec::new();
    for id in [1, 2, 3] {
        let log = log.clone();
        fibers.push(ring.spawn(move |y| {
            log.borrow_mut().push(id);
            y.yield_now();
        }));
    }

    // Rotation alone would start with fiber 3; switch to fiber 1 instead.
    ring.switch_to(&fibers[0]);
    assert_eq!(*log.borrow(), [1]);

    while fibers.iter().any(|f| !f.is_finished()) {
        ring.yield_now();
    }
    assert_eq!(*log.borrow(), [1, 3, 2]);
}

// Port of the reference test_switch_to_main scenario: a fiber hops straight
// back to the sentinel before finishing, and resumes on a later yield.
#[test]
fn switch_to_main_suspends_before_finish() {
    let before = Rc::new(Cell::new(0));
    let after = Rc::new(Cell::new(0));
    let (before2, after2) = (before.clone(), after.clone());
    let ring = Ring::default();
    let fiber = ring.spawn(move |y| {
        before2.set(before2.get() + 1);
        y.switch_to_main();
        after2.set(after2.get() + 1);
    });

    ring.switch_to(&fiber);
    assert_eq!(before.get(), 1);
    assert_eq!(after.get(), 0);
    assert!(!fiber.is_finished());

    ring.yield_now();
    assert_eq!(after.get(), 1);
    assert!(fiber.is_finished());
    fiber.destroy();
}

#[test]
fn ping_pong_between_fibers() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let ring = Ring::default();

    let ping_partner: Rc<RefCell<Option<crate::Fiber>>> = Rc::new(RefCell::new(None));
    let partner = ping_partner.clone();
    let log2 = log.clone();
    let ping = ring.spawn(move |y| {
        for i in 0..3 {
            log2.borrow_mut().push(("ping", i));
            let partner = partner.borrow().clone();
            match partner {
                Some(ref pong) if !pong.is_finished() => y.switch_to(pong),
                _ => y.yield_now(),
            }
        }
    });
    let log3 = log.clone();
    let ping2 = ping.clone();
    let pong = ring.spawn(move |y| {
        for i in 0..3 {
            log3.borrow_mut().push(("pong", i));
            if !ping2.is_finished() {
                y.switch_to(&ping2);
            } else {
                y.yield_now();
            }
        }
    });
    *ping_partner.borrow_mut() = Some(pong.clone());

    ring.switch_to(&ping);
    while !ping.is_finished() || !pong.is_finished() {
        ring.yield_now();
    }

    assert_eq!(
        *log.borrow(),
        [
            ("ping", 0),
            ("pong", 0),
            ("ping", 1),
            ("pong", 1),
            ("ping", 2),
            ("pong", 2),
        ]
    );
}

#[test]
fn yield_with_no_fibers_is_noop() {
    let ring = Ring::default();
    ring.yield_now();
    ring.yield_now();
}

#[test]
fn switch_to_self_is_noop() {
    let resumed = Rc::new(Cell::new(false));
    let resumed2 = resumed.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |y| {
        // The active fiber is its own switch target: control must not move.
        let me = y.current().unwrap();
        y.switch_to(&me);
        resumed2.set(true);
    });
    ring.yield_now();
    assert!(resumed.get());
    assert!(fiber.is_finished());
}

#[test]
fn current_identity() {
    let ring = Ring::default();
    assert!(ring.current().is_none());

    let seen = Rc::new(RefCell::new(None));
    let seen2 = seen.clone();
    let fiber = ring.spawn(move |y| {
        *seen2.borrow_mut() = y.current();
    });
    ring.yield_now();
    assert_eq!(seen.borrow().as_ref(), Some(&fiber));
    assert!(ring.current().is_none());
}

#[test]
fn unregistered_fiber_is_never_resumed() {
    let steps = Rc::new(Cell::new(0));
    let steps2 = steps.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |y| {
        steps2.set(steps2.get() + 1);
        y.yield_now();
        steps2.set(steps2.get() + 1);
    });

    ring.yield_now();
    assert_eq!(steps.get(), 1);

    ring.unregister(&fiber);
    for _ in 0..4 {
        ring.yield_now();
    }
    assert_eq!(steps.get(), 1);
    assert!(!fiber.is_finished());

    // Abandoned mid-execution, but unregistered: destruction is allowed.
    fiber.destroy();
}

#[test]
fn unregister_preserves_cursor_rotation() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let ring = Ring::default();

    let mut fibers = Vec::new();
    for id in [1, 2, 3] {
        let log = log.clone();
        fibers.push(ring.spawn(move |y| {
            for _ in 0..2 {
                log.borrow_mut().push(id);
                y.yield_now();
            }
        }));
    }

    // One step of everything: 3, 2, 1.
    ring.yield_now();
    // Remove fiber 2 from the rotation before its second step.
    ring.unregister(&fibers[1]);
    while fibers[0].is_finished() == false || fibers[2].is_finished() == false {
        ring.yield_now();
    }

    assert_eq!(*log.borrow(), [3, 2, 1, 3, 1]);
    fibers.remove(1).destroy();
}

#[test]
fn spawn_from_inside_a_fiber() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let ring = Ring::default();

    let log2 = log.clone();
    let outer = ring.spawn(move |y| {
        log2.borrow_mut().push("outer");
        let log3 = log2.clone();
        let inner = y.spawn(move |_| {
            log3.borrow_mut().push("inner");
        });
        // Yielding rotates down to the sentinel; the drive loop then wraps
        // to the new fiber, whose finish resumes us.
        y.yield_now();
        log2.borrow_mut().push("outer again");
        assert!(inner.is_finished());
    });

    while !outer.is_finished() {
        ring.yield_now();
    }

    assert_eq!(*log.borrow(), ["outer", "inner", "outer again"]);
}

#[test]
fn finished_fiber_is_removed_and_destroyable() {
    let ring = Ring::default();
    let fiber = ring.spawn(|_| {});
    ring.yield_now();
    assert!(fiber.is_finished());
    // A finished fiber is no longer a valid switch target.
    let clone = fiber.clone();
    let err = catch_unwind(AssertUnwindSafe(|| ring.switch_to(&clone)));
    assert!(err.is_err());
    fiber.destroy();
    clone.destroy();
}

#[test]
fn destroy_registered_fiber_panics() {
    let ring = Ring::default();
    let fiber = ring.spawn(|y| y.yield_now());
    let clone = fiber.clone();
    let err = catch_unwind(AssertUnwindSafe(move || clone.destroy()));
    assert!(err.is_err(), "destroying a registered fiber must be fatal");

    // Clean up: run it to completion.
    while !fiber.is_finished() {
        ring.yield_now();
    }
}

#[test]
fn drop_ring_with_live_fibers_panics() {
    let ring = Ring::default();
    let fiber = ring.spawn(|_| {});
    let err = catch_unwind(AssertUnwindSafe(move || drop(ring)));
    assert!(err.is_err(), "dropping a ring with live fibers must be fatal");
    drop(fiber);
}

#[test]
fn unregister_active_fiber_panics() {
    let ring = Ring::default();
    let observed = Rc::new(Cell::new(false));
    let observed2 = observed.clone();
    let fiber = ring.spawn(move |y| {
        let me = y.current().unwrap();
        let err = catch_unwind(AssertUnwindSafe(|| y.unregister(&me)));
        observed2.set(err.is_err());
    });
    ring.yield_now();
    assert!(observed.get());
    assert!(fiber.is_finished());
}

#[test]
fn switch_to_foreign_fiber_panics() {
    let ring_a = Ring::default();
    let ring_b = Ring::default();
    let fiber_b = ring_b.spawn(|_| {});
    let err = catch_unwind(AssertUnwindSafe(|| ring_a.switch_to(&fiber_b)));
    assert!(err.is_err());
    ring_b.yield_now();
    assert!(fiber_b.is_finished());
}

// Port of the reference test_multi_stack scenario: two rings driven
// independently from the same thread.
#[test]
fn independent_rings() {
    let ring1 = Ring::new(65536);
    let ring2 = Ring::default();

    let c1 = Rc::new(Cell::new(0));
    let c2 = Rc::new(Cell::new(0));
    let (c1b, c2b) = (c1.clone(), c2.clone());

    let f1 = ring1.spawn(move |y| {
        c1b.set(c1b.get() + 1);
        y.yield_now();
        c1b.set(c1b.get() + 1);
    });
    let f2 = ring2.spawn(move |y| {
        c2b.set(c2b.get() + 1);
        y.yield_now();
        c2b.set(c2b.get() + 1);
    });

    while !f1.is_finished() {
        ring1.yield_now();
    }
    while !f2.is_finished() {
        ring2.yield_now();
    }

    assert_eq!(c1.get(), 2);
    assert_eq!(c2.get(), 2);
}

#[test]
fn never_started_fiber_drops_its_closure() {
    let payload = Rc::new(());
    let ring = Ring::default();
    let fiber = ring.spawn({
        let payload = payload.clone();
        move |_| {
            let _keep = &payload;
        }
    });
    assert_eq!(Rc::strong_count(&payload), 2);

    ring.unregister(&fiber);
    fiber.destroy();
    assert_eq!(
        Rc::strong_count(&payload),
        1,
        "seeded start payload must be dropped with the fiber"
    );
    drop(ring);
}

#[test]
fn deep_call_stacks_survive_switches() {
    fn recurse(y: &crate::Yielder, depth: usize) -> usize {
        if depth == 0 {
            y.yield_now();
            return 1;
        }
        // Some stack-resident state on every level.
        let marker = [depth; 8];
        let below = recurse(y, depth - 1);
        assert_eq!(marker, [depth; 8]);
        below + 1
    }

    let levels = Rc::new(Cell::new(0));
    let levels2 = levels.clone();
    let ring = Ring::default();
    let fiber = ring.spawn(move |y| {
        levels2.set(recurse(y, 100));
    });

    while !fiber.is_finished() {
        ring.yield_now();
    }
    assert_eq!(levels.get(), 101);
}

#[test]
fn many_fibers() {
    let counter = Rc::new(Cell::new(0));
    let ring = Ring::new(crate::stack::MIN_STACK_SIZE * 4);

    let mut fibers = Vec::new();
    for _ in 0..50 {
        let counter = counter.clone();
        fibers.push(ring.spawn(move |y| {
            y.yield_now();
            counter.set(counter.get() + 1);
        }));
    }

    while fibers.iter().any(|f| !f.is_finished()) {
        ring.yield_now();
    }
    assert_eq!(counter.get(), 50);
}
