//! Two fibers passing control back and forth with targeted switches,
//! falling back to rotation once the partner is gone.

use std::cell::RefCell;
use std::rc::Rc;

use spindle::{Fiber, Ring, Yielder};

fn ping_pong(y: &Yielder, label: &str, turns: u32, partner: &RefCell<Option<Fiber>>) {
    for turn in 1..=turns {
        println!("[{label} | {:?}] turn {turn}", y.current());

        let partner = partner.borrow().clone();
        match partner {
            Some(ref other) if !other.is_finished() => y.switch_to(other),
            _ => y.yield_now(),
        }
    }
}

fn main() {
    let ring = Ring::new(16384);

    let pong_slot: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));
    let ping_slot: Rc<RefCell<Option<Fiber>>> = Rc::new(RefCell::new(None));

    let partner = pong_slot.clone();
    let ping = ring.spawn(move |y| ping_pong(y, "ping", 5, &partner));
    let partner = ping_slot.clone();
    let pong = ring.spawn(move |y| ping_pong(y, "pong", 5, &partner));

    *pong_slot.borrow_mut() = Some(pong.clone());
    *ping_slot.borrow_mut() = Some(ping.clone());

    ring.switch_to(&ping);
    while !ping.is_finished() || !pong.is_finished() {
        ring.yield_now();
    }

    ping.destroy();
    pong.destroy();
}
