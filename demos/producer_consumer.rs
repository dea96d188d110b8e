//! Bounded-buffer handoff between a producer fiber and a consumer fiber,
//! driven purely by rotation.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use spindle::{Ring, Yielder};

const BUFFER_CAP: usize = 4;
const ITEMS: u32 = 12;

#[derive(Default)]
struct Channel {
    buffer: VecDeque<u32>,
    producer_done: bool,
}

fn producer(y: &Yielder, chan: &RefCell<Channel>) {
    for value in 1..=ITEMS {
        while chan.borrow().buffer.len() == BUFFER_CAP {
            y.yield_now();
        }

        let count = {
            let mut chan = chan.borrow_mut();
            chan.buffer.push_back(value);
            chan.buffer.len()
        };
        println!("[producer | {:?}] produced {value} (count={count})", y.current());

        y.yield_now();
    }

    chan.borrow_mut().producer_done = true;
    y.yield_now();
}

fn consumer(y: &Yielder, chan: &RefCell<Channel>) {
    loop {
        let value = {
            let mut chan = chan.borrow_mut();
            match chan.buffer.pop_front() {
                Some(value) => value,
                None if chan.producer_done => break,
                None => {
                    drop(chan);
                    y.yield_now();
                    continue;
                }
            }
        };
        println!(
            "[consumer | {:?}] consumed {value} (count={})",
            y.current(),
            chan.borrow().buffer.len()
        );

        y.yield_now();
    }
}

fn main() {
    let ring = Ring::new(16384);
    let chan = Rc::new(RefCell::new(Channel::default()));

    let chan2 = chan.clone();
    let producer_fiber = ring.spawn(move |y| producer(y, &chan2));
    let chan2 = chan.clone();
    let consumer_fiber = ring.spawn(move |y| consumer(y, &chan2));

    while !producer_fiber.is_finished() || !consumer_fiber.is_finished() {
        ring.yield_now();
    }

    producer_fiber.destroy();
    consumer_fiber.destroy();
}
