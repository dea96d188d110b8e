//! Smallest possible tour: one fiber interleaved with the main thread.

use spindle::Ring;

fn main() {
    let ring = Ring::default();

    let fiber = ring.spawn(|y| {
        println!("Oh hi Marc!");
        y.yield_now();
        println!("Welcome Marc, to the fiber world!");
    });

    ring.yield_now();
    println!("Should be back in main now.");

    ring.yield_now();
    println!("Back in main again.");

    assert!(fiber.is_finished());
    fiber.destroy();
}
