//! Cooperative stackful fibers with a ring-rotation scheduler.
//!
//! ## Overview
//!
//! This crate lets a program create many independently-stacked execution
//! contexts (fibers) on a single OS thread and hand control between them
//! voluntarily, with no OS thread involvement. A [`Ring`] owns the fibers of
//! one scheduling domain together with a sentinel slot representing the
//! thread that created it. Control moves only when the active context asks:
//! [`Ring::yield_now`] rotates to the previous slot in the ring (the
//! sentinel wraps to the most recently created fiber, so new fibers run
//! first), [`Ring::switch_to`] jumps straight to a chosen fiber, and from
//! inside a fiber the same operations are available on the [`Yielder`]
//! passed to its body, plus [`Yielder::switch_to_main`] to hop back to the
//! sentinel out of turn.
//!
//! A fiber whose body returns is marked finished, dropped out of the
//! rotation automatically, and its predecessor in the ring is resumed.
//! Fibers that should never run again can be detached early with
//! [`Ring::unregister`].
//!
//! ## Example
//!
//! ```rust
//! use spindle::Ring;
//!
//! let ring = Ring::default();
//!
//! let a = ring.spawn(|y| {
//!     println!("[a] first step");
//!     y.yield_now();
//!     println!("[a] second step");
//! });
//! let b = ring.spawn(|y| {
//!     println!("[b] first step");
//!     y.yield_now();
//!     println!("[b] second step");
//! });
//!
//! // b was created last, so it runs first.
//! while !a.is_finished() || !b.is_finished() {
//!     ring.yield_now();
//! }
//! ```
//!
//! ## Supported targets
//!
//! x86_64 and AArch64, on unix-like systems (ELF and Mach-O). Windows is not
//! supported.
//!
//! ## Caveats
//!
//! Scheduling is strictly cooperative: a fiber that neither suspends nor
//! returns stalls its whole ring forever. Fiber stacks are plain memory
//! mappings without guard pages, so overflowing one is undefined behavior.
//! A panic that escapes a fiber body aborts the process.

#![warn(missing_docs)]

#[cfg(not(unix))]
compile_error!("spindle requires a unix-like target");

mod arch;
mod ring;
pub mod stack;

pub use ring::*;

#[cfg(test)]
mod tests;
