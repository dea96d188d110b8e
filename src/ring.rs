//! The ring scheduler and fiber lifecycle.
//!
//! A [`Ring`] is one independent scheduling domain: an ordered set of fibers
//! plus a sentinel slot at index 0 standing in for the thread that created
//! the ring. Exactly one slot holds control at any time. Control moves only
//! at explicit suspension points: [`yield_now`](Ring::yield_now) rotates to
//! the previous slot (cyclically, so the sentinel wraps to the most recently
//! created fiber), `switch_to` jumps to a specific fiber, and a fiber whose
//! body returns lands in the finish path which reschedules its predecessor.
//!
//! Everything here is single-threaded by construction: `Ring` and `Fiber`
//! are `!Send` and `!Sync`, so two OS threads can each drive their own ring
//! but can never share one.

use core::cell::{Cell, RefCell};
use core::fmt;
use std::io;
use std::rc::Rc;

use crate::arch;
use crate::stack::{self, FiberStack, StackPointer};

/// One fiber's identity and bookkeeping. Slot vectors and user-facing
/// [`Fiber`] handles share these through `Rc`, so a fiber's stack stays
/// mapped for as long as anything could still reach it.
struct FiberInner {
    /// Stack pointer at which execution resumes. For a fiber this is always
    /// set: first to the seeded pointer produced by `arch::init_stack`, then
    /// to whatever the last suspension saved. The sentinel starts out with
    /// `None` until it first switches away.
    resume_sp: Cell<Option<StackPointer>>,
    /// Backing stack mapping. `None` only for the sentinel, which runs on
    /// the thread's own stack.
    stack: Option<FiberStack>,
    finished: Cell<bool>,
    /// Whether a ring currently tracks this fiber in its slot vector.
    registered: Cell<bool>,
    /// Destructor for the seeded start payload, present until the fiber is
    /// first switched to. Needed so that a fiber which is unregistered and
    /// dropped before ever running does not leak its entry closure.
    initial_drop: Cell<Option<unsafe fn(*mut u8)>>,
}

impl Drop for FiberInner {
    fn drop(&mut self) {
        if let (Some(drop_fn), Some(sp)) = (self.initial_drop.get(), self.resume_sp.get()) {
            if self.stack.is_some() {
                unsafe { arch::drop_initial_obj(sp, drop_fn) };
            }
        }
    }
}

/// Shared scheduler state behind both [`Ring`] and [`Yielder`].
struct RingCore {
    /// Tracked fibers in insertion order, sentinel at index 0. A slot's
    /// position is not its identity: finish removal swaps the last slot into
    /// the vacated position, and lookups always go by `Rc` pointer identity.
    slots: RefCell<Vec<Rc<FiberInner>>>,
    /// Index of the slot currently holding control.
    current: Cell<usize>,
    /// Stack size for fibers spawned on this ring.
    stack_size: usize,
    /// Keeps the most recently finished fiber alive. The finish path runs on
    /// the finishing fiber's own stack, so that stack cannot be unmapped
    /// until control has moved on; it is released on the next finish or when
    /// the ring is dropped.
    retired: Cell<Option<Rc<FiberInner>>>,
}

/// A cooperative scheduling domain for stackful fibers.
///
/// Dropping a `Ring` panics if any spawned fiber is still registered: drive
/// the ring until every fiber has finished (or unregister the stragglers)
/// first.
///
/// # Example
///
/// ```
/// use spindle::Ring;
///
/// let ring = Ring::default();
/// let fiber = ring.spawn(|y| {
///     println!("step one");
///     y.yield_now();
///     println!("step two");
/// });
///
/// while !fiber.is_finished() {
///     ring.yield_now();
/// }
/// ```
pub struct Ring {
    core: Box<RingCore>,
}

/// Handle to one fiber. Cheap to clone; compares equal only to handles for
/// the same fiber.
#[derive(Clone)]
pub struct Fiber {
    inner: Rc<FiberInner>,
}

/// In-fiber view of the ring, passed by reference to every fiber body.
///
/// All scheduling operations available on [`Ring`] are mirrored here, plus
/// [`switch_to_main`](Yielder::switch_to_main) which suspends the fiber in
/// favor of the sentinel regardless of rotation order.
pub struct Yielder {
    core: *const RingCore,
}

/// Start payload seeded onto a fresh fiber stack: the entry closure plus a
/// way back to the scheduler.
struct StartPayload<F> {
    core: *const RingCore,
    func: F,
}

impl Ring {
    /// Creates a new ring containing only the sentinel.
    ///
    /// `stack_size` is the size in bytes of the stacks given to fibers
    /// spawned on this ring, rounded up to a page boundary with a floor of
    /// [`MIN_STACK_SIZE`](crate::stack::MIN_STACK_SIZE). A size of zero
    /// selects the platform default of 1024 pages.
    pub fn new(stack_size: usize) -> Self {
        let stack_size = if stack_size == 0 {
            stack::default_stack_size()
        } else {
            stack_size
        };
        let sentinel = Rc::new(FiberInner {
            resume_sp: Cell::new(None),
            stack: None,
            finished: Cell::new(false),
            registered: Cell::new(true),
            initial_drop: Cell::new(None),
        });
        Ring {
            core: Box::new(RingCore {
                slots: RefCell::new(vec![sentinel]),
                current: Cell::new(0),
                stack_size,
                retired: Cell::new(None),
            }),
        }
    }

    /// Stack size in bytes configured for fibers spawned on this ring.
    pub fn stack_size(&self) -> usize {
        self.core.stack_size
    }

    /// Creates a new fiber running `f`, appending it to the ring.
    ///
    /// The fiber does not start running: it is resumed for the first time by
    /// a later rotation or switch, and because it sits at the end of the
    /// ring it is the next fiber a `yield_now` from the sentinel reaches.
    ///
    /// # Panics
    ///
    /// Panics if the fiber's stack cannot be allocated; use
    /// [`try_spawn`](Ring::try_spawn) to handle that case.
    pub fn spawn<F>(&self, f: F) -> Fiber
    where
        F: FnOnce(&Yielder) + 'static,
    {
        self.try_spawn(f).expect("failed to allocate fiber stack")
    }

    /// Fallible variant of [`spawn`](Ring::spawn): surfaces stack allocation
    /// failure instead of panicking.
    pub fn try_spawn<F>(&self, f: F) -> io::Result<Fiber>
    where
        F: FnOnce(&Yielder) + 'static,
    {
        spawn_on(&self.core, f)
    }

    /// Suspends the active context and resumes the previous slot in the
    /// ring, treating it as a cycle: the sentinel wraps around to the most
    /// recently created fiber. With no fibers registered this is a no-op.
    pub fn yield_now(&self) {
        rotate(&self.core);
    }

    /// Suspends the active context and resumes `target` directly, bypassing
    /// rotation order.
    ///
    /// # Panics
    ///
    /// Panics if `target` is not registered in this ring, which includes
    /// fibers that already finished, fibers that were unregistered, and
    /// fibers belonging to a different ring.
    pub fn switch_to(&self, target: &Fiber) {
        switch_to_fiber(&self.core, target);
    }

    /// Removes `target` from the ring without touching its stack, so the
    /// scheduler can never resume it again. The fiber can afterwards be
    /// destroyed even if it never finished.
    ///
    /// # Panics
    ///
    /// Panics if `target` is the active fiber or is not registered in this
    /// ring.
    pub fn unregister(&self, target: &Fiber) {
        unregister(&self.core, target);
    }

    /// Returns a handle to the fiber currently holding control, or `None`
    /// when control is with the sentinel.
    pub fn current(&self) -> Option<Fiber> {
        current(&self.core)
    }
}

impl Default for Ring {
    fn default() -> Self {
        Ring::new(0)
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        // Control is necessarily with the sentinel here, so the retired
        // fiber's stack is no longer executing and can go.
        self.core.retired.take();
        let live = self.core.slots.borrow().len() - 1;
        if live != 0 && !std::thread::panicking() {
            panic!("ring dropped with {live} fiber(s) still registered");
        }
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("fibers", &(self.core.slots.borrow().len() - 1))
            .field("stack_size", &self.core.stack_size)
            .finish()
    }
}

impl Fiber {
    /// Whether this fiber's body has returned. A finished fiber is no longer
    /// registered anywhere and can never be resumed, but remains queryable
    /// until dropped.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    /// Releases the fiber's stack and metadata.
    ///
    /// Dropping the handle has the same effect; this method exists to make
    /// the contract checkable. An unregistered fiber that never finished may
    /// be destroyed: its stack is reclaimed but destructors for whatever it
    /// held at its last suspension point do not run.
    ///
    /// # Panics
    ///
    /// Panics if the fiber is still registered with a ring (which includes
    /// the active fiber).
    pub fn destroy(self) {
        assert!(
            !self.inner.registered.get(),
            "cannot destroy a fiber that is still registered with a ring"
        );
    }
}

impl PartialEq for Fiber {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Fiber {}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &Rc::as_ptr(&self.inner))
            .field("finished", &self.inner.finished.get())
            .finish()
    }
}

impl Yielder {
    /// See [`Ring::spawn`]. The new fiber joins the end of the ring, so it
    /// is the next fiber reached when the calling fiber yields.
    pub fn spawn<F>(&self, f: F) -> Fiber
    where
        F: FnOnce(&Yielder) + 'static,
    {
        self.try_spawn(f).expect("failed to allocate fiber stack")
    }

    /// See [`Ring::try_spawn`].
    pub fn try_spawn<F>(&self, f: F) -> io::Result<Fiber>
    where
        F: FnOnce(&Yielder) + 'static,
    {
        spawn_on(self.core(), f)
    }

    /// See [`Ring::yield_now`].
    pub fn yield_now(&self) {
        rotate(self.core());
    }

    /// See [`Ring::switch_to`].
    pub fn switch_to(&self, target: &Fiber) {
        switch_to_fiber(self.core(), target);
    }

    /// Suspends the calling fiber and resumes the sentinel directly,
    /// regardless of rotation order. Control returns here once something
    /// later yields or switches back to this fiber.
    pub fn switch_to_main(&self) {
        switch_to_index(self.core(), 0);
    }

    /// See [`Ring::unregister`].
    pub fn unregister(&self, target: &Fiber) {
        unregister(self.core(), target);
    }

    /// Returns a handle to the fiber currently holding control. Inside a
    /// fiber body this is the calling fiber itself.
    pub fn current(&self) -> Option<Fiber> {
        current(self.core())
    }

    fn core(&self) -> &RingCore {
        // The pointer was taken from the ring's boxed core at spawn time.
        // A fiber only ever runs while some ring operation on the same
        // thread is suspended inside a switch, and the ring refuses to drop
        // while fibers remain registered, so the core outlives every run of
        // this fiber's body.
        unsafe { &*self.core }
    }
}

/// Entry point for every fiber, running on the fiber's own stack. Reached
/// through the architecture's start trampoline on the first switch to the
/// seeded stack.
unsafe extern "C" fn fiber_entry<F: FnOnce(&Yielder)>(payload: *mut StartPayload<F>) -> ! {
    // Unwinding into the trampoline frame below us would be undefined
    // behavior. A panic that escapes the fiber body hits this guard while
    // unwinding and turns into a double panic, which aborts.
    let _abort_on_panic = scopeguard::guard((), |()| {
        panic!("fiber panicked; aborting");
    });

    let StartPayload { core, func } = payload.read();
    let core_ref = &*core;

    // The payload has been moved off the stack, so the seeded destructor
    // must not run anymore.
    core_ref.slots.borrow()[core_ref.current.get()]
        .initial_drop
        .set(None);

    let yielder = Yielder { core };
    func(&yielder);

    finish(core_ref)
}

/// Appends a fresh fiber to the ring behind `core`. The seeded stack is
/// valid as a switch target from the moment it enters the slot vector.
fn spawn_on<F>(core: &RingCore, f: F) -> io::Result<Fiber>
where
    F: FnOnce(&Yielder) + 'static,
{
    let stack = FiberStack::new(core.stack_size)?;
    let payload = StartPayload {
        core: core as *const RingCore,
        func: f,
    };
    let sp = unsafe { arch::init_stack(&stack, fiber_entry::<F>, payload) };
    let inner = Rc::new(FiberInner {
        resume_sp: Cell::new(Some(sp)),
        stack: Some(stack),
        finished: Cell::new(false),
        registered: Cell::new(true),
        initial_drop: Cell::new(Some(drop_payload::<F>)),
    });
    core.slots.borrow_mut().push(inner.clone());
    Ok(Fiber { inner })
}

/// Destructor thunk for a seeded, never-run start payload.
unsafe fn drop_payload<F>(ptr: *mut u8) {
    ptr.cast::<StartPayload<F>>().drop_in_place();
}

/// The finalization landing pad: a fiber body returned normally. Marks the
/// fiber finished, removes it from the ring and hands control to whatever
/// slot precedes the vacated position. Never returns.
fn finish(core: &RingCore) -> ! {
    let cur = core.current.get();
    assert!(cur != 0, "the main context cannot finish");

    let target_sp;
    {
        let mut slots = core.slots.borrow_mut();
        let inner = slots.swap_remove(cur);
        inner.finished.set(true);
        inner.registered.set(false);

        // We are still executing on the finished fiber's stack: park its Rc
        // so the mapping survives until control has moved on. This drops the
        // previous retiree, whose stack is guaranteed idle.
        core.retired.set(Some(inner));

        let next = cur - 1;
        core.current.set(next);
        target_sp = slots[next]
            .resume_sp
            .get()
            .expect("finish target has no saved context");
    }

    unsafe { arch::switch_and_reset(target_sp) }
}

/// Cyclic previous-index rotation: from slot i to i - 1, wrapping from the
/// sentinel to the highest slot. A newly spawned fiber sits at the end and
/// is therefore the first target when the sentinel yields.
fn rotate(core: &RingCore) {
    let cur = core.current.get();
    let next = if cur == 0 {
        core.slots.borrow().len() - 1
    } else {
        cur - 1
    };
    switch_to_index(core, next);
}

fn switch_to_fiber(core: &RingCore, target: &Fiber) {
    let idx = position(core, target)
        .expect("switch target is not registered in this ring");
    switch_to_index(core, idx);
}

/// Core transfer of control. Saves the active slot's resumption pointer and
/// resumes the slot at `next`. Switching a slot to itself is a no-op; this
/// also covers rotation in a ring that contains only the sentinel.
fn switch_to_index(core: &RingCore, next: usize) {
    let cur = core.current.get();
    if next == cur {
        return;
    }

    let (save_slot, target_sp) = {
        let slots = core.slots.borrow();
        // Cell<Option<NonZeroUsize>> has the same layout as usize with zero
        // standing in for None, so the switch can store the raw stack
        // pointer straight through it.
        let save_slot = slots[cur].resume_sp.as_ptr() as *mut usize;
        let target_sp = slots[next]
            .resume_sp
            .get()
            .expect("switch target has no saved context");
        (save_slot, target_sp)
    };

    core.current.set(next);
    // The slots borrow is released above: whatever runs next is free to
    // spawn, switch or unregister.
    unsafe { arch::switch_context(save_slot, target_sp) };
}

fn unregister(core: &RingCore, target: &Fiber) {
    let idx = position(core, target)
        .expect("unregister target is not registered in this ring");
    assert!(
        idx != core.current.get(),
        "cannot unregister the active fiber"
    );

    core.slots.borrow_mut().remove(idx);
    target.inner.registered.set(false);

    // Slots above the removed one shifted down by one; keep the cursor on
    // the slot it was addressing.
    let cur = core.current.get();
    if idx < cur {
        core.current.set(cur - 1);
    }
}

fn current(core: &RingCore) -> Option<Fiber> {
    let cur = core.current.get();
    if cur == 0 {
        None
    } else {
        Some(Fiber {
            inner: core.slots.borrow()[cur].clone(),
        })
    }
}

/// Identity lookup, linear over the slot vector. Rings are expected to stay
/// small; positions cannot be cached because removal reshuffles them.
fn position(core: &RingCore, fiber: &Fiber) -> Option<usize> {
    core.slots
        .borrow()
        .iter()
        .position(|slot| Rc::ptr_eq(slot, &fiber.inner))
}
