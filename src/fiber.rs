//! # Fibers
//!
//! A fiber is one run of an effect description on a [`Runtime`].
//!
//! ## Design
//!
//! Fibers are not threads. Each fiber owns a driver whose steps are
//! dispatched onto the runtime's event loop; a fiber parked on an async
//! operation costs nothing but its stored continuation stack.
//!
//! - [`FiberHandle`] is the untyped control surface: identity, state and
//!   interruption.
//! - [`Fiber`] adds the typed exit: `join`, `await_exit` and exit callbacks.
//!
//! Forking never copies interrupt masks into the child; every fiber starts
//! interruptible.

use std::convert::Infallible;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::Canceler;
use crate::driver::Driver;
use crate::exit::Exit;
use crate::io::{Callback, IO, UIO};
use crate::scheduler::Runtime;

/// Unique identifier for a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId(pub u64);

impl FiberId {
    /// Create a new fiber ID.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fiber({})", self.0)
    }
}

/// Global fiber ID counter.
static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a new unique fiber ID.
pub fn next_fiber_id() -> FiberId {
    FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
}

/// Fiber execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FiberState {
    /// Created, first step not yet run.
    #[default]
    Runnable,
    /// The event loop is running its steps.
    Running,
    /// Parked on an async operation.
    Suspended,
    /// Exited with a value.
    Completed,
    /// Exited with a failure or defect.
    Failed,
    /// Exited by interruption.
    Cancelled,
}

impl FiberState {
    /// Check if the fiber has exited.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FiberState::Completed | FiberState::Failed | FiberState::Cancelled
        )
    }
}

// ============================================================================
// FiberHandle
// ============================================================================

/// Untyped control handle for a running fiber.
#[derive(Clone)]
pub struct FiberHandle {
    driver: Arc<Driver>,
}

impl FiberHandle {
    pub(crate) fn new(driver: Arc<Driver>) -> Self {
        Self { driver }
    }

    /// The fiber's ID.
    pub fn id(&self) -> FiberId {
        self.driver.id()
    }

    /// Current execution state.
    pub fn state(&self) -> FiberState {
        self.driver.state()
    }

    /// Check if the fiber has exited.
    pub fn is_done(&self) -> bool {
        self.driver.is_done()
    }

    /// Request interruption. Idempotent, returns immediately.
    pub fn interrupt(&self) {
        self.driver.interrupt();
    }
}

impl fmt::Debug for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiberHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// A prepared fiber whose first step has not been dispatched.
pub(crate) struct Unstarted {
    handle: FiberHandle,
}

impl Unstarted {
    pub(crate) fn new(handle: FiberHandle) -> Self {
        Self { handle }
    }

    pub(crate) fn handle(&self) -> &FiberHandle {
        &self.handle
    }

    pub(crate) fn start(self) -> FiberHandle {
        self.handle.driver.start();
        self.handle
    }
}

// ============================================================================
// Fiber
// ============================================================================

type ExitWaiter<E, A> = Box<dyn FnOnce(&Exit<E, A>) + Send>;

enum SlotState<E, A> {
    Pending {
        waiters: Vec<(u64, ExitWaiter<E, A>)>,
        next_waiter: u64,
    },
    Done(Arc<Exit<E, A>>),
}

/// Write-once holder for a fiber's exit.
struct ExitSlot<E, A> {
    state: Mutex<SlotState<E, A>>,
}

impl<E, A> ExitSlot<E, A> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending {
                waiters: Vec::new(),
                next_waiter: 0,
            }),
        }
    }

    fn complete(&self, exit: Exit<E, A>) {
        let exit = Arc::new(exit);
        let waiters = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, SlotState::Done(exit.clone())) {
                SlotState::Pending { waiters, .. } => waiters,
                done @ SlotState::Done(_) => {
                    *state = done;
                    return;
                }
            }
        };
        for (_, waiter) in waiters {
            waiter(&exit);
        }
    }

    /// Run `waiter` on the exit. Returns its key while it is still parked.
    fn on_exit(&self, waiter: ExitWaiter<E, A>) -> Option<u64> {
        let exit = {
            let mut state = self.state.lock();
            match &mut *state {
                SlotState::Pending {
                    waiters,
                    next_waiter,
                } => {
                    let id = *next_waiter;
                    *next_waiter += 1;
                    waiters.push((id, waiter));
                    return Some(id);
                }
                SlotState::Done(exit) => exit.clone(),
            }
        };
        waiter(&exit);
        None
    }

    /// Drop a parked waiter.
    fn remove(&self, id: u64) {
        let removed = match &mut *self.state.lock() {
            SlotState::Pending { waiters, .. } => waiters
                .iter()
                .position(|(waiter, _)| *waiter == id)
                .map(|index| waiters.swap_remove(index)),
            SlotState::Done(_) => None,
        };
        // The waiter owns a resumption handle; drop it outside the lock.
        drop(removed);
    }

    #[cfg(test)]
    fn parked(&self) -> usize {
        match &*self.state.lock() {
            SlotState::Pending { waiters, .. } => waiters.len(),
            SlotState::Done(_) => 0,
        }
    }

    fn exit(&self) -> Option<Arc<Exit<E, A>>> {
        match &*self.state.lock() {
            SlotState::Pending { .. } => None,
            SlotState::Done(exit) => Some(exit.clone()),
        }
    }
}

/// A running fiber with a typed exit.
pub struct Fiber<E, A> {
    handle: FiberHandle,
    slot: Arc<ExitSlot<E, A>>,
}

impl<E, A> Clone for Fiber<E, A> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            slot: self.slot.clone(),
        }
    }
}

impl<E, A> fmt::Debug for Fiber<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber").field("handle", &self.handle).finish()
    }
}

impl<E, A> Fiber<E, A>
where
    E: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    /// The fiber's ID.
    pub fn id(&self) -> FiberId {
        self.handle.id()
    }

    /// The untyped control handle.
    pub fn handle(&self) -> &FiberHandle {
        &self.handle
    }

    /// Check if the fiber has exited.
    pub fn is_done(&self) -> bool {
        self.slot.exit().is_some()
    }

    /// The exit, if the fiber has finished.
    pub fn poll_exit(&self) -> Option<Arc<Exit<E, A>>> {
        self.slot.exit()
    }

    /// Register a callback for the exit. Runs immediately if already exited.
    pub fn on_exit<F>(&self, f: F)
    where
        F: FnOnce(&Exit<E, A>) + Send + 'static,
    {
        let _ = self.slot.on_exit(Box::new(f));
    }

    /// Request interruption of this fiber. Does not wait for it to exit.
    pub fn interrupt(&self) -> UIO<()> {
        let handle = self.handle.clone();
        IO::sync(move || handle.interrupt())
    }

    /// Wait for the exit without failing.
    ///
    /// An interrupted waiter is unregistered, so it does not keep the
    /// waiting fiber alive until this one exits.
    pub fn await_exit(&self) -> UIO<Exit<E, A>>
    where
        E: Clone,
        A: Clone,
    {
        let slot = self.slot.clone();
        IO::async_(move |callback: Callback<Infallible, Exit<E, A>>| {
            match slot.on_exit(Box::new(move |exit| callback.succeed(exit.clone()))) {
                Some(id) => {
                    let slot = slot.clone();
                    Canceler::new(move || slot.remove(id))
                }
                None => Canceler::none(),
            }
        })
    }

    /// Wait for the fiber and adopt its exit.
    pub fn join(&self) -> IO<E, A>
    where
        E: Clone,
        A: Clone,
    {
        self.await_exit().widen::<E>().chain(IO::exit_once)
    }
}

impl Runtime {
    /// Start `io` on a new fiber and return its typed handle.
    pub fn fork<E, A>(&self, io: &IO<E, A>) -> Fiber<E, A>
    where
        E: Send + Sync + 'static,
        A: Send + Sync + 'static,
    {
        let slot = Arc::new(ExitSlot::new());
        let sink = slot.clone();
        let handle = self.prepare(io, move |exit| sink.complete(exit)).start();
        Fiber { handle, slot }
    }
}

impl<E, A> IO<E, A>
where
    E: Send + Sync + 'static,
    A: Send + Sync + 'static,
{
    /// Start this effect on a new fiber of the current runtime.
    ///
    /// The child begins interruptible regardless of the parent's masks.
    pub fn fork(self) -> UIO<Fiber<E, A>> {
        let step = self.step;
        IO::<Infallible, Runtime>::runtime().chain(move |runtime| {
            let child = IO::<E, A>::from_arc(step.clone());
            IO::sync(move || runtime.fork(&child))
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new().expect("runtime")
    }

    #[test]
    fn test_fiber_id_unique() {
        let a = next_fiber_id();
        let b = next_fiber_id();
        assert_ne!(a, b);
        assert_eq!(format!("{}", FiberId::new(3)), "Fiber(3)");
    }

    #[test]
    fn test_fiber_state_terminal() {
        assert!(!FiberState::Runnable.is_terminal());
        assert!(!FiberState::Suspended.is_terminal());
        assert!(FiberState::Completed.is_terminal());
        assert!(FiberState::Cancelled.is_terminal());
    }

    #[test]
    fn test_fork_join() {
        let rt = runtime();
        let io: IO<String, i32> = IO::succeed(20)
            .fork()
            .widen()
            .chain(|fiber: Fiber<String, i32>| fiber.join())
            .map(|n| n + 1);
        assert_eq!(rt.block_on(&io), Exit::Value(21));
    }

    #[test]
    fn test_join_adopts_failure() {
        let rt = runtime();
        let child: IO<String, i32> = IO::fail("child failed".into());
        let io = child.fork().widen().chain(|fiber| fiber.join());
        assert_eq!(rt.block_on(&io), Exit::failed("child failed".to_string()));
    }

    #[test]
    fn test_interrupt_forked_fiber() {
        let rt = runtime();
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = cleaned.clone();
        let child: UIO<()> = IO::never().on_interrupted(IO::sync(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let io = child.fork().chain(|fiber| {
            IO::sleep(Duration::from_millis(5))
                .apply_second(fiber.interrupt())
                .apply_second(fiber.await_exit())
        });
        let exit = rt.block_on(&io);
        assert_eq!(exit, Exit::Value(Exit::interrupted()));
        assert_eq!(cleaned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interrupted_join_unregisters_waiter() {
        let rt = runtime();
        let target = rt.fork(&IO::<Infallible, ()>::never());
        for _ in 0..3 {
            let (tx, rx) = crossbeam_channel::bounded(1);
            let joiner = rt.run_callback(&target.join(), move |exit| {
                let _ = tx.send(exit);
            });
            while target.slot.parked() != 1 {
                std::thread::yield_now();
            }
            joiner.interrupt();
            assert!(rx.recv_timeout(Duration::from_secs(5)).expect("exit").is_interrupted());
            assert_eq!(target.slot.parked(), 0);
        }
        target.handle().interrupt();
    }

    #[test]
    fn test_on_exit_after_done_runs_immediately() {
        let rt = runtime();
        let fiber = rt.fork(&IO::<Infallible, i32>::succeed(4));
        let done = rt.block_on(&fiber.await_exit());
        assert_eq!(done, Exit::Value(Exit::Value(4)));
        assert!(fiber.is_done());
        assert_eq!(fiber.handle().state(), FiberState::Completed);

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        fiber.on_exit(move |exit| *s.lock() = exit.value().copied());
        assert_eq!(*seen.lock(), Some(4));
    }

    #[test]
    fn test_child_starts_interruptible() {
        let rt = runtime();
        let child: UIO<()> = IO::never();
        let io = child
            .fork()
            .uninterruptible()
            .chain(|fiber| {
                IO::sleep(Duration::from_millis(5))
                    .apply_second(fiber.interrupt())
                    .apply_second(fiber.await_exit())
            });
        assert_eq!(rt.block_on(&io), Exit::Value(Exit::interrupted()));
    }

    #[test]
    fn test_interrupt_masked_fiber_completes_region() {
        let rt = runtime();
        let finished = Arc::new(AtomicUsize::new(0));
        let f = finished.clone();
        let child: UIO<()> = IO::sleep(Duration::from_millis(20))
            .apply_second(IO::sync(move || {
                f.fetch_add(1, Ordering::SeqCst);
            }))
            .uninterruptible();
        let io = child.fork().chain(|fiber| {
            IO::sleep(Duration::from_millis(2))
                .apply_second(fiber.interrupt())
                .apply_second(fiber.await_exit())
        });
        let exit = rt.block_on(&io);
        // The region ran to the end; no interruptible step follows it.
        assert_eq!(exit, Exit::Value(Exit::Value(())));
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }
}
