//! # Semaphore
//!
//! A counting admission primitive with strictly FIFO waiters.
//!
//! ## Design
//!
//! The permit count and the waiter queue live in one [`Ref`]. A request that
//! finds a free permit and an empty queue takes it; any other request joins
//! the tail of the queue as a fresh [`Deferred`] latch, so a newcomer never
//! overtakes a fiber that is already waiting.
//!
//! `release` hands the permit straight to the head waiter when there is one,
//! leaving the count unchanged; otherwise it increments the count. The latch
//! is completed inside the same critical section that dequeues it.
//!
//! Acquisition goes through a [`Ticket`]. If the acquiring fiber is
//! interrupted while parked, the ticket's cleanup either removes its latch
//! from the queue or, when a release already granted the latch, gives that
//! permit back. A permit granted on the spot is released again if the
//! interrupt lands before the acquirer sees it. No permit is lost.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;

use crate::deferred::Deferred;
use crate::exit::Exit;
use crate::io::{IO, UIO};
use crate::ref_cell::Ref;
use crate::ticket::Ticket;

type Latch = Deferred<Infallible, ()>;

struct SemaphoreState {
    permits: usize,
    waiters: VecDeque<Latch>,
}

impl SemaphoreState {
    /// Pass one permit to the head waiter, or bank it.
    fn release_one(&mut self) {
        while let Some(next) = self.waiters.pop_front() {
            if next.complete_now(Exit::Value(())) {
                return;
            }
        }
        self.permits += 1;
    }
}

/// FIFO counting semaphore.
#[derive(Clone)]
pub struct Semaphore {
    state: Ref<SemaphoreState>,
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (permits, waiting) = self.snapshot();
        f.debug_struct("Semaphore")
            .field("id", &self.state.id())
            .field("permits", &permits)
            .field("waiting", &waiting)
            .finish()
    }
}

impl Semaphore {
    /// Create a semaphore with `permits` free permits.
    pub fn new(permits: usize) -> Self {
        Self {
            state: Ref::new(SemaphoreState {
                permits,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Allocate a fresh semaphore each time the effect runs.
    pub fn make(permits: usize) -> UIO<Semaphore> {
        IO::sync(move || Semaphore::new(permits))
    }

    /// Take one permit, waiting in FIFO order if none is free.
    ///
    /// Waiting is interruptible; an interrupted acquire holds no permit.
    pub fn acquire(&self) -> UIO<()> {
        let this = self.clone();
        Ticket::redeem(IO::sync(move || this.ticket()))
    }

    /// Take a permit only if one is free right now.
    pub fn try_acquire(&self) -> UIO<bool> {
        let state = self.state.clone();
        IO::sync(move || {
            state.modify_now(|s| {
                if s.permits > 0 && s.waiters.is_empty() {
                    s.permits -= 1;
                    true
                } else {
                    false
                }
            })
        })
    }

    /// Return one permit.
    pub fn release(&self) -> UIO<()> {
        let state = self.state.clone();
        IO::sync(move || state.modify_now(SemaphoreState::release_one)).uninterruptible()
    }

    /// Run `io` while holding a permit. The permit is returned on every exit.
    ///
    /// Waiting for the permit stays interruptible. Between the grant and the
    /// guard there are only frames and no interruptible step, so a granted
    /// permit is always released.
    pub fn with_permit<E, A>(&self, io: IO<E, A>) -> IO<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let release = self.release().widen::<E>();
        let guarded = IO::<E, ()>::unit_value().bracket(move |_| release.clone(), move |_| io.clone());
        self.acquire().widen::<E>().apply_second(guarded)
    }

    /// Number of free permits.
    pub fn available(&self) -> UIO<usize> {
        let this = self.clone();
        IO::sync(move || this.snapshot().0)
    }

    /// Number of fibers waiting for a permit.
    pub fn waiting(&self) -> UIO<usize> {
        let this = self.clone();
        IO::sync(move || this.snapshot().1)
    }

    fn snapshot(&self) -> (usize, usize) {
        self.state.modify_now(|s| (s.permits, s.waiters.len()))
    }

    fn ticket(&self) -> Ticket<()> {
        let latch = self.state.modify_now(|s| {
            if s.permits > 0 && s.waiters.is_empty() {
                s.permits -= 1;
                None
            } else {
                let latch = Latch::new();
                s.waiters.push_back(latch.clone());
                Some(latch)
            }
        });
        match latch {
            None => Ticket::granted((), self.release()),
            Some(latch) => {
                tracing::trace!(semaphore = self.state.id(), "acquire parked");
                let this = self.clone();
                let parked = latch.clone();
                Ticket::new(latch.wait(), IO::sync(move || this.abandon(&parked)))
            }
        }
    }

    /// Undo a parked acquire whose fiber was interrupted.
    fn abandon(&self, latch: &Latch) {
        self.state.modify_now(|s| {
            if let Some(index) = s.waiters.iter().position(|w| w.ptr_eq(latch)) {
                s.waiters.remove(index);
            } else if latch.poll_now().is_some() {
                // Granted after the interrupt landed.
                s.release_one();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberState;
    use crate::scheduler::Runtime;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new().unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            std::thread::yield_now();
        }
    }

    #[test]
    fn test_acquire_and_release_adjust_permits() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let program = sem
            .acquire()
            .apply_second(sem.available())
            .zip(sem.release().apply_second(sem.available()));
        assert_eq!(rt.block_on(&program), Exit::Value((1, 2)));
    }

    #[test]
    fn test_try_acquire() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        assert_eq!(rt.block_on(&sem.try_acquire()), Exit::Value(true));
        assert_eq!(rt.block_on(&sem.try_acquire()), Exit::Value(false));
        rt.block_on(&sem.release());
        assert_eq!(rt.block_on(&sem.try_acquire()), Exit::Value(true));
    }

    #[test]
    fn test_waiters_are_granted_in_fifo_order() {
        let rt = runtime();
        let sem = Semaphore::new(0);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..4 {
            let order = order.clone();
            let tx = tx.clone();
            let acquirer = sem.acquire().map(move |_| order.lock().push(i));
            rt.run_callback(&acquirer, move |_| {
                let _ = tx.send(());
            });
            wait_until(|| sem.snapshot().1 == i + 1);
        }
        for _ in 0..4 {
            rt.block_on(&sem.release());
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
        assert_eq!(sem.snapshot(), (0, 0));
    }

    #[test]
    fn test_release_hands_permit_to_waiter() {
        let rt = runtime();
        let sem = Semaphore::new(0);
        let (tx, rx) = crossbeam_channel::bounded(1);
        rt.run_callback(&sem.acquire(), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| sem.snapshot().1 == 1);
        rt.block_on(&sem.release());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Exit::Value(()));
        // Transferred directly; the count never went up.
        assert_eq!(sem.snapshot(), (0, 0));
    }

    #[test]
    fn test_interrupted_acquire_leaves_queue() {
        let rt = runtime();
        let sem = Semaphore::new(0);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_callback(&sem.acquire(), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| handle.state() == FiberState::Suspended);
        handle.interrupt();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_interrupted());
        assert_eq!(sem.snapshot(), (0, 0));
        rt.block_on(&sem.release());
        assert_eq!(sem.snapshot(), (1, 0));
    }

    #[test]
    fn test_abandoned_grant_is_returned() {
        let sem = Semaphore::new(0);
        let latch = Latch::new();
        sem.state.modify_now(|s| s.waiters.push_back(latch.clone()));
        sem.state.modify_now(SemaphoreState::release_one);
        assert_eq!(latch.poll_now(), Some(Exit::Value(())));
        sem.abandon(&latch);
        assert_eq!(sem.snapshot(), (1, 0));
    }

    #[test]
    fn test_acquire_interrupted_before_delivery_returns_permit() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fiber = rt.prepare(&sem.acquire(), move |exit| {
            let _ = tx.send(exit);
        });
        fiber.handle().interrupt();
        fiber.start();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_interrupted());
        assert_eq!(sem.snapshot(), (1, 0));
    }

    #[test]
    fn test_with_permit_releases_on_failure() {
        let rt = runtime();
        let sem = Semaphore::new(1);
        let failing: IO<String, i32> = IO::fail("boom".into());
        assert_eq!(rt.block_on(&sem.with_permit(failing)), Exit::failed("boom".to_string()));
        assert_eq!(rt.block_on(&sem.available()), Exit::Value(1));
    }

    #[test]
    fn test_with_permit_limits_concurrency() {
        let rt = runtime();
        let sem = Semaphore::new(2);
        let active = Arc::new(Mutex::new((0usize, 0usize)));
        let (tx, rx) = crossbeam_channel::unbounded();
        for _ in 0..6 {
            let enter = active.clone();
            let leave = active.clone();
            let work = IO::<Infallible, ()>::sync(move || {
                let mut a = enter.lock();
                a.0 += 1;
                a.1 = a.1.max(a.0);
            })
            .apply_second(IO::sleep(Duration::from_millis(5)))
            .apply_second(IO::sync(move || leave.lock().0 -= 1));
            let tx = tx.clone();
            rt.run_callback(&sem.with_permit(work), move |_| {
                let _ = tx.send(());
            });
        }
        for _ in 0..6 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert_eq!(active.lock().1, 2);
        assert_eq!(sem.snapshot(), (2, 0));
    }
}
