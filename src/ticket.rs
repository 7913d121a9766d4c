//! Tickets
//!
//! A [`Ticket`] pairs the effect that completes an acquisition with the
//! cleanup to run if the holder gives up while waiting. Blocking primitives
//! decide atomically, inside a `Ref` update, whether a request is granted now
//! or must wait, and hand back a ticket describing what to do next.
//!
//! [`Ticket::redeem`] brackets the ticket: building it is uninterruptible,
//! waiting on it is interruptible, and its cleanup runs exactly once if and
//! only if the wait was interrupted. An interrupt can land between building
//! a granted ticket and handing its value out, so every cleanup must also
//! undo a grant that was never delivered.

use std::convert::Infallible;

use crate::exit::Exit;
use crate::io::{IO, UIO};

/// A pending grant and its cleanup action.
pub struct Ticket<A> {
    acquire: UIO<A>,
    cleanup: UIO<()>,
}

impl<A> Clone for Ticket<A> {
    fn clone(&self) -> Self {
        Self {
            acquire: self.acquire.clone(),
            cleanup: self.cleanup.clone(),
        }
    }
}

impl<A> Ticket<A>
where
    A: Send + 'static,
{
    /// Create a ticket.
    pub fn new(acquire: UIO<A>, cleanup: UIO<()>) -> Self {
        Self { acquire, cleanup }
    }

    /// A ticket that is already granted.
    ///
    /// `give_back` undoes the grant if the holder is interrupted before the
    /// value reaches it.
    pub fn granted(value: A, give_back: UIO<()>) -> Self
    where
        A: Clone + Sync,
    {
        Self::new(IO::succeed(value), give_back)
    }

    /// The effect that yields the grant.
    pub fn acquire(&self) -> &UIO<A> {
        &self.acquire
    }

    /// The cleanup run when the wait is interrupted.
    pub fn cleanup(&self) -> &UIO<()> {
        &self.cleanup
    }

    /// Build a ticket with `factory` and wait on it.
    pub fn redeem(factory: UIO<Ticket<A>>) -> UIO<A> {
        factory.bracket_exit(on_exit, |ticket: Ticket<A>| ticket.acquire)
    }
}

/// Cleanup only when interrupted; any other exit means the grant was used.
fn on_exit<A>(ticket: Ticket<A>, exit: &Exit<Infallible, A>) -> UIO<()> {
    if exit.is_interrupted() {
        ticket.cleanup
    } else {
        IO::unit_value()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_cleanup() -> (Arc<AtomicUsize>, UIO<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (
            count,
            IO::sync(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_granted_ticket_skips_cleanup() {
        let rt = Runtime::new().unwrap();
        let (count, cleanup) = counting_cleanup();
        let ticket = Ticket::new(IO::succeed(3), cleanup);
        assert_eq!(rt.block_on(&Ticket::redeem(IO::succeed(ticket))), Exit::Value(3));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupted_wait_runs_cleanup_once() {
        let rt = Runtime::new().unwrap();
        let (count, cleanup) = counting_cleanup();
        let ticket: Ticket<i32> = Ticket::new(IO::never(), cleanup);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_callback(&Ticket::redeem(IO::succeed(ticket)), move |exit| {
            let _ = tx.send(exit);
        });
        while handle.state() != crate::fiber::FiberState::Suspended {
            std::thread::yield_now();
        }
        handle.interrupt();
        let exit = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_accessors() {
        let (count, give_back) = counting_cleanup();
        let ticket = Ticket::granted(1u8, give_back);
        let rt = Runtime::new().unwrap();
        assert_eq!(rt.block_on(ticket.acquire()), Exit::Value(1));
        assert_eq!(rt.block_on(ticket.cleanup()), Exit::Value(()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_granted_ticket_gives_back_when_interrupted_before_delivery() {
        let rt = Runtime::new().unwrap();
        let (count, give_back) = counting_cleanup();
        let redeem = Ticket::redeem(IO::succeed(Ticket::granted(5, give_back)));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fiber = rt.prepare(&redeem, move |exit| {
            let _ = tx.send(exit);
        });
        fiber.handle().interrupt();
        fiber.start();
        let exit = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(exit.is_interrupted());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
