//! # Concurrent Queue
//!
//! A multi-producer multi-consumer queue of values between fibers.
//!
//! ## Design
//!
//! The state is either a FIFO of parked consumers or a FIFO of buffered
//! items, never both at once. An offer that finds a parked consumer hands its
//! item straight to the longest-waiting one; only when nobody waits does the
//! item go into the buffer, under the queue's [`OverflowPolicy`].
//!
//! | Policy | Buffer full |
//! |--------|-------------|
//! | `Unbounded` | never full |
//! | `Sliding(n)` | evict the oldest item, keep the new one |
//! | `Dropping(n)` | discard the new item |
//! | `Bounded(n)` | the offering fiber waits for room |
//!
//! A bounded queue gates offers with a [`Semaphore`] of `n` permits. Every
//! take returns one permit before it waits; a take interrupted while waiting
//! acquires the permit back so the bound holds.
//!
//! A take interrupted at the same moment an offer handed it an item puts the
//! item back at the front of the queue instead of losing it. The returned
//! item still obeys the overflow policy.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::fmt;

use crate::deferred::Deferred;
use crate::exit::Exit;
use crate::io::{IO, UIO};
use crate::ref_cell::Ref;
use crate::semaphore::Semaphore;
use crate::ticket::Ticket;

// ============================================================================
// Overflow Policy
// ============================================================================

/// What an offer does when the buffer is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// No capacity limit.
    Unbounded,
    /// Keep the newest `n` items.
    Sliding(usize),
    /// Keep the oldest `n` items.
    Dropping(usize),
    /// Make producers wait while `n` items are outstanding.
    Bounded(usize),
}

impl OverflowPolicy {
    /// The capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        match *self {
            OverflowPolicy::Unbounded => None,
            OverflowPolicy::Sliding(n) | OverflowPolicy::Dropping(n) | OverflowPolicy::Bounded(n) => {
                Some(n)
            }
        }
    }

    /// Append `value` to `buffer` under this policy.
    fn push<A>(&self, buffer: &mut VecDeque<A>, value: A) {
        match *self {
            // Bounded admission happens before the item reaches the buffer.
            OverflowPolicy::Unbounded | OverflowPolicy::Bounded(_) => buffer.push_back(value),
            OverflowPolicy::Sliding(n) => {
                if n == 0 {
                    return;
                }
                while buffer.len() >= n {
                    buffer.pop_front();
                }
                buffer.push_back(value);
            }
            OverflowPolicy::Dropping(n) => {
                if buffer.len() < n {
                    buffer.push_back(value);
                }
            }
        }
    }

    /// Put a taken `value` back at the head of `buffer` under this policy.
    ///
    /// The returned item is older than everything buffered, so a full
    /// sliding buffer evicts it and a full dropping buffer evicts its newest.
    fn restore<A>(&self, buffer: &mut VecDeque<A>, value: A) {
        match *self {
            OverflowPolicy::Unbounded | OverflowPolicy::Bounded(_) => buffer.push_front(value),
            OverflowPolicy::Sliding(n) => {
                if buffer.len() < n {
                    buffer.push_front(value);
                }
            }
            OverflowPolicy::Dropping(n) => {
                buffer.push_front(value);
                buffer.truncate(n);
            }
        }
    }
}

// ============================================================================
// Queue State
// ============================================================================

type Latch<A> = Deferred<Infallible, A>;

enum QueueState<A> {
    /// Consumers parked in arrival order. Never empty.
    Waiting(VecDeque<Latch<A>>),
    /// Buffered items, oldest first.
    Ready(VecDeque<A>),
}

impl<A> QueueState<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn size(&self) -> isize {
        match self {
            QueueState::Waiting(waiting) => -(waiting.len() as isize),
            QueueState::Ready(items) => items.len() as isize,
        }
    }

    /// Give `value` to the longest-waiting consumer, if there is one.
    ///
    /// Returns the value back when nobody is waiting; the state is then
    /// `Ready`.
    fn hand_off(&mut self, value: A) -> Option<A> {
        let QueueState::Waiting(waiting) = self else {
            return Some(value);
        };
        let Some(next) = waiting.pop_front() else {
            *self = QueueState::Ready(VecDeque::new());
            return Some(value);
        };
        next.complete_now(Exit::Value(value));
        if waiting.is_empty() {
            *self = QueueState::Ready(VecDeque::new());
        }
        None
    }

    /// Return an item that was taken but never delivered.
    fn put_back(&mut self, value: A, policy: OverflowPolicy) {
        if let (Some(value), QueueState::Ready(items)) = (self.hand_off(value), &mut *self) {
            policy.restore(items, value);
        }
    }
}

// ============================================================================
// Concurrent Queue
// ============================================================================

/// Asynchronous FIFO queue shared between fibers.
pub struct ConcurrentQueue<A> {
    state: Ref<QueueState<A>>,
    policy: OverflowPolicy,
    gate: Option<Semaphore>,
}

impl<A> Clone for ConcurrentQueue<A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            policy: self.policy,
            gate: self.gate.clone(),
        }
    }
}

impl<A> fmt::Debug for ConcurrentQueue<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentQueue")
            .field("id", &self.state.id())
            .field("policy", &self.policy)
            .finish()
    }
}

impl<A> ConcurrentQueue<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Create an empty queue with the given policy immediately.
    pub fn with_policy(policy: OverflowPolicy) -> Self {
        let gate = match policy {
            OverflowPolicy::Bounded(n) => Some(Semaphore::new(n)),
            _ => None,
        };
        Self {
            state: Ref::new(QueueState::Ready(VecDeque::new())),
            policy,
            gate,
        }
    }

    /// Allocate a fresh queue with the given policy each time the effect runs.
    pub fn make(policy: OverflowPolicy) -> UIO<ConcurrentQueue<A>> {
        IO::sync(move || ConcurrentQueue::with_policy(policy))
    }

    /// A queue without a capacity limit.
    pub fn unbounded() -> UIO<ConcurrentQueue<A>> {
        Self::make(OverflowPolicy::Unbounded)
    }

    /// A queue that evicts its oldest item when full.
    pub fn sliding(capacity: usize) -> UIO<ConcurrentQueue<A>> {
        Self::make(OverflowPolicy::Sliding(capacity))
    }

    /// A queue that discards new items when full.
    pub fn dropping(capacity: usize) -> UIO<ConcurrentQueue<A>> {
        Self::make(OverflowPolicy::Dropping(capacity))
    }

    /// A queue whose producers wait when full.
    pub fn bounded(capacity: usize) -> UIO<ConcurrentQueue<A>> {
        Self::make(OverflowPolicy::Bounded(capacity))
    }

    /// The overflow policy.
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// The capacity, or `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        self.policy.capacity()
    }

    /// Buffered items, or minus the number of parked consumers.
    pub fn size(&self) -> UIO<isize> {
        let state = self.state.clone();
        IO::sync(move || state.modify_now(|s| s.size()))
    }

    /// Take the oldest item, waiting if the queue is empty.
    ///
    /// Waiting is interruptible and an interrupted take leaves nothing behind.
    pub fn take(&self) -> UIO<A> {
        let this = self.clone();
        let take = Ticket::redeem(IO::sync(move || this.ticket()));
        match &self.gate {
            None => take,
            Some(gate) => {
                let reacquire = gate.acquire();
                gate.release().bracket_exit(
                    move |_, exit: &Exit<Infallible, A>| {
                        if exit.is_interrupted() {
                            reacquire.clone()
                        } else {
                            IO::unit_value()
                        }
                    },
                    move |_| take.clone(),
                )
            }
        }
    }

    /// Add an item.
    ///
    /// Only a bounded queue can make the caller wait, and only for room.
    /// Once admitted the item is placed without interruption.
    pub fn offer(&self, value: A) -> UIO<()> {
        let this = self.clone();
        let put = IO::sync(move || this.offer_now(value.clone())).uninterruptible();
        match &self.gate {
            None => put,
            Some(gate) => gate.acquire().apply_second(put),
        }
    }

    /// Offer every item of `values` in order.
    pub fn offer_all(&self, values: Vec<A>) -> UIO<()> {
        values
            .into_iter()
            .fold(IO::unit_value(), |acc, value| acc.apply_second(self.offer(value)))
    }

    fn offer_now(&self, value: A) {
        let policy = self.policy;
        self.state.modify_now(|s| {
            if let (Some(value), QueueState::Ready(items)) = (s.hand_off(value), &mut *s) {
                policy.push(items, value);
            }
        });
    }

    fn ticket(&self) -> Ticket<A> {
        let parked = self.state.modify_now(|s| {
            if let QueueState::Ready(items) = s {
                if let Some(value) = items.pop_front() {
                    return Ok(value);
                }
            }
            let latch = Latch::new();
            match s {
                QueueState::Waiting(waiting) => waiting.push_back(latch.clone()),
                QueueState::Ready(_) => *s = QueueState::Waiting(VecDeque::from([latch.clone()])),
            }
            Err(latch)
        });
        match parked {
            Ok(value) => {
                let state = self.state.clone();
                let policy = self.policy;
                let taken = value.clone();
                let give_back = IO::sync(move || {
                    state.modify_now(|s| s.put_back(taken.clone(), policy));
                });
                Ticket::granted(value, give_back)
            }
            Err(latch) => {
                tracing::trace!(queue = self.state.id(), "take parked");
                let this = self.clone();
                let abandoned = latch.clone();
                Ticket::new(latch.wait(), IO::sync(move || this.abandon(&abandoned)))
            }
        }
    }

    /// Undo a parked take whose fiber was interrupted.
    fn abandon(&self, latch: &Latch<A>) {
        let policy = self.policy;
        self.state.modify_now(|s| {
            if let QueueState::Waiting(waiting) = s {
                if let Some(index) = waiting.iter().position(|w| w.ptr_eq(latch)) {
                    waiting.remove(index);
                    if waiting.is_empty() {
                        *s = QueueState::Ready(VecDeque::new());
                    }
                    return;
                }
            }
            // An offer reached the latch after the interrupt landed.
            if let Some(Exit::Value(value)) = latch.poll_now() {
                s.put_back(value, policy);
            }
        });
    }
}

/// A queue without a capacity limit.
pub fn unbounded_queue<A>() -> UIO<ConcurrentQueue<A>>
where
    A: Clone + Send + Sync + 'static,
{
    ConcurrentQueue::unbounded()
}

/// A queue that keeps the newest `capacity` items.
pub fn sliding_queue<A>(capacity: usize) -> UIO<ConcurrentQueue<A>>
where
    A: Clone + Send + Sync + 'static,
{
    ConcurrentQueue::sliding(capacity)
}

/// A queue that keeps the oldest `capacity` items.
pub fn dropping_queue<A>(capacity: usize) -> UIO<ConcurrentQueue<A>>
where
    A: Clone + Send + Sync + 'static,
{
    ConcurrentQueue::dropping(capacity)
}

/// A queue whose producers wait while `capacity` items are outstanding.
pub fn bounded_queue<A>(capacity: usize) -> UIO<ConcurrentQueue<A>>
where
    A: Clone + Send + Sync + 'static,
{
    ConcurrentQueue::bounded(capacity)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberState;
    use crate::scheduler::Runtime;
    use std::time::Duration;

    fn runtime() -> Runtime {
        Runtime::new().unwrap()
    }

    fn wait_until(mut condition: impl FnMut() -> bool) {
        while !condition() {
            std::thread::yield_now();
        }
    }

    fn size_now<A: Clone + Send + Sync + 'static>(queue: &ConcurrentQueue<A>) -> isize {
        queue.state.modify_now(|s| s.size())
    }

    fn drain(rt: &Runtime, queue: &ConcurrentQueue<i32>) -> Vec<i32> {
        let mut out = Vec::new();
        while size_now(queue) > 0 {
            if let Exit::Value(v) = rt.block_on(&queue.take()) {
                out.push(v);
            }
        }
        out
    }

    #[test]
    fn test_fifo_order() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        rt.block_on(&queue.offer_all(vec![1, 2, 3]));
        assert_eq!(drain(&rt, &queue), vec![1, 2, 3]);
    }

    #[test]
    fn test_sliding_keeps_newest() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Sliding(2));
        rt.block_on(&queue.offer_all(vec![1, 2, 3]));
        assert_eq!(drain(&rt, &queue), vec![2, 3]);
    }

    #[test]
    fn test_dropping_keeps_oldest() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Dropping(2));
        rt.block_on(&queue.offer_all(vec![1, 2, 3]));
        assert_eq!(drain(&rt, &queue), vec![1, 2]);
    }

    #[test]
    fn test_zero_capacity_buffers_nothing() {
        let rt = runtime();
        for policy in [OverflowPolicy::Sliding(0), OverflowPolicy::Dropping(0)] {
            let queue = ConcurrentQueue::with_policy(policy);
            rt.block_on(&queue.offer(1));
            assert_eq!(size_now(&queue), 0);
        }
    }

    #[test]
    fn test_offer_hands_off_to_waiting_consumer() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Dropping(0));
        let (tx, rx) = crossbeam_channel::bounded(1);
        rt.run_callback(&queue.take(), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| size_now(&queue) == -1);
        // Handoff bypasses the overflow policy.
        rt.block_on(&queue.offer(7));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Exit::Value(7));
        assert_eq!(size_now(&queue), 0);
    }

    #[test]
    fn test_consumers_served_in_arrival_order() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..3 {
            let tx = tx.clone();
            rt.run_callback(&queue.take(), move |exit| {
                let _ = tx.send((i, exit));
            });
            wait_until(|| size_now(&queue) == -(i + 1));
        }
        rt.block_on(&queue.offer_all(vec![10, 20, 30]));
        let mut got: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        got.sort_by_key(|(i, _)| *i);
        assert_eq!(
            got,
            vec![(0, Exit::Value(10)), (1, Exit::Value(20)), (2, Exit::Value(30))]
        );
    }

    #[test]
    fn test_interrupted_take_leaves_no_waiter() {
        let rt = runtime();
        let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_callback(&queue.take(), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| size_now(&queue) == -1);
        wait_until(|| handle.state() == FiberState::Suspended);
        handle.interrupt();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_interrupted());
        assert_eq!(size_now(&queue), 0);
        rt.block_on(&queue.offer(5));
        assert_eq!(drain(&rt, &queue), vec![5]);
    }

    #[test]
    fn test_abandoned_handoff_is_restored() {
        let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        let latch = Latch::new();
        queue
            .state
            .modify_now(|s| *s = QueueState::Waiting(VecDeque::from([latch.clone()])));
        queue.offer_now(1);
        queue.offer_now(2);
        assert_eq!(latch.poll_now(), Some(Exit::Value(1)));
        queue.abandon(&latch);
        let rt = runtime();
        assert_eq!(drain(&rt, &queue), vec![1, 2]);
    }

    #[test]
    fn test_abandoned_handoff_respects_overflow_policy() {
        let rt = runtime();
        for (policy, expected) in [
            (OverflowPolicy::Sliding(2), vec![2, 3]),
            (OverflowPolicy::Dropping(2), vec![1, 2]),
        ] {
            let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(policy);
            let latch = Latch::new();
            queue
                .state
                .modify_now(|s| *s = QueueState::Waiting(VecDeque::from([latch.clone()])));
            queue.offer_now(1);
            queue.offer_now(2);
            queue.offer_now(3);
            queue.abandon(&latch);
            assert_eq!(size_now(&queue), 2);
            assert_eq!(drain(&rt, &queue), expected);
        }
    }

    #[test]
    fn test_take_interrupted_before_delivery_restores_item() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        rt.block_on(&queue.offer_all(vec![1, 2]));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let fiber = rt.prepare(&queue.take(), move |exit| {
            let _ = tx.send(exit);
        });
        fiber.handle().interrupt();
        fiber.start();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_interrupted());
        assert_eq!(drain(&rt, &queue), vec![1, 2]);
    }

    #[test]
    fn test_debug_shows_policy() {
        let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(OverflowPolicy::Sliding(3));
        let text = format!("{queue:?}");
        assert!(text.contains("ConcurrentQueue"));
        assert!(text.contains("Sliding(3)"));
    }

    #[test]
    fn test_bounded_offer_waits_for_take() {
        let rt = runtime();
        let queue = ConcurrentQueue::with_policy(OverflowPolicy::Bounded(1));
        rt.block_on(&queue.offer(1));
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_callback(&queue.offer(2), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| handle.state() == FiberState::Suspended);
        assert!(rx.try_recv().is_err());
        assert_eq!(size_now(&queue), 1);

        assert_eq!(rt.block_on(&queue.take()), Exit::Value(1));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Exit::Value(()));
        assert_eq!(rt.block_on(&queue.take()), Exit::Value(2));
    }

    #[test]
    fn test_bounded_interrupted_take_keeps_bound() {
        let rt = runtime();
        let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(OverflowPolicy::Bounded(1));
        let gate = queue.gate.clone().unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        let handle = rt.run_callback(&queue.take(), move |exit| {
            let _ = tx.send(exit);
        });
        wait_until(|| size_now(&queue) == -1);
        wait_until(|| handle.state() == FiberState::Suspended);
        assert_eq!(rt.block_on(&gate.available()), Exit::Value(2));
        handle.interrupt();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_interrupted());
        assert_eq!(rt.block_on(&gate.available()), Exit::Value(1));
    }

    #[test]
    fn test_capacity_and_constructors() {
        let rt = runtime();
        let sliding = rt.block_on(&sliding_queue::<u8>(3)).value().cloned().unwrap();
        assert_eq!(sliding.capacity(), Some(3));
        let unbounded = rt.block_on(&unbounded_queue::<u8>()).value().cloned().unwrap();
        assert_eq!(unbounded.capacity(), None);
        let bounded = rt.block_on(&bounded_queue::<u8>(2)).value().cloned().unwrap();
        assert_eq!(bounded.policy(), OverflowPolicy::Bounded(2));
        let dropping = rt.block_on(&dropping_queue::<u8>(4)).value().cloned().unwrap();
        assert_eq!(dropping.capacity(), Some(4));
    }

    #[test]
    fn test_size_reports_waiters_negative() {
        let rt = runtime();
        let queue: ConcurrentQueue<i32> = ConcurrentQueue::with_policy(OverflowPolicy::Unbounded);
        assert_eq!(rt.block_on(&queue.size()), Exit::Value(0));
        rt.run_callback(&queue.take(), |_| {});
        rt.run_callback(&queue.take(), |_| {});
        wait_until(|| size_now(&queue) == -2);
        rt.block_on(&queue.offer_all(vec![1, 2, 3]));
        assert_eq!(rt.block_on(&queue.size()), Exit::Value(1));
    }
}
