//! Property-based tests for the effect runtime.
//!
//! Uses proptest to generate random programs and operation sequences and
//! verify the primitives' invariants hold.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use effect_runtime::{ConcurrentQueue, Deferred, Exit, OverflowPolicy, Runtime, Semaphore, IO, UIO};
use proptest::prelude::*;

/// One runtime shared by every case.
fn rt() -> &'static Runtime {
    static RT: OnceLock<Runtime> = OnceLock::new();
    RT.get_or_init(|| Runtime::new().expect("start runtime"))
}

/// How the body of a bracket terminates.
#[derive(Debug, Clone, Copy)]
enum Ending {
    Succeed,
    Fail,
    Abort,
    Interrupt,
}

fn ending() -> impl Strategy<Value = Ending> {
    prop_oneof![
        Just(Ending::Succeed),
        Just(Ending::Fail),
        Just(Ending::Abort),
        Just(Ending::Interrupt),
    ]
}

fn body(ending: Ending) -> IO<String, i32> {
    match ending {
        Ending::Succeed => IO::succeed(1),
        Ending::Fail => IO::fail("failed".into()),
        Ending::Abort => IO::abort("aborted"),
        Ending::Interrupt => IO::interrupted(),
    }
}

/// Queue operations for the invariant check.
#[derive(Debug, Clone)]
enum Op {
    Offer(i32),
    Take,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![(0i32..100).prop_map(Op::Offer), Just(Op::Take)],
        0..40,
    )
}

fn policy() -> impl Strategy<Value = OverflowPolicy> {
    prop_oneof![
        Just(OverflowPolicy::Unbounded),
        (0usize..5).prop_map(OverflowPolicy::Sliding),
        (0usize..5).prop_map(OverflowPolicy::Dropping),
    ]
}

/// Model of the buffered side of a non-blocking queue.
fn model_offer(policy: OverflowPolicy, model: &mut VecDeque<i32>, value: i32) {
    match policy {
        OverflowPolicy::Unbounded | OverflowPolicy::Bounded(_) => model.push_back(value),
        OverflowPolicy::Sliding(n) => {
            if n > 0 {
                while model.len() >= n {
                    model.pop_front();
                }
                model.push_back(value);
            }
        }
        OverflowPolicy::Dropping(n) => {
            if model.len() < n {
                model.push_back(value);
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Only the first completion of a deferred is ever observed
    #[test]
    fn deferred_first_write_wins(values in prop::collection::vec(any::<i32>(), 1..10)) {
        let d: Deferred<String, i32> = Deferred::new();
        let writes = values.iter().fold(IO::<Infallible, ()>::unit_value(), |acc, v| {
            acc.apply_second(d.done(*v))
        });
        let program = writes.widen::<String>().apply_second(d.wait()).zip(d.wait());
        prop_assert_eq!(rt().block_on(&program), Exit::Value((values[0], values[0])));
    }

    /// Release of a bracket runs exactly once for every way the body can end
    #[test]
    fn bracket_releases_exactly_once(ends in prop::collection::vec(ending(), 1..8)) {
        let released = Arc::new(AtomicUsize::new(0));
        for end in &ends {
            let count = released.clone();
            let program = IO::<String, ()>::unit_value().bracket(
                move |_| {
                    let count = count.clone();
                    IO::sync(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                },
                {
                    let end = *end;
                    move |_| body(end)
                },
            );
            let exit = rt().block_on(&program);
            prop_assert_eq!(exit.is_value(), matches!(end, Ending::Succeed));
        }
        prop_assert_eq!(released.load(Ordering::SeqCst), ends.len());
    }

    /// Sequential offers and takes match a model and never mix waiters with items
    #[test]
    fn queue_matches_model(policy in policy(), ops in ops()) {
        let queue = ConcurrentQueue::with_policy(policy);
        let mut model = VecDeque::new();
        for op in ops {
            match op {
                Op::Offer(v) => {
                    rt().block_on(&queue.offer(v));
                    model_offer(policy, &mut model, v);
                }
                Op::Take => {
                    // Only take when an item is buffered so the test never parks.
                    if let Some(expected) = model.pop_front() {
                        prop_assert_eq!(rt().block_on(&queue.take()), Exit::Value(expected));
                    }
                }
            }
            let size = rt().block_on(&queue.size()).get_or(-1);
            prop_assert!(size >= 0);
            prop_assert_eq!(size as usize, model.len());
        }
    }

    /// Overflow keeps the newest items for sliding and the oldest for dropping
    #[test]
    fn overflow_semantics(capacity in 1usize..5, values in prop::collection::vec(any::<i32>(), 0..12)) {
        let sliding = ConcurrentQueue::with_policy(OverflowPolicy::Sliding(capacity));
        let dropping = ConcurrentQueue::with_policy(OverflowPolicy::Dropping(capacity));
        rt().block_on(&sliding.offer_all(values.clone()));
        rt().block_on(&dropping.offer_all(values.clone()));

        let keep = values.len().min(capacity);
        let newest = values[values.len() - keep..].to_vec();
        let oldest = values[..keep].to_vec();
        let drain = |queue: &ConcurrentQueue<i32>| -> Vec<i32> {
            (0..keep).filter_map(|_| rt().block_on(&queue.take()).value().copied()).collect()
        };
        prop_assert_eq!(drain(&sliding), newest);
        prop_assert_eq!(drain(&dropping), oldest);
    }

    /// Permits go to waiting acquirers in arrival order
    #[test]
    fn semaphore_grants_in_arrival_order(permits in 0usize..3, waiters in 1usize..6) {
        let sem = Semaphore::new(permits);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..permits + waiters {
            let pushed = order.clone();
            let tx = tx.clone();
            let acquirer: UIO<()> = sem.acquire().map(move |_| pushed.lock().push(i));
            rt().run_callback(&acquirer, move |_| {
                let _ = tx.send(());
            });
            // Wait until this acquirer either holds a permit or is queued.
            while rt().block_on(&sem.waiting()).get_or(0) + order.lock().len() < i + 1 {
                std::thread::yield_now();
            }
        }
        for _ in 0..permits + waiters {
            if order.lock().len() < permits + waiters {
                rt().block_on(&sem.release());
            }
            let _ = rx.recv_timeout(std::time::Duration::from_secs(5));
        }
        let expected: Vec<usize> = (0..permits + waiters).collect();
        prop_assert_eq!(order.lock().clone(), expected);
    }
}
