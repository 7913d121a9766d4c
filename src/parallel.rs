//! # Parallel Composition
//!
//! `race` and `par_zip` run both sides as sibling fibers on the same runtime.
//!
//! ## Semantics
//!
//! | Combinator | Completes when | Sibling |
//! |------------|----------------|---------|
//! | [`race`] | the first side exits, with any exit | interrupted |
//! | [`par_zip_with`] | both sides succeed, or either side stops | interrupted on the first cause |
//!
//! The loser's interruption is requested before the parent resumes but is not
//! awaited (fire-and-forget). When two sides settle on the same loop turn,
//! whichever exit is delivered first wins; this tie-break is nondeterministic.
//!
//! Interrupting the parent while it waits interrupts both children, so a
//! child never outlives the combinator that spawned it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::Canceler;
use crate::exit::{Cause, Exit};
use crate::fiber::FiberHandle;
use crate::io::{Callback, IO};
use crate::panic::catch_defect;
use crate::scheduler::Runtime;

/// Combine both values, turning a panic in `f` into a defect.
fn deliver<E, A, B, C>(callback: Callback<E, C>, f: &dyn Fn(A, B) -> C, a: A, b: B)
where
    E: Send + 'static,
    C: Send + 'static,
{
    match catch_defect(|| f(a, b)) {
        Ok(value) => callback.succeed(value),
        Err(defect) => callback.complete(Exit::Cause(Cause::Aborted(defect))),
    }
}

fn interrupt_all(fibers: &[FiberHandle]) {
    for fiber in fibers {
        fiber.interrupt();
    }
}

// ============================================================================
// race
// ============================================================================

struct RaceState<E, A> {
    callback: Option<Callback<E, A>>,
    fibers: Vec<FiberHandle>,
}

/// Run both effects concurrently and keep the first exit.
pub fn race<E, A>(left: IO<E, A>, right: IO<E, A>) -> IO<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    IO::<E, Runtime>::runtime().chain(move |runtime| {
        let sides = [left.clone(), right.clone()];
        IO::async_(move |callback: Callback<E, A>| {
            let state = Arc::new(Mutex::new(RaceState {
                callback: Some(callback),
                fibers: Vec::with_capacity(2),
            }));

            let prepared: Vec<_> = sides
                .iter()
                .enumerate()
                .map(|(index, side)| {
                    let state = state.clone();
                    runtime.prepare(side, move |exit: Exit<E, A>| {
                        let (winner, fibers) = {
                            let mut state = state.lock();
                            match state.callback.take() {
                                Some(callback) => (callback, state.fibers.clone()),
                                None => return,
                            }
                        };
                        let losers: Vec<_> = fibers
                            .into_iter()
                            .enumerate()
                            .filter(|(i, _)| *i != index)
                            .map(|(_, fiber)| fiber)
                            .collect();
                        interrupt_all(&losers);
                        winner.complete(exit);
                    })
                })
                .collect();

            state.lock().fibers = prepared.iter().map(|p| p.handle().clone()).collect();
            for fiber in prepared {
                fiber.start();
            }

            Canceler::new(move || {
                let fibers = state.lock().fibers.clone();
                interrupt_all(&fibers);
            })
        })
    })
}

// ============================================================================
// par_zip
// ============================================================================

struct ZipState<E, A, B, C> {
    callback: Option<Callback<E, C>>,
    left: Option<A>,
    right: Option<B>,
    fibers: Vec<FiberHandle>,
}

impl<E, A, B, C> ZipState<E, A, B, C>
where
    E: Send + 'static,
    C: Send + 'static,
{
    /// Take the callback and the sibling to interrupt after a cause.
    fn fail_fast(&mut self, sibling: usize) -> Option<(Callback<E, C>, Option<FiberHandle>)> {
        let callback = self.callback.take()?;
        Some((callback, self.fibers.get(sibling).cloned()))
    }
}

/// Run both effects concurrently and combine their values.
///
/// The first cause from either side wins and interrupts the other side.
pub fn par_zip_with<E, A, B, C, F>(left: IO<E, A>, right: IO<E, B>, f: F) -> IO<E, C>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
{
    let f = Arc::new(f);
    IO::<E, Runtime>::runtime().chain(move |runtime| {
        let (left, right, f) = (left.clone(), right.clone(), f.clone());
        IO::async_(move |callback: Callback<E, C>| {
            let state = Arc::new(Mutex::new(ZipState::<E, A, B, C> {
                callback: Some(callback),
                left: None,
                right: None,
                fibers: Vec::with_capacity(2),
            }));

            let on_left = {
                let state = state.clone();
                let f = f.clone();
                move |exit: Exit<E, A>| {
                    let mut guard = state.lock();
                    match exit {
                        Exit::Value(a) => {
                            if guard.callback.is_none() {
                                return;
                            }
                            match guard.right.take() {
                                Some(b) => {
                                    if let Some(callback) = guard.callback.take() {
                                        drop(guard);
                                        deliver(callback, &*f, a, b);
                                    }
                                }
                                None => guard.left = Some(a),
                            }
                        }
                        Exit::Cause(cause) => {
                            if let Some((callback, sibling)) = guard.fail_fast(1) {
                                drop(guard);
                                if let Some(sibling) = sibling {
                                    sibling.interrupt();
                                }
                                callback.complete(Exit::Cause(cause));
                            }
                        }
                    }
                }
            };

            let on_right = {
                let state = state.clone();
                let f = f.clone();
                move |exit: Exit<E, B>| {
                    let mut guard = state.lock();
                    match exit {
                        Exit::Value(b) => {
                            if guard.callback.is_none() {
                                return;
                            }
                            match guard.left.take() {
                                Some(a) => {
                                    if let Some(callback) = guard.callback.take() {
                                        drop(guard);
                                        deliver(callback, &*f, a, b);
                                    }
                                }
                                None => guard.right = Some(b),
                            }
                        }
                        Exit::Cause(cause) => {
                            if let Some((callback, sibling)) = guard.fail_fast(0) {
                                drop(guard);
                                if let Some(sibling) = sibling {
                                    sibling.interrupt();
                                }
                                callback.complete(Exit::Cause(cause));
                            }
                        }
                    }
                }
            };

            let left_fiber = runtime.prepare(&left, on_left);
            let right_fiber = runtime.prepare(&right, on_right);
            state.lock().fibers = vec![left_fiber.handle().clone(), right_fiber.handle().clone()];
            left_fiber.start();
            right_fiber.start();

            Canceler::new(move || {
                let fibers = state.lock().fibers.clone();
                interrupt_all(&fibers);
            })
        })
    })
}

/// Run both effects concurrently and pair their values.
pub fn par_zip<E, A, B>(left: IO<E, A>, right: IO<E, B>) -> IO<E, (A, B)>
where
    E: Send + 'static,
    A: Send + 'static,
    B: Send + 'static,
{
    par_zip_with(left, right, |a, b| (a, b))
}

impl<E, A> IO<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Method form of [`race`].
    pub fn race(self, other: IO<E, A>) -> IO<E, A> {
        race(self, other)
    }

    /// Method form of [`par_zip`].
    pub fn par_zip<B>(self, other: IO<E, B>) -> IO<E, (A, B)>
    where
        B: Send + 'static,
    {
        par_zip(self, other)
    }

    /// Method form of [`par_zip_with`].
    pub fn par_zip_with<B, C, F>(self, other: IO<E, B>, f: F) -> IO<E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        par_zip_with(self, other, f)
    }
}
