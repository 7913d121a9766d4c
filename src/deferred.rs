//! # Deferred
//!
//! A write-once cell that fibers can wait on.
//!
//! ## Semantics
//!
//! - The first completion wins; later completions are no-ops.
//! - Waiters registered before completion are resumed in registration order.
//! - Waiting on a completed deferred resumes immediately with the stored exit.
//! - Interrupting a waiting fiber removes its waiter; the deferred is untouched.
//!
//! Completing a deferred with `Interrupted` hands that cause to every waiter
//! as a value-level outcome. The waiting fibers themselves are not
//! interrupted and can recover with `fold`.

use std::collections::VecDeque;
use std::fmt;

use crate::cancellation::Canceler;
use crate::exit::{Cause, Defect, Exit};
use crate::io::{Callback, IO, UIO};
use crate::ref_cell::Ref;

enum DeferredState<E, A> {
    Pending {
        waiters: VecDeque<(u64, Callback<E, A>)>,
        next_waiter: u64,
    },
    Done(Exit<E, A>),
}

/// Write-once synchronization cell.
pub struct Deferred<E, A> {
    state: Ref<DeferredState<E, A>>,
}

impl<E, A> Clone for Deferred<E, A> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<E, A> fmt::Debug for Deferred<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").field("state", &self.state).finish()
    }
}

impl<E, A> Default for Deferred<E, A>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, A> Deferred<E, A>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    /// Create an empty deferred immediately.
    pub fn new() -> Self {
        Self {
            state: Ref::new(DeferredState::Pending {
                waiters: VecDeque::new(),
                next_waiter: 0,
            }),
        }
    }

    /// Allocate a fresh deferred each time the effect runs.
    pub fn make() -> UIO<Deferred<E, A>> {
        IO::sync(Deferred::new)
    }

    /// Check if both handles refer to the same deferred.
    pub fn ptr_eq(&self, other: &Deferred<E, A>) -> bool {
        self.state.ptr_eq(&other.state)
    }

    /// Wait for the deferred's exit and adopt it.
    pub fn wait(&self) -> IO<E, A> {
        let state = self.state.clone();
        IO::async_(move |callback: Callback<E, A>| {
            let registered = state.modify_now(move |s| match s {
                DeferredState::Done(exit) => Err((callback, exit.clone())),
                DeferredState::Pending {
                    waiters,
                    next_waiter,
                } => {
                    let id = *next_waiter;
                    *next_waiter += 1;
                    waiters.push_back((id, callback));
                    Ok(id)
                }
            });
            match registered {
                Err((callback, exit)) => {
                    callback.complete(exit);
                    Canceler::none()
                }
                Ok(id) => {
                    let state = state.clone();
                    Canceler::new(move || {
                        let removed = state.modify_now(|s| match s {
                            DeferredState::Pending { waiters, .. } => waiters
                                .iter()
                                .position(|(waiter, _)| *waiter == id)
                                .and_then(|index| waiters.remove(index)),
                            DeferredState::Done(_) => None,
                        });
                        drop(removed);
                    })
                }
            }
        })
    }

    /// Complete with an exit. No-op if already completed.
    pub fn complete(&self, exit: Exit<E, A>) -> UIO<()> {
        let this = self.clone();
        IO::sync(move || {
            this.complete_now(exit.clone());
        })
    }

    /// Complete with a value.
    pub fn done(&self, value: A) -> UIO<()> {
        self.complete(Exit::Value(value))
    }

    /// Complete with an expected error.
    pub fn error(&self, error: E) -> UIO<()> {
        self.complete(Exit::failed(error))
    }

    /// Complete with a defect.
    pub fn abort(&self, defect: impl Into<Defect>) -> UIO<()> {
        self.complete(Exit::aborted(defect))
    }

    /// Complete with `Interrupted`.
    pub fn interrupt(&self) -> UIO<()> {
        self.complete(Exit::interrupted())
    }

    /// Complete with a cause.
    pub fn cause(&self, cause: Cause<E>) -> UIO<()> {
        self.complete(Exit::Cause(cause))
    }

    /// Run `source` and complete with its exit.
    ///
    /// If the running fiber is interrupted first, the deferred is completed
    /// with `Interrupted` so waiters are not left hanging, and the fiber
    /// stays interrupted.
    pub fn from(&self, source: IO<E, A>) -> UIO<()> {
        let this = self.clone();
        source.result().chain(move |exit| {
            let interrupted = exit.is_interrupted();
            let done = this.complete(exit).uninterruptible();
            if interrupted {
                done.apply_second(IO::interrupted())
            } else {
                done
            }
        })
    }

    /// Check if the deferred has been completed.
    pub fn is_completed(&self) -> UIO<bool> {
        let state = self.state.clone();
        IO::sync(move || state.modify_now(|s| matches!(s, DeferredState::Done(_))))
    }

    /// The stored exit, if completed.
    pub fn poll(&self) -> UIO<Option<Exit<E, A>>> {
        let this = self.clone();
        IO::sync(move || this.poll_now())
    }

    /// Complete now, returning whether this call won.
    ///
    /// Waiters are resumed in FIFO order after the lock is released.
    pub(crate) fn complete_now(&self, exit: Exit<E, A>) -> bool {
        let waiters = self.state.modify_now(|s| {
            if let DeferredState::Pending { waiters, .. } = s {
                let waiters = std::mem::take(waiters);
                *s = DeferredState::Done(exit.clone());
                Some(waiters)
            } else {
                None
            }
        });
        match waiters {
            Some(waiters) => {
                tracing::trace!(deferred = self.state.id(), waiters = waiters.len(), "deferred completed");
                for (_, callback) in waiters {
                    callback.complete(exit.clone());
                }
                true
            }
            None => false,
        }
    }

    /// The stored exit right now, outside any fiber.
    pub(crate) fn poll_now(&self) -> Option<Exit<E, A>> {
        self.state.modify_now(|s| match s {
            DeferredState::Done(exit) => Some(exit.clone()),
            DeferredState::Pending { .. } => None,
        })
    }

    /// Number of fibers currently waiting.
    pub(crate) fn waiter_count(&self) -> usize {
        self.state.modify_now(|s| match s {
            DeferredState::Pending { waiters, .. } => waiters.len(),
            DeferredState::Done(_) => 0,
        })
    }
}
