//! # Atomic Reference Cell
//!
//! [`Ref`] is a shared mutable cell whose reads and writes are effects.
//!
//! Every operation is a single critical section, so a `modify` is atomic with
//! respect to all other operations on the same cell regardless of which
//! thread completes the surrounding callbacks. The blocking primitives in
//! this crate (deferred, semaphore, queue) keep their state in a `Ref`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::io::{IO, UIO};

/// Counter for cell IDs.
static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Shared mutable cell with effectful access.
pub struct Ref<S> {
    id: u64,
    cell: Arc<Mutex<S>>,
}

impl<S> Clone for Ref<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            cell: self.cell.clone(),
        }
    }
}

impl<S> fmt::Debug for Ref<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref").field("id", &self.id).finish()
    }
}

impl<S> Ref<S> {
    /// Create a cell immediately.
    pub fn new(initial: S) -> Self {
        Self {
            id: NEXT_REF_ID.fetch_add(1, Ordering::Relaxed),
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    /// Get the cell ID for debugging.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Check if both handles point at the same cell.
    pub fn ptr_eq(&self, other: &Ref<S>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    /// Run `f` under the lock right now, outside any fiber.
    ///
    /// `f` must not touch this cell again.
    pub(crate) fn modify_now<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut *self.cell.lock())
    }
}

impl<S> Ref<S>
where
    S: Send + 'static,
{
    /// Allocate a fresh cell each time the effect runs.
    pub fn make(initial: S) -> UIO<Ref<S>>
    where
        S: Clone + Sync,
    {
        IO::sync(move || Ref::new(initial.clone()))
    }

    /// Read the current value.
    pub fn get(&self) -> UIO<S>
    where
        S: Clone,
    {
        let cell = self.cell.clone();
        IO::sync(move || cell.lock().clone())
    }

    /// Replace the value.
    pub fn set(&self, value: S) -> UIO<()>
    where
        S: Clone + Sync,
    {
        let cell = self.cell.clone();
        IO::sync(move || *cell.lock() = value.clone())
    }

    /// Replace the value with `f` of the current value.
    pub fn update<F>(&self, f: F) -> UIO<()>
    where
        F: Fn(&S) -> S + Send + Sync + 'static,
    {
        self.modify(move |state| *state = f(state))
    }

    /// [`Ref::update`], returning the new value.
    pub fn update_and_get<F>(&self, f: F) -> UIO<S>
    where
        S: Clone,
        F: Fn(&S) -> S + Send + Sync + 'static,
    {
        self.modify(move |state| {
            *state = f(state);
            state.clone()
        })
    }

    /// Atomically transform the value and compute a result from it.
    pub fn modify<R, F>(&self, f: F) -> UIO<R>
    where
        R: Send + 'static,
        F: Fn(&mut S) -> R + Send + Sync + 'static,
    {
        let cell = self.cell.clone();
        IO::sync(move || f(&mut *cell.lock()))
    }
}
