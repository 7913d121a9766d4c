//! Cooperative Cancellation
//!
//! Building blocks the driver uses to interrupt fibers.
//!
//! # Components
//!
//! - [`Canceler`]: the thunk an async registration returns; invoked at most once
//!   if the fiber is interrupted while suspended on that registration.
//! - [`InterruptStatus`]: whether the current region may be interrupted.
//! - [`MaskStack`]: the per-fiber stack of nested interrupt masks.
//!
//! # Masking
//!
//! A region is interruptible unless some enclosing region says otherwise, so
//! the stack stores the *effective* status of each frame: pushing anything
//! beneath an uninterruptible frame pushes `Uninterruptible`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation thunk returned by an async registration.
#[derive(Default)]
pub struct Canceler {
    thunk: Option<Box<dyn FnOnce() + Send>>,
}

impl Canceler {
    /// Create a canceler from a thunk.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            thunk: Some(Box::new(f)),
        }
    }

    /// A canceler that does nothing.
    pub fn none() -> Self {
        Self { thunk: None }
    }

    /// Check if cancelling would run anything.
    pub fn is_noop(&self) -> bool {
        self.thunk.is_none()
    }

    /// Run the cancellation thunk.
    pub fn cancel(mut self) {
        if let Some(thunk) = self.thunk.take() {
            thunk();
        }
    }
}

impl fmt::Debug for Canceler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Canceler")
            .field("noop", &self.is_noop())
            .finish()
    }
}

/// A shared, one-way cancellation flag.
///
/// Clones observe the same flag. Used for work that cannot be removed from
/// where it was queued (timers), which instead checks the flag before running.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    cancelled: Arc<AtomicBool>,
}

impl CancelFlag {
    /// Create an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Check if the flag is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A canceler that sets this flag.
    pub fn canceler(&self) -> Canceler {
        let flag = self.clone();
        Canceler::new(move || flag.cancel())
    }
}

/// Interruptibility of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptStatus {
    /// Interrupt requests short-circuit the next step.
    #[default]
    Interruptible,
    /// Interrupt requests are recorded and honored after the region.
    Uninterruptible,
}

impl InterruptStatus {
    /// Check if this status allows interruption.
    pub fn is_interruptible(self) -> bool {
        self == InterruptStatus::Interruptible
    }
}

/// Stack of nested interrupt masks owned by one fiber.
#[derive(Debug, Default)]
pub struct MaskStack {
    frames: Vec<InterruptStatus>,
}

impl MaskStack {
    /// Create an empty (interruptible) stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current effective status.
    pub fn status(&self) -> InterruptStatus {
        self.frames.last().copied().unwrap_or_default()
    }

    /// Check if the fiber is currently interruptible.
    pub fn is_interruptible(&self) -> bool {
        self.status().is_interruptible()
    }

    /// Enter a region.
    pub fn push(&mut self, status: InterruptStatus) {
        let effective = match self.status() {
            InterruptStatus::Uninterruptible => InterruptStatus::Uninterruptible,
            InterruptStatus::Interruptible => status,
        };
        self.frames.push(effective);
    }

    /// Leave the innermost region.
    pub fn pop(&mut self) {
        self.frames.pop();
    }

    /// Number of open regions.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

// ============================================================================
// Tests
// ============================================================================
