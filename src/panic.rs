//! Panic Capture
//!
//! Converts panics raised inside user closures into [`Defect`]s.
//!
//! The driver runs every user-supplied closure (thunks, binds, fold branches,
//! async registrations) through [`catch_defect`], so a panicking closure turns
//! into `Cause::Aborted` for the running fiber instead of unwinding through the
//! event loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::exit::Defect;

/// Counter for panics converted into defects.
static CAUGHT_PANICS: AtomicU64 = AtomicU64::new(0);

/// Run a closure, converting a panic into a [`Defect`].
///
/// The closure is treated as unwind-safe: after a panic the only state the
/// runtime touches again is the driver's own frame stack, which is not shared
/// with the closure.
pub fn catch_defect<T>(f: impl FnOnce() -> T) -> Result<T, Defect> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            CAUGHT_PANICS.fetch_add(1, Ordering::Relaxed);
            let defect = defect_from_payload(payload);
            tracing::warn!(defect = %defect, "panic converted into defect");
            Err(defect)
        }
    }
}

/// Extract a defect from a panic payload.
///
/// String payloads keep their message; anything else becomes an opaque
/// "unknown panic" defect since the payload is not `Sync`.
pub fn defect_from_payload(payload: Box<dyn Any + Send>) -> Defect {
    if let Some(s) = payload.downcast_ref::<&str>() {
        Defect::from(s.to_string())
    } else if let Some(s) = payload.downcast_ref::<String>() {
        Defect::from(s.clone())
    } else {
        Defect::from("unknown panic")
    }
}

/// Number of panics converted into defects since process start.
pub fn caught_panic_count() -> u64 {
    CAUGHT_PANICS.load(Ordering::Relaxed)
}
