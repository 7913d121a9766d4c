//! # Continuations for the Effect Driver
//!
//! The driver never recurses into an effect description. Instead it keeps an
//! explicit stack of continuation [`Frame`]s on the heap and walks the
//! description in a loop, which keeps it stack-safe for arbitrarily deep
//! compositions.
//!
//! ## Erasure
//!
//! Frames of one fiber carry closures over many different types, so values and
//! errors travel through the trampoline type-erased as [`Value`]s. The typed
//! API in [`crate::io`] erases on the way in and downcasts on the way out;
//! a failed downcast means the typed layer was bypassed and surfaces as a
//! defect rather than a panic.
//!
//! ## One-Shot
//!
//! A frame is popped exactly once, so every continuation is resumed at most
//! once per run. The closures themselves are `Fn` because the description that
//! owns them may be run again by another fiber.

use std::any::Any;
use std::sync::Arc;

use crate::exit::{Cause, Defect, Exit};
use crate::io::Step;

/// A type-erased value or error.
pub(crate) type Value = Box<dyn Any + Send>;

/// A cause whose typed error is erased.
pub(crate) type ErasedCause = Cause<Value>;

/// An exit whose value and error are erased.
pub(crate) type ErasedExit = Exit<Value, Value>;

/// Continuation applied to a successful value.
pub(crate) type Bind = Arc<dyn Fn(Value) -> Next + Send + Sync>;

/// Continuation applied to a cause.
pub(crate) type Recover = Arc<dyn Fn(ErasedCause) -> Next + Send + Sync>;

/// What the trampoline does next.
pub(crate) enum Next {
    /// Evaluate a description.
    Eval(Arc<Step>),
    /// Feed a value to the innermost continuation.
    Value(Value),
    /// Unwind with a cause.
    Cause(ErasedCause),
}

impl Next {
    /// Re-inject a completed exit.
    pub(crate) fn from_exit(exit: ErasedExit) -> Self {
        match exit {
            Exit::Value(v) => Next::Value(v),
            Exit::Cause(c) => Next::Cause(c),
        }
    }

    /// Wrap a downcast result, turning a mismatch into a defect.
    pub(crate) fn from_result(result: Result<Next, Defect>) -> Self {
        result.unwrap_or_else(|defect| Next::Cause(Cause::Aborted(defect)))
    }
}

/// A pending continuation on a fiber's stack.
pub(crate) enum Frame {
    /// Apply `bind` on success, skip on any cause.
    Chain(Bind),
    /// Exactly one branch runs, chosen by the outcome.
    Fold {
        /// Success branch.
        success: Bind,
        /// Failure branch.
        failure: Recover,
    },
    /// Leave an interrupt-mask region.
    Region,
}

/// A fiber's continuation stack.
#[derive(Default)]
pub(crate) struct ContinuationStack {
    frames: Vec<Frame>,
}

impl ContinuationStack {
    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }
}

// ============================================================================
// Erasure helpers
// ============================================================================

/// Erase a value.
pub(crate) fn erase<T: Any + Send>(value: T) -> Value {
    Box::new(value)
}

/// Recover a typed value.
pub(crate) fn downcast<T: Any>(value: Value) -> Result<T, Defect> {
    value.downcast::<T>().map(|b| *b).map_err(|_| {
        Defect::from(format!(
            "effect value type mismatch: expected {}",
            std::any::type_name::<T>()
        ))
    })
}

/// Erase the error of a cause.
pub(crate) fn erase_cause<E: Any + Send>(cause: Cause<E>) -> ErasedCause {
    cause.map_error(erase)
}

/// Recover a typed cause. A mismatched error becomes a defect.
pub(crate) fn downcast_cause<E: Any>(cause: ErasedCause) -> Cause<E> {
    match cause {
        Cause::Failed(e) => match downcast::<E>(e) {
            Ok(e) => Cause::Failed(e),
            Err(defect) => Cause::Aborted(defect),
        },
        Cause::Aborted(d) => Cause::Aborted(d),
        Cause::Interrupted => Cause::Interrupted,
    }
}

/// Erase both sides of an exit.
pub(crate) fn erase_exit<E: Any + Send, A: Any + Send>(exit: Exit<E, A>) -> ErasedExit {
    match exit {
        Exit::Value(a) => Exit::Value(erase(a)),
        Exit::Cause(c) => Exit::Cause(erase_cause(c)),
    }
}

/// Recover a typed exit.
pub(crate) fn downcast_exit<E: Any, A: Any>(exit: ErasedExit) -> Exit<E, A> {
    match exit {
        Exit::Value(v) => match downcast::<A>(v) {
            Ok(a) => Exit::Value(a),
            Err(defect) => Exit::Cause(Cause::Aborted(defect)),
        },
        Exit::Cause(c) => Exit::Cause(downcast_cause(c)),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_roundtrip() {
        let v = erase(42u32);
        assert_eq!(downcast::<u32>(v).unwrap(), 42);
    }

    #[test]
    fn test_downcast_mismatch_is_defect() {
        let err = downcast::<String>(erase(1u8)).unwrap_err();
        assert!(err.message().unwrap().contains("type mismatch"));
    }

    #[test]
    fn test_downcast_cause_mismatch() {
        let cause = downcast_cause::<u64>(Cause::Failed(erase("text")));
        assert!(cause.is_aborted());
        let cause = downcast_cause::<u64>(Cause::Interrupted);
        assert!(cause.is_interrupted());
    }

    #[test]
    fn test_exit_erasure() {
        let exit: Exit<String, i32> = Exit::failed("bad".into());
        let back: Exit<String, i32> = downcast_exit(erase_exit(exit.clone()));
        assert_eq!(back, exit);
    }

    #[test]
    fn test_stack_is_lifo() {
        let mut stack = ContinuationStack::default();
        stack.push(Frame::Region);
        stack.push(Frame::Chain(Arc::new(Next::Value)));
        assert_eq!(stack.len(), 2);
        assert!(matches!(stack.pop(), Some(Frame::Chain(_))));
        assert!(matches!(stack.pop(), Some(Frame::Region)));
        assert!(stack.pop().is_none());
    }
}
