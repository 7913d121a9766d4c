//! # Exit Model
//!
//! The tagged outcome of a completed effect.
//!
//! An effect terminates with exactly one [`Exit`]: either a value, or a
//! [`Cause`] explaining why no value was produced.
//!
//! ## Causes
//!
//! | Cause | Meaning | Recovered by |
//! |-------|---------|--------------|
//! | `Failed(E)` | expected, typed application error | `fold`, `chain_error` |
//! | `Aborted(Defect)` | unexpected defect (a panic, an `abort`) | supervisors only |
//! | `Interrupted` | cooperative cancellation, carries no payload | finalizers |

use std::any::Any;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Defect
// ============================================================================

/// An untyped defect carried by [`Cause::Aborted`].
///
/// Defects are opaque payloads. The common case is a panic message, which
/// [`Defect::message`] exposes without downcasting.
#[derive(Clone)]
pub struct Defect {
    payload: Arc<dyn Any + Send + Sync>,
}

impl Defect {
    /// Wrap an arbitrary payload as a defect.
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// Get the defect message, if the payload is a string.
    pub fn message(&self) -> Option<&str> {
        if let Some(s) = self.payload.downcast_ref::<&'static str>() {
            return Some(s);
        }
        self.payload.downcast_ref::<String>().map(String::as_str)
    }

    /// Borrow the payload as a concrete type.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.debug_tuple("Defect").field(&msg).finish(),
            None => f.write_str("Defect(<opaque>)"),
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message().unwrap_or("<opaque defect>"))
    }
}

impl PartialEq for Defect {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.payload, &other.payload) {
            return true;
        }
        match (self.message(), other.message()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&'static str> for Defect {
    fn from(msg: &'static str) -> Self {
        Defect::new(msg)
    }
}

impl From<String> for Defect {
    fn from(msg: String) -> Self {
        Defect::new(msg)
    }
}

// ============================================================================
// Cause
// ============================================================================

/// The reason an effect did not produce a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// Expected application error.
    Failed(E),
    /// Unexpected defect.
    Aborted(Defect),
    /// Cooperative cancellation.
    Interrupted,
}

impl<E> Cause<E> {
    /// Check if this is an expected failure.
    pub fn is_failed(&self) -> bool {
        matches!(self, Cause::Failed(_))
    }

    /// Check if this is a defect.
    pub fn is_aborted(&self) -> bool {
        matches!(self, Cause::Aborted(_))
    }

    /// Check if this is an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Cause::Interrupted)
    }

    /// Borrow the typed error of a `Failed` cause.
    pub fn failure(&self) -> Option<&E> {
        match self {
            Cause::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Transform the typed error, leaving defects and interruption untouched.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2) -> Cause<E2> {
        match self {
            Cause::Failed(e) => Cause::Failed(f(e)),
            Cause::Aborted(d) => Cause::Aborted(d),
            Cause::Interrupted => Cause::Interrupted,
        }
    }
}

impl<E: fmt::Debug> fmt::Display for Cause<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cause::Failed(e) => write!(f, "failed: {:?}", e),
            Cause::Aborted(d) => write!(f, "aborted: {}", d),
            Cause::Interrupted => f.write_str("interrupted"),
        }
    }
}

// ============================================================================
// Exit
// ============================================================================

/// The terminal outcome of an effect.
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<E, A> {
    /// The effect produced a value.
    Value(A),
    /// The effect did not produce a value.
    Cause(Cause<E>),
}

impl<E, A> Exit<E, A> {
    /// Exit with an expected failure.
    pub fn failed(error: E) -> Self {
        Exit::Cause(Cause::Failed(error))
    }

    /// Exit with a defect.
    pub fn aborted(defect: impl Into<Defect>) -> Self {
        Exit::Cause(Cause::Aborted(defect.into()))
    }

    /// Exit by interruption.
    pub fn interrupted() -> Self {
        Exit::Cause(Cause::Interrupted)
    }

    /// Check if the exit carries a value.
    pub fn is_value(&self) -> bool {
        matches!(self, Exit::Value(_))
    }

    /// Check if the exit is an interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Cause(Cause::Interrupted))
    }

    /// Borrow the value, if any.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Value(a) => Some(a),
            Exit::Cause(_) => None,
        }
    }

    /// Borrow the cause, if any.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Value(_) => None,
            Exit::Cause(c) => Some(c),
        }
    }

    /// Transform the value.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<E, B> {
        match self {
            Exit::Value(a) => Exit::Value(f(a)),
            Exit::Cause(c) => Exit::Cause(c),
        }
    }

    /// Transform the typed error.
    pub fn map_error<E2>(self, f: impl FnOnce(E) -> E2) -> Exit<E2, A> {
        match self {
            Exit::Value(a) => Exit::Value(a),
            Exit::Cause(c) => Exit::Cause(c.map_error(f)),
        }
    }

    /// Collapse both branches into one value.
    pub fn fold<B>(self, on_value: impl FnOnce(A) -> B, on_cause: impl FnOnce(Cause<E>) -> B) -> B {
        match self {
            Exit::Value(a) => on_value(a),
            Exit::Cause(c) => on_cause(c),
        }
    }

    /// Get the value or a default.
    pub fn get_or(self, default: A) -> A {
        match self {
            Exit::Value(a) => a,
            Exit::Cause(_) => default,
        }
    }

    /// Convert into a `Result`, keeping the full cause on the error side.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Value(a) => Ok(a),
            Exit::Cause(c) => Err(c),
        }
    }
}

impl<E, A> From<Result<A, E>> for Exit<E, A> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Value(a),
            Err(e) => Exit::failed(e),
        }
    }
}

impl<E, A> From<Cause<E>> for Exit<E, A> {
    fn from(cause: Cause<E>) -> Self {
        Exit::Cause(cause)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defect_message() {
        assert_eq!(Defect::from("boom").message(), Some("boom"));
        assert_eq!(Defect::from(String::from("bang")).message(), Some("bang"));
        assert_eq!(Defect::new(42u32).message(), None);
        assert_eq!(Defect::new(42u32).downcast_ref::<u32>(), Some(&42));
    }

    #[test]
    fn test_defect_equality() {
        let opaque = Defect::new(7u8);
        assert_eq!(opaque, opaque.clone());
        assert_ne!(opaque, Defect::new(7u8));
        assert_eq!(Defect::from("x"), Defect::from(String::from("x")));
    }

    #[test]
    fn test_cause_map_error() {
        let c: Cause<u8> = Cause::Failed(2);
        assert_eq!(c.map_error(|e| e as u32 * 10), Cause::Failed(20u32));
        let i: Cause<u8> = Cause::Interrupted;
        assert!(i.map_error(|e| e as u32).is_interrupted());
    }

    #[test]
    fn test_exit_fold_and_result() {
        let ok: Exit<&str, i32> = Exit::Value(3);
        assert_eq!(ok.clone().fold(|v| v * 2, |_| 0), 6);
        assert_eq!(ok.into_result(), Ok(3));

        let err: Exit<&str, i32> = Exit::failed("nope");
        assert_eq!(err.clone().get_or(-1), -1);
        assert_eq!(err.cause().and_then(Cause::failure), Some(&"nope"));
        assert_eq!(err.into_result(), Err(Cause::Failed("nope")));
    }

    #[test]
    fn test_exit_from_result() {
        let exit: Exit<String, u8> = Ok(1).into();
        assert!(exit.is_value());
        let exit: Exit<String, u8> = Err("bad".to_string()).into();
        assert!(!exit.is_value());
        assert!(!exit.is_interrupted());
    }
}
