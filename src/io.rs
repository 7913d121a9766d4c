//! # Effect Algebra
//!
//! [`IO<E, A>`] is an inert description of a computation that either produces
//! an `A` or stops with a [`Cause<E>`]. Nothing runs when a description is
//! built; a [`Runtime`] interprets it later on a fiber.
//!
//! ## Structure
//!
//! Every description is a node of the closed `Step` union:
//!
//! | Variant | Meaning |
//! |---------|---------|
//! | `Succeeded` | trivial success |
//! | `Caused` | trivial failure, abort or interruption |
//! | `Complete` | a pre-computed exit |
//! | `Suspend` | deferred construction; the only synchronous side-effect entry |
//! | `Async` | callback registration returning a [`Canceler`] |
//! | `Chain` | sequential composition, short-circuits on any cause |
//! | `Fold` | the only node that intercepts a cause |
//! | `GetRuntime` | the ambient runtime handle |
//! | `Region` | an interrupt-mask region |
//!
//! Descriptions are immutable and shared through `Arc`, so one `IO` can be
//! composed into many others and run any number of times.
//!
//! ## Example
//!
//! ```rust,ignore
//! use effect_runtime::{IO, Runtime};
//!
//! let program: IO<String, i32> = IO::succeed(20)
//!     .map(|n| n + 1)
//!     .chain(|n| if n > 0 { IO::succeed(n * 2) } else { IO::fail("negative".into()) });
//!
//! let exit = Runtime::global().block_on(&program);
//! assert_eq!(exit.value(), Some(&42));
//! ```

use std::convert::Infallible;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;

use crate::cancellation::{Canceler, InterruptStatus};
use crate::continuation::{
    downcast, downcast_cause, erase, erase_cause, erase_exit, Bind, ErasedCause, ErasedExit,
    Next, Recover, Value,
};
use crate::driver::Resume;
use crate::exit::{Cause, Defect, Exit};
use crate::scheduler::Runtime;

/// An effect that cannot fail.
pub type UIO<A> = IO<Infallible, A>;

/// Async registration: receives the resumption handle, returns a canceler.
pub(crate) type AsyncOp = Box<dyn Fn(Resume) -> Canceler + Send + Sync>;

// ============================================================================
// Step
// ============================================================================

/// One node of an effect description.
pub(crate) enum Step {
    Succeeded(Box<dyn Fn() -> Value + Send + Sync>),
    Caused(Box<dyn Fn() -> ErasedCause + Send + Sync>),
    Complete(Box<dyn Fn() -> ErasedExit + Send + Sync>),
    Suspend(Box<dyn Fn() -> Next + Send + Sync>),
    Async(AsyncOp),
    Chain(Arc<Step>, Bind),
    Fold(Arc<Step>, Bind, Recover),
    GetRuntime,
    Region(Arc<Step>, InterruptStatus),
}

impl Step {
    fn tag(&self) -> &'static str {
        match self {
            Step::Succeeded(_) => "succeeded",
            Step::Caused(_) => "caused",
            Step::Complete(_) => "complete",
            Step::Suspend(_) => "suspend",
            Step::Async(_) => "async",
            Step::Chain(..) => "chain",
            Step::Fold(..) => "fold",
            Step::GetRuntime => "get-runtime",
            Step::Region(..) => "region",
        }
    }

    /// Swap the left child out for a shared leaf.
    fn detach_child(&mut self) -> Option<Arc<Step>> {
        match self {
            Step::Chain(left, _) | Step::Fold(left, _, _) | Step::Region(left, _) => {
                Some(std::mem::replace(left, leaf()))
            }
            _ => None,
        }
    }
}

/// Shared childless node used while tearing down deep trees.
fn leaf() -> Arc<Step> {
    static LEAF: OnceLock<Arc<Step>> = OnceLock::new();
    LEAF.get_or_init(|| Arc::new(Step::GetRuntime)).clone()
}

impl Drop for Step {
    // Left-nested chains can be tens of thousands deep; unlink them iteratively.
    fn drop(&mut self) {
        let mut next = self.detach_child();
        while let Some(child) = next.take() {
            if let Ok(mut step) = Arc::try_unwrap(child) {
                next = step.detach_child();
            }
        }
    }
}

/// Hand a captured value over exactly once from an `Fn` closure.
///
/// Continuations built inside a bind belong to a single run, so the value is
/// only ever taken once; a second take reports a defect.
fn once<T: Send + 'static>(value: T) -> impl Fn() -> Result<T, Defect> + Send + Sync {
    let cell = Mutex::new(Some(value));
    move || {
        cell.lock()
            .take()
            .ok_or_else(|| Defect::from("continuation resumed twice"))
    }
}

// ============================================================================
// IO
// ============================================================================

/// An inert, shareable effect description.
pub struct IO<E, A> {
    pub(crate) step: Arc<Step>,
    _marker: PhantomData<fn() -> (E, A)>,
}

impl<E, A> Clone for IO<E, A> {
    fn clone(&self) -> Self {
        Self::from_arc(self.step.clone())
    }
}

impl<E, A> fmt::Debug for IO<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IO({})", self.step.tag())
    }
}

impl<E, A> IO<E, A> {
    pub(crate) fn from_step(step: Step) -> Self {
        Self::from_arc(Arc::new(step))
    }

    pub(crate) fn from_arc(step: Arc<Step>) -> Self {
        Self {
            step,
            _marker: PhantomData,
        }
    }

    /// Wrap this description in an uninterruptible region.
    ///
    /// Interrupt requests that arrive inside the region are recorded and
    /// honored at the next interruptible step after it.
    pub fn uninterruptible(self) -> Self {
        Self::from_step(Step::Region(self.step, InterruptStatus::Uninterruptible))
    }
}

impl<A> IO<Infallible, A> {
    /// Re-type an effect that cannot fail.
    pub fn widen<E>(self) -> IO<E, A> {
        IO::from_arc(self.step)
    }
}

impl<E, A> IO<E, IO<E, A>>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run the produced effect.
    pub fn flatten(self) -> IO<E, A> {
        self.chain(|inner| inner)
    }
}

// ----------------------------------------------------------------------------
// Constructors
// ----------------------------------------------------------------------------

impl<E, A> IO<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Succeed with a value.
    pub fn succeed(value: A) -> Self
    where
        A: Clone + Sync,
    {
        Self::from_step(Step::Succeeded(Box::new(move || erase(value.clone()))))
    }

    /// Fail with an expected error.
    pub fn fail(error: E) -> Self
    where
        E: Clone + Sync,
    {
        Self::caused(Cause::Failed(error))
    }

    /// Stop with a defect.
    pub fn abort(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Self::from_step(Step::Caused(Box::new(move || {
            Cause::Aborted(defect.clone())
        })))
    }

    /// Stop as if interrupted.
    pub fn interrupted() -> Self {
        Self::from_step(Step::Caused(Box::new(|| Cause::Interrupted)))
    }

    /// Stop with the given cause.
    pub fn caused(cause: Cause<E>) -> Self
    where
        E: Clone + Sync,
    {
        Self::from_step(Step::Caused(Box::new(move || erase_cause(cause.clone()))))
    }

    /// Re-inject a pre-computed exit.
    pub fn completed(exit: Exit<E, A>) -> Self
    where
        E: Clone + Sync,
        A: Clone + Sync,
    {
        Self::from_step(Step::Complete(Box::new(move || erase_exit(exit.clone()))))
    }

    /// Re-inject an exit owned by a single run.
    pub(crate) fn exit_once(exit: Exit<E, A>) -> Self {
        let take = once(erase_exit(exit));
        Self::from_step(Step::Suspend(Box::new(move || match take() {
            Ok(exit) => Next::from_exit(exit),
            Err(defect) => Next::Cause(Cause::Aborted(defect)),
        })))
    }

    /// Run a synchronous computation when the driver reaches it.
    ///
    /// A panic inside `f` becomes an `Aborted` cause.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn() -> A + Send + Sync + 'static,
    {
        Self::from_step(Step::Suspend(Box::new(move || Next::Value(erase(f())))))
    }

    /// Run a synchronous computation that may fail with a typed error.
    pub fn try_sync<F>(f: F) -> Self
    where
        F: Fn() -> Result<A, E> + Send + Sync + 'static,
    {
        Self::from_step(Step::Suspend(Box::new(move || match f() {
            Ok(a) => Next::Value(erase(a)),
            Err(e) => Next::Cause(Cause::Failed(erase(e))),
        })))
    }

    /// Build the effect lazily, once per run.
    pub fn suspend<F>(f: F) -> Self
    where
        F: Fn() -> IO<E, A> + Send + Sync + 'static,
    {
        Self::from_step(Step::Suspend(Box::new(move || Next::Eval(f().step))))
    }

    /// Register a callback-based operation.
    ///
    /// `op` runs once per run and must eventually complete the callback at
    /// most once. The returned [`Canceler`] runs if the fiber is interrupted
    /// while waiting. The callback may also fire before `op` returns.
    pub fn async_<F>(op: F) -> Self
    where
        F: Fn(Callback<E, A>) -> Canceler + Send + Sync + 'static,
    {
        Self::from_step(Step::Async(Box::new(move |resume| {
            op(Callback::new(resume))
        })))
    }

    /// An effect that never completes unless interrupted.
    pub fn never() -> Self {
        Self::from_step(Step::Async(Box::new(|_resume| Canceler::none())))
    }
}

impl<A> IO<Infallible, A>
where
    A: Send + 'static,
{
    /// Register a callback-based operation that cannot fail.
    pub fn async_total<F>(op: F) -> Self
    where
        F: Fn(Box<dyn FnOnce(A) + Send>) -> Canceler + Send + Sync + 'static,
    {
        IO::async_(move |callback: Callback<Infallible, A>| {
            op(Box::new(move |value| callback.succeed(value)))
        })
    }
}

impl<E> IO<E, Runtime>
where
    E: Send + 'static,
{
    /// Access the runtime the fiber runs on.
    pub fn runtime() -> Self {
        Self::from_step(Step::GetRuntime)
    }
}

impl<E> IO<E, ()>
where
    E: Send + 'static,
{
    /// Succeed with `()`.
    pub fn unit_value() -> Self {
        Self::succeed(())
    }

    /// Suspend the fiber for `duration` using the runtime's timers.
    pub fn sleep(duration: Duration) -> Self {
        IO::<E, Runtime>::runtime().chain(move |runtime| {
            IO::async_(move |callback: Callback<E, ()>| {
                runtime.schedule_after(duration, move || callback.succeed(()))
            })
        })
    }
}

// ----------------------------------------------------------------------------
// Combinators
// ----------------------------------------------------------------------------

impl<E, A> IO<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Transform the value.
    pub fn map<B, F>(self, f: F) -> IO<E, B>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        IO::from_step(Step::Chain(
            self.step,
            Arc::new(move |v| {
                Next::from_result(downcast::<A>(v).map(|a| Next::Value(erase(f(a)))))
            }),
        ))
    }

    /// Sequence a dependent effect. Skipped on any cause.
    pub fn chain<B, F>(self, f: F) -> IO<E, B>
    where
        B: Send + 'static,
        F: Fn(A) -> IO<E, B> + Send + Sync + 'static,
    {
        IO::from_step(Step::Chain(
            self.step,
            Arc::new(move |v| Next::from_result(downcast::<A>(v).map(|a| Next::Eval(f(a).step)))),
        ))
    }

    /// Handle both outcomes. Exactly one branch runs.
    ///
    /// The failure branch receives the full [`Cause`], including the fiber's
    /// own interruption, so it can tell failures, defects and interruption
    /// apart.
    pub fn fold<E2, B, S, F>(self, on_success: S, on_failure: F) -> IO<E2, B>
    where
        E2: Send + 'static,
        B: Send + 'static,
        S: Fn(A) -> IO<E2, B> + Send + Sync + 'static,
        F: Fn(Cause<E>) -> IO<E2, B> + Send + Sync + 'static,
    {
        IO::from_step(Step::Fold(
            self.step,
            Arc::new(move |v| {
                Next::from_result(downcast::<A>(v).map(|a| Next::Eval(on_success(a).step)))
            }),
            Arc::new(move |c| Next::Eval(on_failure(downcast_cause::<E>(c)).step)),
        ))
    }

    /// Recover from an expected error. Defects and interruption pass through.
    pub fn chain_error<E2, F>(self, f: F) -> IO<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> IO<E2, A> + Send + Sync + 'static,
    {
        IO::from_step(Step::Fold(
            self.step,
            Arc::new(Next::Value),
            Arc::new(move |c| match c {
                Cause::Failed(e) => {
                    Next::from_result(downcast::<E>(e).map(|e| Next::Eval(f(e).step)))
                }
                other => Next::Cause(other),
            }),
        ))
    }

    /// Transform the expected error.
    pub fn map_error<E2, F>(self, f: F) -> IO<E2, A>
    where
        E2: Send + 'static,
        F: Fn(E) -> E2 + Send + Sync + 'static,
    {
        IO::from_step(Step::Fold(
            self.step,
            Arc::new(Next::Value),
            Arc::new(move |c| match c {
                Cause::Failed(e) => Next::from_result(
                    downcast::<E>(e).map(|e| Next::Cause(Cause::Failed(erase(f(e))))),
                ),
                other => Next::Cause(other),
            }),
        ))
    }

    /// Capture the outcome as a value. Never fails.
    pub fn result(self) -> UIO<Exit<E, A>> {
        IO::from_step(Step::Fold(
            self.step,
            Arc::new(|v| {
                Next::from_result(
                    downcast::<A>(v).map(|a| Next::Value(erase(Exit::<E, A>::Value(a)))),
                )
            }),
            Arc::new(|c| Next::Value(erase(Exit::<E, A>::Cause(downcast_cause::<E>(c))))),
        ))
    }

    /// Run `other` after this effect and combine both values.
    pub fn zip_with<B, C, F>(self, other: IO<E, B>, f: F) -> IO<E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let right = other.step;
        IO::from_step(Step::Chain(
            self.step,
            Arc::new(move |va| {
                let f = f.clone();
                let take_left = once(va);
                Next::Eval(Arc::new(Step::Chain(
                    right.clone(),
                    Arc::new(move |vb| {
                        Next::from_result(take_left().and_then(|va| {
                            let a = downcast::<A>(va)?;
                            let b = downcast::<B>(vb)?;
                            Ok(Next::Value(erase(f(a, b))))
                        }))
                    }),
                )))
            }),
        ))
    }

    /// Run `other` after this effect and pair both values.
    pub fn zip<B>(self, other: IO<E, B>) -> IO<E, (A, B)>
    where
        B: Send + 'static,
    {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Alias of [`IO::zip_with`].
    pub fn map2<B, C, F>(self, other: IO<E, B>, f: F) -> IO<E, C>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: Fn(A, B) -> C + Send + Sync + 'static,
    {
        self.zip_with(other, f)
    }

    /// Apply a function produced by `iof` to this effect's value.
    pub fn ap<B, F>(self, iof: IO<E, F>) -> IO<E, B>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        self.zip_with(iof, |a, f| f(a))
    }

    /// Run both, keep the first value.
    pub fn apply_first<B>(self, other: IO<E, B>) -> IO<E, A>
    where
        B: Send + 'static,
    {
        self.zip_with(other, |a, _| a)
    }

    /// Run both, keep the second value.
    pub fn apply_second<B>(self, other: IO<E, B>) -> IO<E, B>
    where
        B: Send + 'static,
    {
        self.chain(move |_| other.clone())
    }

    /// Replace the value.
    pub fn as_value<B>(self, value: B) -> IO<E, B>
    where
        B: Clone + Send + Sync + 'static,
    {
        self.map(move |_| value.clone())
    }

    /// Discard the value.
    pub fn unit(self) -> IO<E, ()> {
        self.map(|_| ())
    }

    /// Run `finalizer` if this effect is interrupted, then stay interrupted.
    ///
    /// The finalizer runs uninterruptibly. Failures and defects pass through
    /// without running it.
    pub fn on_interrupted(self, finalizer: IO<E, ()>) -> Self {
        let finalizer = finalizer.uninterruptible().step;
        Self::from_step(Step::Fold(
            self.step,
            Arc::new(Next::Value),
            Arc::new(move |c| {
                if c.is_interrupted() {
                    Next::Eval(Arc::new(Step::Chain(
                        finalizer.clone(),
                        Arc::new(|_| Next::Cause(Cause::Interrupted)),
                    )))
                } else {
                    Next::Cause(c)
                }
            }),
        ))
    }

    /// Acquire a resource, use it, and release it exactly once.
    ///
    /// `self` is the acquisition and runs uninterruptibly. `release` receives
    /// the exit of `use_` (value, failure, defect or interruption) and also
    /// runs uninterruptibly. The overall exit is the exit of `use_` unless
    /// `release` itself fails.
    pub fn bracket_exit<B, R, U>(self, release: R, use_: U) -> IO<E, B>
    where
        A: Clone + Sync,
        B: Send + 'static,
        R: Fn(A, &Exit<E, B>) -> IO<E, ()> + Send + Sync + 'static,
        U: Fn(A) -> IO<E, B> + Send + Sync + 'static,
    {
        let release = Arc::new(release);
        let use_ = Arc::new(use_);
        self.uninterruptible().chain(move |resource: A| {
            let release = release.clone();
            let use_ = use_.clone();
            let held = resource.clone();
            // `use_` is invoked inside the fold so a panic there still releases.
            IO::suspend(move || use_(resource.clone()))
                .result()
                .widen::<E>()
                .chain(move |exit: Exit<E, B>| {
                    // The exit is re-raised inside the mask so a pending
                    // interrupt cannot replace a value `use_` produced.
                    release(held.clone(), &exit)
                        .apply_second(IO::exit_once(exit))
                        .uninterruptible()
                })
        })
    }

    /// [`IO::bracket_exit`] with a release that ignores the exit.
    pub fn bracket<B, R, U>(self, release: R, use_: U) -> IO<E, B>
    where
        A: Clone + Sync,
        B: Send + 'static,
        R: Fn(A) -> IO<E, ()> + Send + Sync + 'static,
        U: Fn(A) -> IO<E, B> + Send + Sync + 'static,
    {
        self.bracket_exit(move |a, _| release(a), use_)
    }
}

// ============================================================================
// Callback
// ============================================================================

/// One-shot completion handle passed to an [`IO::async_`] registration.
///
/// Consuming methods make a second completion impossible; a completion that
/// arrives after the fiber was interrupted is ignored.
pub struct Callback<E, A> {
    resume: Resume,
    _marker: PhantomData<fn(E, A)>,
}

impl<E, A> Callback<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    pub(crate) fn new(resume: Resume) -> Self {
        Self {
            resume,
            _marker: PhantomData,
        }
    }

    /// Resume with a value.
    pub fn succeed(self, value: A) {
        self.complete(Exit::Value(value));
    }

    /// Resume with an expected error.
    pub fn fail(self, error: E) {
        self.complete(Exit::failed(error));
    }

    /// Resume with a defect.
    pub fn abort(self, defect: impl Into<Defect>) {
        self.complete(Exit::aborted(defect));
    }

    /// Resume with a `Result`.
    pub fn result(self, result: Result<A, E>) {
        self.complete(result.into());
    }

    /// Resume with a full exit.
    pub fn complete(self, exit: Exit<E, A>) {
        self.resume.complete(erase_exit(exit));
    }
}

impl<E, A> fmt::Debug for Callback<E, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("fiber", &self.resume.fiber_id())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
