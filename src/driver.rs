//! # Effect Driver
//!
//! The trampolined interpreter that runs one effect description on one fiber.
//!
//! ## Design
//!
//! The driver walks the description in a loop. Composition nodes push a
//! [`Frame`] onto a heap-allocated [`ContinuationStack`], so host stack usage
//! is constant no matter how deeply effects are nested.
//!
//! ```text
//!            Eval(step) ──► push frames / run thunk
//!                 │
//!        ┌────────┴────────┐
//!        ▼                 ▼
//!   Value(v)           Cause(c)
//!   pop Chain/Fold     skip Chain, run Fold failure
//!        │                 │
//!        └──── empty stack ┴──► finish(exit)
//! ```
//!
//! ## Phases
//!
//! | Phase | Meaning |
//! |-------|---------|
//! | `Created` | built, not yet dispatched |
//! | `Running` | the loop owns the fiber |
//! | `Registering` | an async operation is being registered; early results land here |
//! | `Suspended` | parked on an async operation; the run state is stored |
//! | `Done` | the exit has been delivered |
//!
//! Every async registration bumps an epoch. A [`Resume`] remembers the epoch
//! it was created with and is ignored if the fiber has moved on, which makes
//! late callbacks after interruption harmless.
//!
//! ## Interruption
//!
//! An interrupt request sets a flag. While the mask is interruptible the flag
//! is honored at every leaf step (a value, an exit, a thunk) and at async
//! registration, and immediately if the fiber is parked. Composition nodes
//! only push frames, so by the time a leaf is reached every enclosing fold
//! is on the stack and its failure branch sees the `Interrupted` cause. Once
//! set, the flag stays set: the fiber unwinds through its finalizers, which
//! run masked, and stops at the next interruptible leaf.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::cancellation::{Canceler, MaskStack};
use crate::continuation::{erase, ContinuationStack, ErasedExit, Frame, Next};
use crate::exit::{Cause, Defect, Exit};
use crate::fiber::{FiberId, FiberState};
use crate::io::{AsyncOp, Step};
use crate::panic::catch_defect;
use crate::scheduler::Runtime;

/// Receives the fiber's exit exactly once.
pub(crate) type ExitHook = Box<dyn FnOnce(ErasedExit) + Send>;

/// Interpreter state that travels with a run.
struct RunState {
    stack: ContinuationStack,
    masks: MaskStack,
}

impl RunState {
    fn new() -> Self {
        Self {
            stack: ContinuationStack::default(),
            masks: MaskStack::new(),
        }
    }
}

enum Phase {
    Created(Arc<Step>),
    Running,
    Registering { early: Option<ErasedExit> },
    Suspended { run: RunState, canceler: Canceler },
    Done,
}

struct Control {
    phase: Phase,
    epoch: u64,
    outcome: FiberState,
    on_exit: Option<ExitHook>,
}

/// Runs one effect description to completion.
pub(crate) struct Driver {
    id: FiberId,
    runtime: Runtime,
    interrupt_requested: AtomicBool,
    control: Mutex<Control>,
}

impl Driver {
    pub(crate) fn new(id: FiberId, runtime: Runtime, root: Arc<Step>, on_exit: ExitHook) -> Arc<Self> {
        Arc::new(Self {
            id,
            runtime,
            interrupt_requested: AtomicBool::new(false),
            control: Mutex::new(Control {
                phase: Phase::Created(root),
                epoch: 0,
                outcome: FiberState::Runnable,
                on_exit: Some(on_exit),
            }),
        })
    }

    pub(crate) fn id(&self) -> FiberId {
        self.id
    }

    /// Observable state of the fiber.
    pub(crate) fn state(&self) -> FiberState {
        let control = self.control.lock();
        match control.phase {
            Phase::Created(_) => FiberState::Runnable,
            Phase::Running | Phase::Registering { .. } => FiberState::Running,
            Phase::Suspended { .. } => FiberState::Suspended,
            Phase::Done => control.outcome,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        matches!(self.control.lock().phase, Phase::Done)
    }

    /// Schedule the first step on the runtime.
    pub(crate) fn start(self: &Arc<Self>) {
        let driver = self.clone();
        self.runtime.dispatch(move || driver.begin());
    }

    /// Request interruption.
    ///
    /// Idempotent. A fiber parked in an interruptible region is resumed with
    /// `Interrupted` after its canceler runs; otherwise the request waits for
    /// the next interruptible step.
    pub(crate) fn interrupt(self: &Arc<Self>) {
        if self.interrupt_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(fiber = %self.id, "interrupt requested");

        let mut control = self.control.lock();
        let parked_interruptible = matches!(
            &control.phase,
            Phase::Suspended { run, .. } if run.masks.is_interruptible()
        );
        if !parked_interruptible {
            return;
        }
        if let Phase::Suspended { run, canceler } =
            std::mem::replace(&mut control.phase, Phase::Running)
        {
            control.epoch += 1;
            drop(control);
            let driver = self.clone();
            self.runtime.dispatch(move || {
                let _ = catch_defect(|| canceler.cancel());
                driver.run_loop(run, Next::Cause(Cause::Interrupted));
            });
        }
    }

    fn begin(self: &Arc<Self>) {
        let root = {
            let mut control = self.control.lock();
            match std::mem::replace(&mut control.phase, Phase::Running) {
                Phase::Created(root) => root,
                other => {
                    control.phase = other;
                    return;
                }
            }
        };
        tracing::trace!(fiber = %self.id, "fiber started");
        self.run_loop(RunState::new(), Next::Eval(root));
    }

    // ========================================================================
    // Trampoline
    // ========================================================================

    fn run_loop(self: &Arc<Self>, mut run: RunState, mut next: Next) {
        let budget = self.runtime.config().yield_budget;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > budget {
                tracing::trace!(fiber = %self.id, depth = run.stack.len(), "fiber yielded");
                let driver = self.clone();
                self.runtime.dispatch(move || driver.run_loop(run, next));
                return;
            }

            next = match next {
                Next::Eval(step) => match &*step {
                    Step::Succeeded(_) | Step::Complete(_) | Step::Suspend(_)
                        if self.interrupt_pending(&run) =>
                    {
                        tracing::trace!(fiber = %self.id, "interrupted at step");
                        Next::Cause(Cause::Interrupted)
                    }
                    Step::Succeeded(f) => Next::from_result(catch_defect(|| Next::Value(f()))),
                    Step::Caused(f) => Next::from_result(catch_defect(|| Next::Cause(f()))),
                    Step::Complete(f) => Next::from_result(catch_defect(|| Next::from_exit(f()))),
                    Step::Suspend(f) => Next::from_result(catch_defect(|| f())),
                    Step::GetRuntime => Next::Value(erase(self.runtime.clone())),
                    Step::Chain(left, bind) => {
                        run.stack.push(Frame::Chain(bind.clone()));
                        Next::Eval(left.clone())
                    }
                    Step::Fold(left, success, failure) => {
                        run.stack.push(Frame::Fold {
                            success: success.clone(),
                            failure: failure.clone(),
                        });
                        Next::Eval(left.clone())
                    }
                    Step::Region(inner, status) => {
                        run.masks.push(*status);
                        run.stack.push(Frame::Region);
                        Next::Eval(inner.clone())
                    }
                    Step::Async(op) => match self.register(run, op) {
                        Some((resumed, next)) => {
                            run = resumed;
                            next
                        }
                        None => return,
                    },
                },
                Next::Value(value) => match run.stack.pop() {
                    None => {
                        self.finish(Exit::Value(value));
                        return;
                    }
                    Some(Frame::Chain(bind)) | Some(Frame::Fold { success: bind, .. }) => {
                        Next::from_result(catch_defect(|| bind(value)))
                    }
                    Some(Frame::Region) => {
                        run.masks.pop();
                        Next::Value(value)
                    }
                },
                Next::Cause(cause) => match run.stack.pop() {
                    None => {
                        self.finish(Exit::Cause(cause));
                        return;
                    }
                    Some(Frame::Chain(_)) => Next::Cause(cause),
                    Some(Frame::Fold { failure, .. }) => {
                        Next::from_result(catch_defect(|| failure(cause)))
                    }
                    Some(Frame::Region) => {
                        run.masks.pop();
                        Next::Cause(cause)
                    }
                },
            };
        }
    }

    /// Check if a pending interrupt applies at the current point.
    fn interrupt_pending(&self, run: &RunState) -> bool {
        run.masks.is_interruptible() && self.interrupt_requested.load(Ordering::SeqCst)
    }

    /// Register an async operation.
    ///
    /// Returns the run state and the next instruction if the fiber can keep
    /// going on this thread, or `None` once it is parked.
    fn register(self: &Arc<Self>, run: RunState, op: &AsyncOp) -> Option<(RunState, Next)> {
        if self.interrupt_pending(&run) {
            return Some((run, Next::Cause(Cause::Interrupted)));
        }

        let epoch = {
            let mut control = self.control.lock();
            control.epoch += 1;
            control.phase = Phase::Registering { early: None };
            control.epoch
        };
        let resume = Resume {
            driver: self.clone(),
            epoch,
        };

        let canceler = match catch_defect(|| op(resume)) {
            Ok(canceler) => canceler,
            Err(defect) => {
                let mut control = self.control.lock();
                control.epoch += 1;
                control.phase = Phase::Running;
                return Some((run, Next::Cause(Cause::Aborted(defect))));
            }
        };

        let mut control = self.control.lock();
        match std::mem::replace(&mut control.phase, Phase::Running) {
            Phase::Registering { early: Some(exit) } => {
                control.epoch += 1;
                Some((run, Next::from_exit(exit)))
            }
            Phase::Registering { early: None } => {
                if self.interrupt_pending(&run) {
                    control.epoch += 1;
                    drop(control);
                    let _ = catch_defect(|| canceler.cancel());
                    return Some((run, Next::Cause(Cause::Interrupted)));
                }
                tracing::trace!(fiber = %self.id, "fiber suspended");
                control.phase = Phase::Suspended { run, canceler };
                None
            }
            phase => {
                control.phase = phase;
                Some((
                    run,
                    Next::Cause(Cause::Aborted(Defect::from(
                        "async registration left the fiber in an unexpected phase",
                    ))),
                ))
            }
        }
    }

    fn finish(&self, exit: ErasedExit) {
        let outcome = match &exit {
            Exit::Value(_) => FiberState::Completed,
            Exit::Cause(Cause::Interrupted) => FiberState::Cancelled,
            Exit::Cause(_) => FiberState::Failed,
        };
        let hook = {
            let mut control = self.control.lock();
            control.phase = Phase::Done;
            control.outcome = outcome;
            control.on_exit.take()
        };
        tracing::debug!(fiber = %self.id, outcome = ?outcome, "fiber exited");
        if let Some(hook) = hook {
            let _ = catch_defect(|| hook(exit));
        }
    }
}

// ============================================================================
// Resume
// ============================================================================

/// Resumption handle for one async registration.
pub(crate) struct Resume {
    driver: Arc<Driver>,
    epoch: u64,
}

impl Resume {
    pub(crate) fn fiber_id(&self) -> FiberId {
        self.driver.id
    }

    /// Deliver the result of the registered operation.
    ///
    /// Ignored if the fiber already moved past this registration.
    pub(crate) fn complete(self, exit: ErasedExit) {
        let driver = self.driver;
        let mut control = driver.control.lock();
        if control.epoch != self.epoch {
            tracing::trace!(fiber = %driver.id, "stale resumption ignored");
            return;
        }
        match std::mem::replace(&mut control.phase, Phase::Running) {
            Phase::Registering { early } => {
                control.phase = Phase::Registering {
                    early: early.or(Some(exit)),
                };
            }
            Phase::Suspended { run, canceler } => {
                control.epoch += 1;
                drop(control);
                drop(canceler);
                tracing::trace!(fiber = %driver.id, "fiber resumed");
                let runner = driver.clone();
                driver
                    .runtime
                    .dispatch(move || runner.run_loop(run, Next::from_exit(exit)));
            }
            phase => control.phase = phase,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
