//! # Event-Loop Runtime
//!
//! Single-threaded event loop that executes fiber steps, plus the entry points
//! that start effects from ordinary code.
//!
//! ## Design
//!
//! - One dedicated loop thread owns all driver work. Fiber steps, resumptions
//!   and timer callbacks are messages on a `crossbeam-channel` queue, so
//!   callbacks may fire on any thread and still resume fibers on the loop.
//! - Timers live in a binary heap on the loop thread. Cancelling a timer sets
//!   a flag; the entry is discarded when it comes due.
//! - A task that panics is logged and dropped; the loop keeps running.
//!
//! ## Entry Points
//!
//! | Method | Result |
//! |--------|--------|
//! | [`Runtime::run_callback`] | exit delivered to a callback |
//! | [`Runtime::run_future`] | future of `Result<A, Cause<E>>` |
//! | [`Runtime::run_future_total`] | future of the full [`Exit`] |
//! | [`Runtime::block_on`] | blocks the calling thread for the [`Exit`] |

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use futures::channel::oneshot;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cancellation::{CancelFlag, Canceler};
use crate::config::{ConfigError, RuntimeConfig};
use crate::continuation::downcast_exit;
use crate::driver::Driver;
use crate::exit::{Cause, Exit};
use crate::fiber::{next_fiber_id, FiberHandle, Unstarted};
use crate::io::IO;
use crate::panic::catch_defect;

/// Errors raised while starting a runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The event-loop thread could not be spawned.
    #[error("failed to spawn event-loop thread: {0}")]
    Spawn(#[source] std::io::Error),
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

type Task = Box<dyn FnOnce() + Send>;

enum Message {
    Task(Task),
    Timer {
        deadline: Instant,
        task: Task,
        flag: CancelFlag,
    },
    Shutdown,
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    task: Task,
    flag: CancelFlag,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

struct Inner {
    config: RuntimeConfig,
    sender: Sender<Message>,
    thread_id: ThreadId,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown: AtomicBool,
    dispatched: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(Message::Shutdown);
        }
    }
}

/// Handle to an event-loop runtime. Clones share the same loop.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("thread", &self.inner.config.thread_name)
            .field("dispatched", &self.dispatched_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Runtime {
    /// Start a runtime with the default configuration.
    pub fn new() -> Result<Self, RuntimeError> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Start a runtime with the given configuration.
    pub fn with_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        config.validate()?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        let name = config.thread_name.clone();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || event_loop(receiver, name))
            .map_err(RuntimeError::Spawn)?;

        Ok(Self {
            inner: Arc::new(Inner {
                thread_id: handle.thread().id(),
                config,
                sender,
                thread: Mutex::new(Some(handle)),
                shutdown: AtomicBool::new(false),
                dispatched: AtomicU64::new(0),
            }),
        })
    }

    /// The process-wide runtime, configured from the environment on first use.
    pub fn global() -> &'static Runtime {
        static GLOBAL: OnceLock<Runtime> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            Runtime::with_config(RuntimeConfig::from_env())
                .expect("failed to start the global runtime")
        })
    }

    /// The configuration this runtime was started with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Queue a task on the loop thread.
    ///
    /// Tasks run in FIFO order. After shutdown the task is dropped.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        if self.inner.sender.send(Message::Task(Box::new(task))).is_err() {
            tracing::error!(thread = %self.inner.config.thread_name, "event loop stopped; task dropped");
        }
    }

    /// Run `task` on the loop thread after `delay`.
    ///
    /// The returned canceler prevents the task from running if it has not run
    /// yet.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> Canceler
    where
        F: FnOnce() + Send + 'static,
    {
        let flag = CancelFlag::new();
        let message = Message::Timer {
            deadline: Instant::now() + delay,
            task: Box::new(task),
            flag: flag.clone(),
        };
        if self.inner.sender.send(message).is_err() {
            tracing::error!(thread = %self.inner.config.thread_name, "event loop stopped; timer dropped");
        }
        flag.canceler()
    }

    /// Check if the calling thread is this runtime's loop thread.
    pub fn is_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Number of tasks dispatched since start.
    pub fn dispatched_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Check if shutdown was requested.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stop the loop. Pending tasks and timers are dropped.
    ///
    /// Waits for the loop thread to exit unless called from it.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.sender.send(Message::Shutdown);
        if self.is_loop_thread() {
            return;
        }
        if let Some(handle) = self.inner.thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("event-loop thread panicked");
            }
        }
    }

    // ========================================================================
    // Running effects
    // ========================================================================

    /// Build a fiber for `io` without dispatching its first step.
    pub(crate) fn prepare<E, A, F>(&self, io: &IO<E, A>, sink: F) -> Unstarted
    where
        E: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        let driver = Driver::new(
            next_fiber_id(),
            self.clone(),
            io.step.clone(),
            Box::new(move |exit| sink(downcast_exit::<E, A>(exit))),
        );
        Unstarted::new(FiberHandle::new(driver))
    }

    /// Run `io` on a new fiber and deliver its exit to `callback`.
    ///
    /// The callback runs on the loop thread.
    pub fn run_callback<E, A, F>(&self, io: &IO<E, A>, callback: F) -> FiberHandle
    where
        E: Send + 'static,
        A: Send + 'static,
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        self.prepare(io, callback).start()
    }

    /// Run `io` and resolve with its full exit.
    ///
    /// The fiber starts immediately; dropping the future does not interrupt
    /// it.
    pub fn run_future_total<E, A>(&self, io: &IO<E, A>) -> impl Future<Output = Exit<E, A>> + Send + 'static
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.run_callback(io, move |exit| {
            let _ = tx.send(exit);
        });
        async move {
            rx.await
                .unwrap_or_else(|_| Exit::aborted("fiber dropped before exiting"))
        }
    }

    /// Run `io` and resolve with its value, or reject with its cause.
    pub fn run_future<E, A>(&self, io: &IO<E, A>) -> impl Future<Output = Result<A, Cause<E>>> + Send + 'static
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        let exit = self.run_future_total(io);
        async move { exit.await.into_result() }
    }

    /// Run `io` and block the calling thread until it exits.
    ///
    /// Calling this from the loop thread would deadlock, so it returns an
    /// `Aborted` exit instead.
    pub fn block_on<E, A>(&self, io: &IO<E, A>) -> Exit<E, A>
    where
        E: Send + 'static,
        A: Send + 'static,
    {
        if self.is_loop_thread() {
            tracing::error!("block_on called from the event-loop thread");
            return Exit::aborted("block_on called from the event-loop thread");
        }
        futures::executor::block_on(self.run_future_total(io))
    }
}

impl<E, A> IO<E, A>
where
    E: Send + 'static,
    A: Send + 'static,
{
    /// Run on the global runtime, delivering the exit to `callback`.
    pub fn run_callback<F>(&self, callback: F) -> FiberHandle
    where
        F: FnOnce(Exit<E, A>) + Send + 'static,
    {
        Runtime::global().run_callback(self, callback)
    }

    /// Run on the global runtime as a future of `Result<A, Cause<E>>`.
    pub fn run_future(&self) -> impl Future<Output = Result<A, Cause<E>>> + Send + 'static {
        Runtime::global().run_future(self)
    }

    /// Run on the global runtime as a future of the full exit.
    pub fn run_future_total(&self) -> impl Future<Output = Exit<E, A>> + Send + 'static {
        Runtime::global().run_future_total(self)
    }

    /// Run on the global runtime and block for the exit.
    pub fn run_blocking(&self) -> Exit<E, A> {
        Runtime::global().block_on(self)
    }
}

// ============================================================================
// Loop thread
// ============================================================================

fn event_loop(receiver: Receiver<Message>, name: String) {
    tracing::info!(thread = %name, "event loop started");
    let mut timers: BinaryHeap<Reverse<TimerEntry>> = BinaryHeap::new();
    let mut seq = 0u64;

    loop {
        let now = Instant::now();
        while timers
            .peek()
            .map_or(false, |Reverse(entry)| entry.deadline <= now)
        {
            if let Some(Reverse(entry)) = timers.pop() {
                if !entry.flag.is_cancelled() {
                    run_task(entry.task);
                }
            }
        }

        let message = match timers.peek() {
            Some(Reverse(entry)) => {
                let wait = entry.deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(wait) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        thread::sleep(wait);
                        continue;
                    }
                }
            }
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };

        match message {
            Message::Task(task) => run_task(task),
            Message::Timer {
                deadline,
                task,
                flag,
            } => {
                seq += 1;
                timers.push(Reverse(TimerEntry {
                    deadline,
                    seq,
                    task,
                    flag,
                }));
            }
            Message::Shutdown => break,
        }
    }

    tracing::info!(thread = %name, pending_timers = timers.len(), "event loop stopped");
}

fn run_task(task: Task) {
    if catch_defect(task).is_err() {
        tracing::error!("event-loop task panicked");
    }
}

// ============================================================================
// Tests
// ============================================================================
