//! # Effect Runtime
//!
//! Programs are built as inert effect descriptions ([`IO`]) and run by a
//! stack-safe driver on a single event-loop thread. The runtime provides:
//!
//! - **Effects**: a closed algebra of steps with typed failures, defects and
//!   interruption ([`Exit`], [`Cause`])
//! - **Fibers**: cooperative units of execution with interruption and
//!   interrupt masking
//! - **Parallelism**: `race` and `par_zip` over child fibers
//! - **Primitives**: [`Ref`], [`Deferred`], [`Semaphore`] and
//!   [`ConcurrentQueue`], all safe under interruption
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        EFFECT RUNTIME                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │   Effects    │  │    Driver    │  │  Event Loop  │          │
//! │  │   (io.rs)    │─▶│ (driver.rs)  │─▶│(scheduler.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                                     │
//! │         ▼                 ▼                                     │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │  Ref / Ticket│  │   Deferred   │  │ Semaphore /  │          │
//! │  │              │  │              │  │    Queue     │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use effect_runtime::{Exit, Runtime, IO};
//!
//! let rt = Runtime::new().expect("start runtime");
//! let program: IO<String, i32> = IO::succeed(20).map(|n| n + 1).map(|n| n * 2);
//! assert_eq!(rt.block_on(&program), Exit::Value(42));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cancellation;
pub mod config;
mod continuation;
pub mod deferred;
mod driver;
pub mod exit;
pub mod fiber;
pub mod io;
pub mod panic;
pub mod parallel;
pub mod queue;
pub mod ref_cell;
pub mod scheduler;
pub mod semaphore;
pub mod ticket;

// Re-exports
pub use cancellation::{CancelFlag, Canceler, InterruptStatus};
pub use config::{ConfigError, RuntimeConfig, RuntimeConfigBuilder};
pub use deferred::Deferred;
pub use exit::{Cause, Defect, Exit};
pub use fiber::{Fiber, FiberHandle, FiberId, FiberState};
pub use io::{Callback, IO, UIO};
pub use parallel::{par_zip, par_zip_with, race};
pub use queue::{
    bounded_queue, dropping_queue, sliding_queue, unbounded_queue, ConcurrentQueue, OverflowPolicy,
};
pub use ref_cell::Ref;
pub use scheduler::{Runtime, RuntimeError};
pub use semaphore::Semaphore;
pub use ticket::Ticket;

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Create a [`Ref`] holding `initial`.
pub fn make_ref<S>(initial: S) -> UIO<Ref<S>>
where
    S: Clone + Send + Sync + 'static,
{
    Ref::make(initial)
}

/// Create an empty [`Deferred`].
pub fn make_deferred<E, A>() -> UIO<Deferred<E, A>>
where
    E: Clone + Send + Sync + 'static,
    A: Clone + Send + Sync + 'static,
{
    Deferred::make()
}

/// Create a [`Semaphore`] with `permits` free permits.
pub fn make_semaphore(permits: usize) -> UIO<Semaphore> {
    Semaphore::make(permits)
}
