//! The three ways a handle's blocking work can be executed.
//!
//! - [`blocking`]: inline on the scheduler thread.
//! - [`uring`]: submitted to `io_uring`, completed by a reactor.
//! - [`parallel`]: sent to a pool of workers.

pub mod blocking;
pub mod parallel;
pub mod uring;

pub use blocking::{BlockingDriver, BlockingFile};
pub use parallel::{ParallelDriver, ParallelFile, ThreadWorkerPool};
pub use uring::{IoUringReactor, IoUringReactorBuilder, UringDriver, UringFile};
