//! Asynchronous file access for the `pluvio` single-threaded runtime.
//!
//! Every driver hands out handles implementing [`File`]: one cursor per
//! handle, writes applied in the order they were issued, reads that never
//! overlap a write, and advisory locks acquired with exponential backoff.
//!
//! ```no_run
//! use pluvio_file::{BlockingDriver, File, FilesystemDriver, Runtime};
//!
//! let runtime = Runtime::new(64);
//! runtime.block_on(async {
//!     let driver = BlockingDriver::new();
//!     let file = driver.open_file("/tmp/example".as_ref(), "c+").await?;
//!     file.write(b"hello".to_vec()).await?;
//!     file.close().await
//! }).unwrap();
//! ```

/// Cooperative cancellation tokens.
pub mod cancel;
/// Filesystem drivers.
pub mod driver;
pub mod error;
/// Task executor and runtime utilities.
pub mod executor;
/// Handle contract shared by the drivers.
pub mod file;
pub mod lock;
pub mod mode;
pub mod mutex;
pub mod reactor;
/// Task abstraction and waker utilities.
pub mod task;
pub mod timer;

pub use cancel::{Cancellation, CancellationSource};
pub use driver::{
    BlockingDriver, BlockingFile, IoUringReactor, IoUringReactorBuilder, ParallelDriver,
    ParallelFile, ThreadWorkerPool, UringDriver, UringFile,
};
pub use error::{FileError, Result};
pub use executor::{clear_runtime, get_runtime, set_runtime, spawn, try_spawn, Runtime};
pub use file::{read_chunks, File, FilesystemDriver, PathMetadata, DEFAULT_READ_LENGTH};
pub use lock::Backoff;
pub use mode::{LockKind, OpenMode, Whence};
pub use mutex::{FileMutex, KeyedFileMutex, KeyedLockingFileMutex, Lock, LockingFileMutex};
