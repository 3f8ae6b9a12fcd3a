//! The handle contract shared by every driver.
//!
//! Operations that may suspend return a future, but their preconditions are
//! checked when the method is *called*: a conflicting `read` fails with
//! [`FileError::PendingOperation`](crate::FileError::PendingOperation) right
//! away instead of waiting its turn, and a `write` is placed in the handle's
//! queue at call time, bound to the cursor position seen at that moment.

pub(crate) mod fd;
pub(crate) mod queued;

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::path::Path;

use futures::Stream;

use crate::cancel::Cancellation;
use crate::error::Result;
use crate::mode::{LockKind, OpenMode, Whence};

/// Default number of bytes requested by a read.
pub const DEFAULT_READ_LENGTH: usize = 8192;

/// An open file.
pub trait File {
    /// Read up to `length` bytes at the cursor. `Ok(None)` signals end of file.
    fn read(
        &self,
        cancellation: Option<Cancellation>,
        length: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>>;

    /// Write `bytes` at the cursor position captured now. Writes apply in
    /// the order they were issued.
    fn write(&self, bytes: Vec<u8>) -> impl Future<Output = Result<()>>;

    /// Resize the file to exactly `size` bytes, queued like a write.
    fn truncate(&self, size: u64) -> impl Future<Output = Result<()>>;

    /// Move the cursor. Never performs I/O.
    fn seek(&self, offset: i64, whence: Whence) -> Result<u64>;

    fn tell(&self) -> u64;

    /// True when no write is queued and the cursor is at or past the end.
    fn eof(&self) -> bool;

    /// Close the handle. Calling it again is a no-op that never fails.
    fn close(&self) -> impl Future<Output = Result<()>>;

    /// Stop accepting writes, then close once every queued write applied.
    fn end(&self) -> impl Future<Output = Result<()>>;

    fn is_closed(&self) -> bool;

    /// Run `observer` once the handle closes (immediately if it already has).
    fn on_close<F>(&self, observer: F)
    where
        F: FnOnce() + 'static;

    /// Acquire an advisory lock, retrying with backoff while it is contended.
    fn lock(
        &self,
        kind: LockKind,
        cancellation: Option<Cancellation>,
    ) -> impl Future<Output = Result<()>>;

    /// Single non-blocking lock attempt; `Ok(false)` when another holder has it.
    fn try_lock(&self, kind: LockKind) -> impl Future<Output = Result<bool>>;

    fn unlock(&self) -> impl Future<Output = Result<()>>;

    fn lock_kind(&self) -> Option<LockKind>;

    fn path(&self) -> &Path;

    fn mode(&self) -> &OpenMode;

    fn is_readable(&self) -> bool;

    fn is_writable(&self) -> bool;

    fn is_seekable(&self) -> bool;

    /// The rest of the file from the cursor, in reads of
    /// [`DEFAULT_READ_LENGTH`] bytes.
    fn chunks(&self) -> impl Stream<Item = Result<Vec<u8>>> + '_
    where
        Self: Sized,
    {
        read_chunks(self, DEFAULT_READ_LENGTH)
    }
}

/// Stream `file` from its cursor in reads of at most `chunk_length` bytes.
///
/// The stream ends at end of file, or right after yielding an error. Each
/// chunk is read only when the stream is polled for it, so the usual
/// pending-read rules apply between chunks.
pub fn read_chunks<'a, F: File>(
    file: &'a F,
    chunk_length: usize,
) -> impl Stream<Item = Result<Vec<u8>>> + 'a {
    futures::stream::unfold(Some(file), move |file| async move {
        let file = file?;
        match file.read(None, chunk_length).await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(file))),
            Ok(None) => None,
            Err(err) => Some((Err(err), None)),
        }
    })
}

/// Opens files. Each driver picks how the blocking work is executed.
pub trait FilesystemDriver {
    type File: File + 'static;

    fn open_file(&self, path: &Path, mode: &str) -> impl Future<Output = Result<Self::File>>;
}

/// The two path-level queries the mutex layer needs.
pub trait PathMetadata {
    fn is_directory(&self, path: &Path) -> impl Future<Output = Result<bool>>;

    fn delete_file(&self, path: &Path) -> impl Future<Output = Result<()>>;
}

/// Callbacks run exactly once when a handle closes.
#[derive(Default)]
pub(crate) struct CloseObservers {
    fired: Cell<bool>,
    observers: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl CloseObservers {
    pub(crate) fn register(&self, observer: Box<dyn FnOnce()>) {
        if self.fired.get() {
            observer();
        } else {
            self.observers.borrow_mut().push(observer);
        }
    }

    pub(crate) fn notify(&self) {
        if self.fired.replace(true) {
            return;
        }
        let observers = std::mem::take(&mut *self.observers.borrow_mut());
        for observer in observers {
            observer();
        }
    }
}
