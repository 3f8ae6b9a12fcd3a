//! Per-handle operation serializer.
//!
//! One handle has one logical cursor. Writes and truncates go through a FIFO
//! of shared futures: each one waits for its predecessor to settle before
//! being submitted, so they hit the file in the order they were issued. Reads
//! are single-flight and never overlap with a queued write.
//!
//! The queue head is submitted eagerly, at call time. Every entry is also
//! spawned on the thread's runtime, so it settles even when its caller drops
//! the returned future without polling it. Without a runtime, entries advance
//! only while somebody awaits them.
//!
//! Append-mode writes ignore the cursor: their offset is the cached size at
//! the moment they are submitted, after every predecessor has settled.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::{LocalBoxFuture, Shared};
use futures::FutureExt;

use crate::error::{FileError, Result};
use crate::file::CloseObservers;
use crate::mode::{resolve_seek, LockKind, OpenMode, Whence};

pub(crate) type QueuedOp = Shared<LocalBoxFuture<'static, Result<()>>>;

#[derive(Debug)]
pub(crate) struct HandleState {
    pub(crate) position: u64,
    pub(crate) size: u64,
    pub(crate) reading: bool,
    pub(crate) writable: bool,
    pub(crate) closed: bool,
    pub(crate) lock_kind: Option<LockKind>,
}

/// Cursor, size, flags and write queue of one open handle.
pub(crate) struct HandleCore {
    path: PathBuf,
    mode: OpenMode,
    state: RefCell<HandleState>,
    queue: RefCell<VecDeque<QueuedOp>>,
    closing: RefCell<Option<QueuedOp>>,
    observers: CloseObservers,
}

impl HandleCore {
    pub(crate) fn new(path: PathBuf, mode: OpenMode, size: u64) -> Rc<Self> {
        let position = if mode.is_append() { size } else { 0 };
        let writable = mode.is_writable();
        Rc::new(HandleCore {
            path,
            mode,
            state: RefCell::new(HandleState {
                position,
                size,
                reading: false,
                writable,
                closed: false,
                lock_kind: None,
            }),
            queue: RefCell::new(VecDeque::new()),
            closing: RefCell::new(None),
            observers: CloseObservers::default(),
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn mode(&self) -> &OpenMode {
        &self.mode
    }

    pub(crate) fn tell(&self) -> u64 {
        self.state.borrow().position
    }

    pub(crate) fn size(&self) -> u64 {
        self.state.borrow().size
    }

    pub(crate) fn pending_writes(&self) -> usize {
        self.queue.borrow().len()
    }

    pub(crate) fn eof(&self) -> bool {
        let state = self.state.borrow();
        self.queue.borrow().is_empty() && state.position >= state.size
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.state.borrow().writable
    }

    pub(crate) fn is_reading(&self) -> bool {
        self.state.borrow().reading
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(FileError::closed(&self.path));
        }
        Ok(())
    }

    pub(crate) fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(FileError::closed(&self.path));
        }
        if state.reading {
            return Err(FileError::PendingOperation);
        }
        state.position = resolve_seek(state.position, state.size, offset, whence)?;
        Ok(state.position)
    }

    /// Start a read of at most `length` bytes at the cursor.
    ///
    /// The returned ticket holds the reading flag until it is dropped, so a
    /// cancelled or abandoned read never leaves the handle stuck.
    pub(crate) fn begin_read(self: &Rc<Self>, length: usize) -> Result<ReadTicket> {
        let mut state = self.state.borrow_mut();
        if state.closed {
            return Err(FileError::closed(&self.path));
        }
        if state.reading || !self.queue.borrow().is_empty() {
            return Err(FileError::PendingOperation);
        }
        if !self.mode.is_readable() {
            return Err(FileError::InvalidArgument(format!(
                "'{}' was not opened for reading (mode '{}')",
                self.path.display(),
                self.mode
            )));
        }
        state.reading = true;
        let remaining = state.size.saturating_sub(state.position);
        let length = (length as u64).min(remaining) as usize;
        tracing::trace!(
            "HandleCore::begin_read {} offset={} length={}",
            self.path.display(),
            state.position,
            length
        );
        Ok(ReadTicket {
            core: Rc::clone(self),
            offset: state.position,
            length,
        })
    }

    fn check_queueable(&self) -> Result<u64> {
        let state = self.state.borrow();
        if state.reading {
            return Err(FileError::PendingOperation);
        }
        if state.closed {
            return Err(FileError::closed(&self.path));
        }
        if !state.writable {
            return Err(FileError::not_writable(&self.path));
        }
        Ok(state.position)
    }

    fn tail(&self) -> Option<QueuedOp> {
        self.queue.borrow().back().cloned()
    }

    fn push(&self, op: QueuedOp) {
        let mut queue = self.queue.borrow_mut();
        queue.push_back(op);
        tracing::trace!(
            "HandleCore: queued operation on {}, depth={}",
            self.path.display(),
            queue.len()
        );
    }

    /// Settle the queue head. Chained operations complete in FIFO order, so
    /// the head is always the operation that just finished.
    fn settle_head(&self) {
        self.queue.borrow_mut().pop_front();
    }

    /// Chain an operation behind the queue tail. With an empty queue `submit`
    /// runs immediately; otherwise it runs right after the predecessor settles,
    /// whatever the predecessor's outcome.
    fn enqueue<F, Fut, T>(
        self: &Rc<Self>,
        submit: F,
        finish: impl FnOnce(&HandleCore, T) + 'static,
    ) -> QueuedOp
    where
        F: FnOnce(&HandleCore) -> Fut + 'static,
        Fut: Future<Output = Result<T>> + 'static,
        T: 'static,
    {
        let core = Rc::clone(self);
        let op = match self.tail() {
            None => {
                let submitted = submit(&**self);
                async move {
                    let result = submitted.await;
                    core.settle_head();
                    finish(&core, result?);
                    Ok(())
                }
                .boxed_local()
            }
            Some(predecessor) => async move {
                let _ = predecessor.await;
                if core.is_closed() {
                    core.settle_head();
                    return Err(FileError::closed(&core.path));
                }
                let result = submit(&*core).await;
                core.settle_head();
                finish(&core, result?);
                Ok(())
            }
            .boxed_local(),
        }
        .shared();
        self.push(op.clone());
        self.drive(op.clone());
        op
    }

    /// Poll `op` from a runtime task so it settles without its caller.
    fn drive(&self, op: QueuedOp) {
        let driven = crate::executor::try_spawn(async move {
            // the caller observes the outcome through its own clone
            let _ = op.await;
        });
        if driven.is_none() {
            tracing::trace!(
                "HandleCore: no runtime, {} advances only when awaited",
                self.path.display()
            );
        }
    }

    /// Queue a write. `submit` receives the offset to write at and resolves
    /// to the number of bytes written. The offset is the cursor captured now,
    /// or the size at submission for append-mode handles.
    pub(crate) fn queue_write<F, Fut>(self: &Rc<Self>, submit: F) -> Result<QueuedOp>
    where
        F: FnOnce(u64) -> Fut + 'static,
        Fut: Future<Output = Result<usize>> + 'static,
    {
        let position = self.check_queueable()?;
        Ok(self.enqueue(
            move |core| {
                let offset = if core.mode.is_append() {
                    core.size()
                } else {
                    position
                };
                submit(offset).map(move |written| written.map(|written| (offset, written)))
            },
            move |core, (offset, written)| {
                let mut state = core.state.borrow_mut();
                let end = offset + written as u64;
                // Only advance if nothing moved the cursor while we were queued.
                if state.position == position {
                    state.position = end;
                }
                state.size = state.size.max(end);
            },
        ))
    }

    /// Queue a truncate to exactly `size` bytes.
    pub(crate) fn queue_truncate<F, Fut>(self: &Rc<Self>, size: u64, submit: F) -> Result<QueuedOp>
    where
        F: FnOnce(u64) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.check_queueable()?;
        Ok(self.enqueue(
            move |_| submit(size),
            move |core, ()| {
                core.state.borrow_mut().size = size;
            },
        ))
    }

    /// Mark the handle not writable and close it once the queue drained.
    pub(crate) fn end_with<F, Fut>(self: &Rc<Self>, close: F) -> LocalBoxFuture<'static, Result<()>>
    where
        F: FnOnce() -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        self.state.borrow_mut().writable = false;
        match self.tail() {
            None => close().boxed_local(),
            Some(_) => self
                .enqueue(move |_| close(), |_, ()| {})
                .boxed_local(),
        }
    }

    /// Close the handle. The first call marks it closed, fires the observers
    /// and submits `close` right away; later calls wait for that close and
    /// always succeed.
    pub(crate) fn close_with<F, Fut>(self: &Rc<Self>, close: F) -> LocalBoxFuture<'static, Result<()>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>> + 'static,
    {
        if let Some(closing) = self.closing.borrow().clone() {
            return async move {
                let _ = closing.await;
                Ok(())
            }
            .boxed_local();
        }

        {
            let mut state = self.state.borrow_mut();
            state.closed = true;
            state.writable = false;
            state.lock_kind = None;
        }
        tracing::debug!("HandleCore: closing {}", self.path.display());
        self.observers.notify();

        let closing = close().boxed_local().shared();
        *self.closing.borrow_mut() = Some(closing.clone());
        closing.boxed_local()
    }

    pub(crate) fn on_close(&self, observer: Box<dyn FnOnce()>) {
        self.observers.register(observer);
    }

    pub(crate) fn lock_kind(&self) -> Option<LockKind> {
        self.state.borrow().lock_kind
    }

    pub(crate) fn set_lock_kind(&self, kind: Option<LockKind>) {
        self.state.borrow_mut().lock_kind = kind;
    }

    /// Record the outcome of a non-blocking lock request.
    ///
    /// Converting a held `flock` is not atomic: when the conversion would
    /// block, the old lock may already be gone, so the recorded kind is
    /// cleared.
    pub(crate) fn record_lock_attempt(&self, kind: LockKind, locked: bool) {
        let mut state = self.state.borrow_mut();
        if locked {
            state.lock_kind = Some(kind);
        } else if state.lock_kind.is_some() {
            state.lock_kind = None;
        }
    }
}

impl Drop for HandleCore {
    fn drop(&mut self) {
        self.observers.notify();
    }
}

/// Proof that a read is in flight; clears the reading flag when dropped.
pub(crate) struct ReadTicket {
    core: Rc<HandleCore>,
    offset: u64,
    length: usize,
}

impl ReadTicket {
    pub(crate) fn offset(&self) -> u64 {
        self.offset
    }

    pub(crate) fn length(&self) -> usize {
        self.length
    }

    /// Advance the cursor past `data`; an empty result is end of file.
    pub(crate) fn complete(self, data: Vec<u8>) -> Option<Vec<u8>> {
        if data.is_empty() {
            return None;
        }
        self.core.state.borrow_mut().position = self.offset + data.len() as u64;
        Some(data)
    }
}

impl Drop for ReadTicket {
    fn drop(&mut self) {
        self.core.state.borrow_mut().reading = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use std::cell::Cell;

    fn core(mode: &str, size: u64) -> Rc<HandleCore> {
        HandleCore::new(PathBuf::from("/tmp/queued"), OpenMode::parse(mode).unwrap(), size)
    }

    #[test]
    fn append_mode_starts_at_size() {
        assert_eq!(core("a+", 12).tell(), 12);
        assert_eq!(core("c+", 12).tell(), 0);
    }

    #[test]
    fn read_and_write_exclude_each_other() {
        let core = core("c+", 10);
        let ticket = core.begin_read(4).unwrap();
        assert!(matches!(
            core.queue_write(|_| async { Ok(1) }),
            Err(FileError::PendingOperation)
        ));
        assert!(matches!(core.begin_read(4), Err(FileError::PendingOperation)));
        assert!(matches!(core.seek(0, Whence::Start), Err(FileError::PendingOperation)));
        drop(ticket);
        assert!(!core.is_reading());

        let (tx, rx) = oneshot::channel::<()>();
        let op = core
            .queue_write(move |_| async move {
                let _ = rx.await;
                Ok(3)
            })
            .unwrap();
        assert!(matches!(core.begin_read(4), Err(FileError::PendingOperation)));
        tx.send(()).unwrap();
        futures::executor::block_on(op).unwrap();
        assert!(core.begin_read(4).is_ok());
    }

    #[test]
    fn read_is_capped_at_size() {
        let core = core("r", 10);
        core.seek(7, Whence::Start).unwrap();
        let ticket = core.begin_read(100).unwrap();
        assert_eq!(ticket.offset(), 7);
        assert_eq!(ticket.length(), 3);
        assert_eq!(ticket.complete(vec![1, 2, 3]), Some(vec![1, 2, 3]));
        assert_eq!(core.tell(), 10);
        assert!(core.eof());
    }

    #[test]
    fn chained_writes_apply_in_submission_order() {
        let core = core("c+", 0);
        let log = Rc::new(RefCell::new(Vec::new()));
        let submitted = Rc::new(Cell::new(0));

        let (tx1, rx1) = oneshot::channel::<()>();
        let l = log.clone();
        let s = submitted.clone();
        let first = core
            .queue_write(move |offset| {
                s.set(s.get() + 1);
                async move {
                    let _ = rx1.await;
                    l.borrow_mut().push(("first", offset));
                    Ok(4)
                }
            })
            .unwrap();
        // head is submitted at call time
        assert_eq!(submitted.get(), 1);

        core.seek(4, Whence::Start).unwrap();
        let l = log.clone();
        let s = submitted.clone();
        let second = core
            .queue_write(move |offset| {
                s.set(s.get() + 1);
                async move {
                    l.borrow_mut().push(("second", offset));
                    Ok(2)
                }
            })
            .unwrap();
        assert_eq!(submitted.get(), 1);
        assert_eq!(core.pending_writes(), 2);
        assert!(!core.eof());

        tx1.send(()).unwrap();
        futures::executor::block_on(second).unwrap();
        futures::executor::block_on(first).unwrap();

        assert_eq!(*log.borrow(), vec![("first", 0), ("second", 4)]);
        assert_eq!(core.size(), 6);
        assert_eq!(core.tell(), 6);
        assert_eq!(core.pending_writes(), 0);
        assert!(core.eof());
    }

    #[test]
    fn failed_write_does_not_block_successor() {
        let core = core("w", 0);
        let first = core
            .queue_write(|_| async {
                Err(FileError::from_io("write failed", std::io::Error::from_raw_os_error(libc::EIO)))
            })
            .unwrap();
        let second = core.queue_write(|_| async { Ok(5) }).unwrap();
        futures::executor::block_on(second).unwrap();
        assert!(futures::executor::block_on(first).is_err());
        assert_eq!(core.size(), 5);
    }

    #[test]
    fn append_write_ignores_the_cursor() {
        let core = core("a+", 5);
        core.seek(0, Whence::Start).unwrap();
        let offsets = Rc::new(RefCell::new(Vec::new()));
        let o = offsets.clone();
        let op = core
            .queue_write(move |offset| {
                o.borrow_mut().push(offset);
                async { Ok(2) }
            })
            .unwrap();
        futures::executor::block_on(op).unwrap();
        assert_eq!(*offsets.borrow(), vec![5]);
        assert_eq!(core.size(), 7);
        assert_eq!(core.tell(), 7);
    }

    #[test]
    fn unpolled_write_settles_on_the_runtime() {
        let runtime = crate::executor::Runtime::new(8);
        crate::executor::set_runtime(runtime.clone());
        let core = core("w+", 0);
        drop(core.queue_write(|_| async { Ok(3) }).unwrap());
        assert_eq!(core.pending_writes(), 1);

        runtime.block_on(crate::timer::sleep(std::time::Duration::from_millis(1)));
        crate::executor::clear_runtime();
        assert_eq!(core.pending_writes(), 0);
        assert_eq!(core.size(), 3);
        assert!(core.eof());
        assert!(core.begin_read(3).is_ok());
    }

    #[test]
    fn truncate_sets_exact_size() {
        let core = core("r+", 100);
        let op = core.queue_truncate(10, |_| async { Ok(()) }).unwrap();
        futures::executor::block_on(op).unwrap();
        assert_eq!(core.size(), 10);
    }

    #[test]
    fn end_drains_then_closes() {
        let core = core("w", 0);
        let (tx, rx) = oneshot::channel::<()>();
        let write = core
            .queue_write(move |_| async move {
                let _ = rx.await;
                Ok(1)
            })
            .unwrap();
        let closed = Rc::new(Cell::new(false));
        let c = core.clone();
        let flag = closed.clone();
        let end = core.end_with(move || {
            flag.set(true);
            c.close_with(|| async { Ok(()) })
        });
        assert!(!core.is_writable());
        assert!(matches!(
            core.queue_write(|_| async { Ok(1) }),
            Err(FileError::Closed(_))
        ));
        assert!(!closed.get());
        tx.send(()).unwrap();
        futures::executor::block_on(end).unwrap();
        futures::executor::block_on(write).unwrap();
        assert!(closed.get());
        assert!(core.is_closed());
    }

    #[test]
    fn close_is_idempotent() {
        let core = core("r", 0);
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        core.on_close(Box::new(move || f.set(f.get() + 1)));

        let first = core.close_with(|| async {
            Err(FileError::from_io("close failed", std::io::Error::from_raw_os_error(libc::EIO)))
        });
        let resubmitted = Cell::new(false);
        let second = core.close_with(|| {
            resubmitted.set(true);
            async { Ok(()) }
        });
        assert!(futures::executor::block_on(first).is_err());
        assert!(futures::executor::block_on(second).is_ok());
        assert!(!resubmitted.get());
        assert_eq!(fired.get(), 1);
        assert!(matches!(core.begin_read(1), Err(FileError::Closed(_))));
    }
}
