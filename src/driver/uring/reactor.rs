use std::{
    cell::{Cell, OnceCell, RefCell},
    collections::HashMap,
    ffi::CString,
    future::Future,
    io,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use io_uring::IoUring;

use crate::driver::uring::builder::IoUringReactorBuilder;
use crate::reactor::{Reactor, ReactorStatus};

thread_local! {
    static IOURING_REACTOR: OnceCell<Rc<IoUringReactor>> = const { OnceCell::new() };
}

/// Reactor implementation using Linux `io_uring`.
pub struct IoUringReactor {
    pub(crate) ring: RefCell<IoUring>,
    pub(crate) completions: RefCell<HashMap<u64, Rc<HandleState>>>,
    pub(crate) user_data_counter: Cell<u64>,
    pub(crate) last_submit_time: Cell<Instant>,
    pub(crate) io_uring_params: IoUringParams,
    pub(crate) completed_count: Cell<u64>,
    pub(crate) listeners: Cell<usize>,
}

/// Parameters controlling io_uring behaviour.
pub(crate) struct IoUringParams {
    pub(crate) submit_depth: u32,
    pub(crate) wait_submit_timeout: Duration,
    pub(crate) wait_complete_timeout: Duration,
}

/// Memory the kernel reads or writes while a request is in flight.
///
/// It is owned by the completion entry, not by the waiting future, so a
/// cancelled request can never leave the kernel pointing at freed memory.
pub(crate) enum IoBuffer {
    Empty,
    Data(Vec<u8>),
    Path(CString),
    Stat(CString, Box<libc::statx>),
}

impl IoBuffer {
    pub(crate) fn into_data(self) -> Vec<u8> {
        match self {
            IoBuffer::Data(data) => data,
            _ => Vec::new(),
        }
    }
}

/// State shared between the reactor and a waiting future.
pub(crate) struct HandleState {
    waker: RefCell<Option<Waker>>,
    result: RefCell<Option<io::Result<i32>>>,
    buffer: RefCell<IoBuffer>,
}

impl HandleState {
    fn new(buffer: IoBuffer) -> Self {
        HandleState {
            waker: RefCell::new(None),
            result: RefCell::new(None),
            buffer: RefCell::new(buffer),
        }
    }
}

/// Keeps the reactor polled while held.
pub struct PollInterest {
    reactor: Rc<IoUringReactor>,
}

impl Drop for PollInterest {
    fn drop(&mut self) {
        self.reactor.listeners.set(self.reactor.listeners.get() - 1);
    }
}

/// Outcome of one request: the CQE result and the buffer handed in with it.
pub(crate) struct IoCompletion {
    pub(crate) result: io::Result<i32>,
    pub(crate) buffer: IoBuffer,
}

/// Future returned from [`IoUringReactor::push_sqe`] used to wait on completion.
///
/// Dropping it before completion submits an `AsyncCancel` for the request.
pub(crate) struct WaitHandle {
    user_data: u64,
    state: Rc<HandleState>,
    reactor: Rc<IoUringReactor>,
    finished: bool,
    _interest: PollInterest,
}

impl Future for WaitHandle {
    type Output = IoCompletion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if let Some(result) = this.state.result.borrow_mut().take() {
            tracing::trace!("WaitHandle {} completed with result: {:?}", this.user_data, result);
            this.finished = true;
            let buffer = std::mem::replace(&mut *this.state.buffer.borrow_mut(), IoBuffer::Empty);
            return Poll::Ready(IoCompletion { result, buffer });
        }

        this.state.waker.replace(Some(cx.waker().clone()));
        Poll::Pending
    }
}

impl Drop for WaitHandle {
    fn drop(&mut self) {
        if self.finished || self.state.result.borrow().is_some() {
            return;
        }
        self.state.waker.replace(None);
        tracing::debug!("WaitHandle {} dropped in flight, cancelling", self.user_data);
        let cancel = io_uring::opcode::AsyncCancel::new(self.user_data).build();
        if let Err(err) = self.reactor.push_detached(cancel) {
            tracing::warn!("failed to cancel io_uring request {}: {}", self.user_data, err);
        }
    }
}

impl IoUringReactor {
    #[tracing::instrument(level = "trace")]
    pub fn builder() -> IoUringReactorBuilder {
        IoUringReactorBuilder::new()
    }

    /// Install `reactor` as this thread's reactor.
    #[tracing::instrument(level = "trace", skip(reactor))]
    pub fn init(reactor: Rc<Self>) -> Result<(), String> {
        IOURING_REACTOR.with(|cell| {
            cell.set(reactor)
                .map_err(|_| "Failed to set IoUringReactor in thread local storage".to_string())
        })
    }

    /// This thread's reactor, created with default parameters on first use.
    #[tracing::instrument(level = "trace")]
    pub fn current() -> io::Result<Rc<Self>> {
        IOURING_REACTOR.with(|cell| {
            if let Some(reactor) = cell.get() {
                return Ok(reactor.clone());
            }
            let reactor = IoUringReactorBuilder::default().build()?;
            let _ = cell.set(reactor.clone());
            Ok(reactor)
        })
    }

    /// Register interest in completions.
    pub fn listen(self: &Rc<Self>) -> PollInterest {
        self.listeners.set(self.listeners.get() + 1);
        PollInterest {
            reactor: Rc::clone(self),
        }
    }

    /// Number of outstanding [`PollInterest`] guards.
    pub fn listeners(&self) -> usize {
        self.listeners.get()
    }

    fn next_user_data(&self) -> u64 {
        let user_data = self.user_data_counter.get();
        self.user_data_counter.set(user_data + 1);
        user_data
    }

    fn push_entry(&self, sqe: &io_uring::squeue::Entry) -> io::Result<()> {
        let mut ring = self.ring.borrow_mut();
        // SAFETY: every buffer referenced by `sqe` is kept in `completions`
        // until its CQE has been reaped.
        if unsafe { ring.submission().push(sqe) }.is_err() {
            ring.submit()?;
            self.last_submit_time.set(Instant::now());
            unsafe { ring.submission().push(sqe) }
                .map_err(|_| io::Error::other("io_uring submission queue is full"))?;
        }
        Ok(())
    }

    /// Queue `sqe`, whose pointers refer into `buffer`, and return a
    /// [`WaitHandle`] for its completion. The SQE reaches the kernel on the
    /// next reactor poll.
    #[tracing::instrument(level = "trace", skip(self, sqe, buffer))]
    pub(crate) fn push_sqe(
        self: &Rc<Self>,
        sqe: io_uring::squeue::Entry,
        buffer: IoBuffer,
    ) -> io::Result<WaitHandle> {
        let interest = self.listen();
        let user_data = self.next_user_data();
        let state = Rc::new(HandleState::new(buffer));
        self.push_entry(&sqe.user_data(user_data))?;
        self.completions.borrow_mut().insert(user_data, state.clone());

        Ok(WaitHandle {
            user_data,
            state,
            reactor: Rc::clone(self),
            finished: false,
            _interest: interest,
        })
    }

    /// Queue a request nobody waits for.
    fn push_detached(&self, sqe: io_uring::squeue::Entry) -> io::Result<()> {
        let user_data = self.next_user_data();
        self.push_entry(&sqe.user_data(user_data))?;
        self.completions
            .borrow_mut()
            .insert(user_data, Rc::new(HandleState::new(IoBuffer::Empty)));
        Ok(())
    }

    /// Submit all pending SQEs and process completions.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn poll_submit_and_completions(&self) {
        let reaped: Vec<(u64, i32)> = {
            let mut ring = self.ring.borrow_mut();
            let pending_sqe_count = ring.submission().len();
            if pending_sqe_count > 0 {
                tracing::debug!("io_uring: submitting {} SQEs", pending_sqe_count);
                if let Err(err) = ring.submit() {
                    // retried on the next poll
                    tracing::warn!("io_uring submit failed: {}", err);
                }
                self.last_submit_time.set(Instant::now());
            }
            ring.completion()
                .map(|cqe| (cqe.user_data(), cqe.result()))
                .collect()
        };

        for (user_data, res) in reaped {
            let handle_state_opt = self.completions.borrow_mut().remove(&user_data);
            let Some(handle_state) = handle_state_opt else {
                tracing::warn!("Received completion for unknown user_data: {}", user_data);
                continue;
            };
            self.completed_count.set(self.completed_count.get() + 1);
            let result = if res >= 0 {
                Ok(res)
            } else {
                Err(io::Error::from_raw_os_error(-res))
            };
            handle_state.result.replace(Some(result));

            let waker_opt = handle_state.waker.borrow_mut().take();
            match waker_opt {
                Some(waker) => waker.wake(),
                // cancelled requests and AsyncCancel itself have nobody waiting
                None => tracing::trace!("no waiter for user_data: {}", user_data),
            }
        }
    }

    /// Returns `true` if there are no pending completions.
    pub fn is_empty(&self) -> bool {
        self.completions.borrow().is_empty()
    }

    /// Number of completions processed by this reactor.
    pub fn completed_count(&self) -> u64 {
        self.completed_count.get()
    }

    pub fn completion_debug_info(&self) {
        tracing::debug!("submitted_count: {}", self.user_data_counter.get());
        tracing::debug!("completed_count: {}", self.completed_count.get());
    }
}

impl Reactor for IoUringReactor {
    fn poll(&self) {
        self.poll_submit_and_completions();
    }

    fn status(&self) -> ReactorStatus {
        // Running when:
        // 1. the submission queue reached submit_depth
        // 2. SQEs are waiting and wait_submit_timeout passed since the last submit
        // 3. requests are in flight and wait_complete_timeout passed
        let has_pending_io = !self.is_empty();
        if self.listeners.get() == 0 && !has_pending_io {
            return ReactorStatus::Stopped;
        }

        let elapsed = self.last_submit_time.get().elapsed();
        let submission_len = self.ring.borrow_mut().submission().len();
        if submission_len >= self.io_uring_params.submit_depth as usize
            || (submission_len > 0 && elapsed >= self.io_uring_params.wait_submit_timeout)
            || (has_pending_io && elapsed >= self.io_uring_params.wait_complete_timeout)
        {
            return ReactorStatus::Running;
        }
        ReactorStatus::Stopped
    }
}
