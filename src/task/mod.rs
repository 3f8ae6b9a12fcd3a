//! Task abstractions used by the [`Runtime`](crate::executor::Runtime).
//!
//! This module provides the [`Task`] type and the [`JoinHandle`] returned when
//! spawning tasks.

mod waker;

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::mpsc::Sender;
use std::task::{Context, Poll, Waker};

use crate::task::waker::new_waker;

/// Shared state between a running task and its [`JoinHandle`].
pub struct SharedState<T> {
    waker: Option<Waker>,
    result: Option<T>,
}

impl<T> Default for SharedState<T> {
    fn default() -> Self {
        SharedState {
            waker: None,
            result: None,
        }
    }
}

/// Handle returned from [`Runtime::spawn`](crate::executor::Runtime::spawn) that
/// allows awaiting the output of a task.
pub struct JoinHandle<T> {
    shared_state: Rc<RefCell<SharedState<T>>>,
}

impl<T> JoinHandle<T> {
    /// Take the output if the task already finished.
    pub fn try_take(&self) -> Option<T> {
        self.shared_state.borrow_mut().result.take()
    }

    pub fn is_finished(&self) -> bool {
        self.shared_state.borrow().result.is_some()
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared_state.borrow_mut();

        if let Some(result) = shared.result.take() {
            return Poll::Ready(result);
        }

        shared.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

/// A spawned future together with the channel used to reschedule it.
pub struct Task {
    future: Pin<Box<dyn Future<Output = ()> + 'static>>,
    task_sender: Sender<usize>,
    task_name: Option<String>,
}

impl Task {
    pub fn create_task_and_handle<F, T>(
        future: F,
        sender: Sender<usize>,
        task_name: Option<String>,
    ) -> (Task, JoinHandle<T>)
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let shared = Rc::new(RefCell::new(SharedState::default()));
        let handle = JoinHandle {
            shared_state: shared.clone(),
        };

        let wrapped_future = async move {
            let res = future.await;
            let waker = {
                let mut state = shared.borrow_mut();
                state.result = Some(res);
                state.waker.take()
            };
            if let Some(waker) = waker {
                tracing::trace!("Task: output ready, waking join handle");
                waker.wake();
            }
        };

        let task = Task {
            future: Box::pin(wrapped_future),
            task_sender: sender,
            task_name,
        };
        (task, handle)
    }

    /// Poll the task once with a waker that requeues `task_id`.
    pub fn poll_task(&mut self, task_id: usize) -> Poll<()> {
        let waker = new_waker(self.task_sender.clone(), task_id);
        let mut context = Context::from_waker(&waker);
        self.future.as_mut().poll(&mut context)
    }

    pub fn name(&self) -> Option<&str> {
        self.task_name.as_deref()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("task_name", &self.task_name)
            .finish()
    }
}
