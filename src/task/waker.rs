//! Waker used by [`Task`](crate::task::Task).

use std::sync::{mpsc::Sender, Arc};

use futures::task::ArcWake;

/// Requeues its task id onto the runtime's ready channel when woken.
#[derive(Debug)]
struct TaskWaker {
    task_id: usize,
    task_sender: Sender<usize>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        // The runtime may already be gone when a stray waker fires during teardown.
        if arc_self.task_sender.send(arc_self.task_id).is_err() {
            tracing::trace!("TaskWaker: runtime dropped, task {} not requeued", arc_self.task_id);
        }
    }
}

/// Create a [`std::task::Waker`] that requeues the task onto the runtime.
pub(crate) fn new_waker(sender: Sender<usize>, task_id: usize) -> std::task::Waker {
    futures::task::waker(Arc::new(TaskWaker {
        task_id,
        task_sender: sender,
    }))
}
