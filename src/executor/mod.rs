//! Task executor for the pluvio_file runtime.
//!
//! This module contains the [`Runtime`] which schedules tasks and polls
//! registered reactors on a single thread. File handles never block the
//! scheduler unless the caller picked the blocking driver.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    future::Future,
    rc::Rc,
    sync::mpsc::{channel, Receiver, Sender},
    task::Poll,
};

use slab::Slab;

use crate::{
    reactor::{Reactor, ReactorStatus},
    task::{JoinHandle, Task},
    timer::TimerReactor,
};

thread_local! {
    static RUNTIME: RefCell<Option<Rc<Runtime>>> = const { RefCell::new(None) };
}

/// Install `runtime` as the current thread's runtime.
pub fn set_runtime(runtime: Rc<Runtime>) {
    RUNTIME.with(|cell| *cell.borrow_mut() = Some(runtime));
}

/// The current thread's runtime, if one was installed with [`set_runtime`].
pub fn get_runtime() -> Option<Rc<Runtime>> {
    RUNTIME.with(|cell| cell.borrow().clone())
}

pub fn clear_runtime() {
    RUNTIME.with(|cell| cell.borrow_mut().take());
}

/// Spawn onto the thread's runtime.
///
/// # Panics
///
/// Panics if no runtime was installed with [`set_runtime`].
pub fn spawn<F, T>(future: F) -> JoinHandle<T>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    try_spawn(future).expect("no runtime installed on this thread; call set_runtime first")
}

/// Spawn onto the thread's runtime, or return `None` when there is none.
pub fn try_spawn<F, T>(future: F) -> Option<JoinHandle<T>>
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    get_runtime().map(|runtime| runtime.spawn(future))
}

/// Internal wrapper used to keep state for a registered reactor.
struct ReactorWrapper {
    reactor: Rc<dyn Reactor>,
    /// Number of times the reactor has been polled.
    poll_counter: Cell<usize>,
}

/// Single-threaded cooperative runtime that manages reactors and tasks.
pub struct Runtime {
    reactors: RefCell<HashMap<&'static str, ReactorWrapper>>,
    task_sender: Sender<usize>,
    task_receiver: Receiver<usize>,
    task_pool: RefCell<Slab<Option<Task>>>,
}

impl Runtime {
    /// Creates a new runtime with room for `queue_size` tasks before the pool grows.
    ///
    /// The thread's [`TimerReactor`] is registered automatically since lock
    /// backoff depends on it.
    pub fn new(queue_size: u64) -> Rc<Self> {
        let (task_sender, task_receiver) = channel();
        let runtime = Rc::new(Runtime {
            reactors: RefCell::new(HashMap::new()),
            task_sender,
            task_receiver,
            task_pool: RefCell::new(Slab::with_capacity(queue_size as usize)),
        });
        runtime.register_reactor("timer", TimerReactor::current());
        runtime
    }

    /// Spawn a future onto the runtime and return a [`JoinHandle`] to await
    /// its result.
    pub fn spawn<F, T>(&self, future: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn_inner(future, None)
    }

    /// Spawn a task and associate a name with it for diagnostics.
    pub fn spawn_with_name<F, T>(&self, future: F, task_name: String) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn_inner(future, Some(task_name))
    }

    fn spawn_inner<F, T>(&self, future: F, task_name: Option<String>) -> JoinHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let (task, handle) =
            Task::create_task_and_handle(future, self.task_sender.clone(), task_name);
        let task_id = self.task_pool.borrow_mut().insert(Some(task));
        tracing::trace!("Runtime::spawn task_id: {}", task_id);

        // The receiver lives in `self`, so the send cannot fail.
        let _ = self.task_sender.send(task_id);
        handle
    }

    /// Register a reactor instance with this runtime. Registering under an
    /// existing id replaces the previous reactor.
    pub fn register_reactor<R>(&self, id: &'static str, reactor: R)
    where
        R: Reactor + 'static,
    {
        let reactor_wrapper = ReactorWrapper {
            reactor: Rc::new(reactor) as Rc<dyn Reactor>,
            poll_counter: Cell::new(0),
        };
        self.reactors.borrow_mut().insert(id, reactor_wrapper);
        tracing::debug!("Reactor {} registered", id);
    }

    /// Number of times the reactor registered under `id` has been polled.
    pub fn reactor_poll_count(&self, id: &str) -> Option<usize> {
        self.reactors
            .borrow()
            .get(id)
            .map(|wrapper| wrapper.poll_counter.get())
    }

    /// Number of tasks that have not finished yet.
    pub fn pending_tasks(&self) -> usize {
        self.task_pool.borrow().len()
    }

    /// Run tasks until the task pool becomes empty.
    pub fn run_queue(&self) {
        while self.pending_tasks() > 0 {
            self.turn();
        }
    }

    /// Run the provided future, then keep driving until every task finished.
    pub fn run<F, T>(&self, future: F)
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        self.spawn(future);
        self.run_queue();
    }

    /// Drive the runtime until `future` completes and return its output.
    /// Other tasks still pending at that point stay in the pool.
    pub fn block_on<F, T>(&self, future: F) -> T
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let handle = self.spawn(future);
        loop {
            if let Some(output) = handle.try_take() {
                return output;
            }
            self.turn();
        }
    }

    /// One scheduler pass: poll the tasks that are ready right now, then the reactors.
    fn turn(&self) {
        // A task that wakes itself while polled must wait for the next pass,
        // so only the ids queued before this point are handled.
        let ready: Vec<usize> = self.task_receiver.try_iter().collect();
        let idle = ready.is_empty();
        for task_id in ready {
            self.poll_task(task_id);
        }

        let mut any_running = false;
        for (id, reactor_wrapper) in self.reactors.borrow().iter() {
            if let ReactorStatus::Running = reactor_wrapper.reactor.status() {
                reactor_wrapper.reactor.poll();
                reactor_wrapper
                    .poll_counter
                    .set(reactor_wrapper.poll_counter.get() + 1);
                tracing::trace!("Reactor {} polled", id);
                any_running = true;
            }
        }

        if idle && !any_running {
            std::thread::yield_now();
        }
    }

    /// Poll a single task by its id. Stale ids (task already finished) are ignored.
    pub fn poll_task(&self, task_id: usize) -> Poll<()> {
        let task = {
            let mut pool = self.task_pool.borrow_mut();
            match pool.get_mut(task_id).and_then(Option::take) {
                Some(task) => task,
                None => {
                    tracing::trace!("Runtime::poll_task stale wake for task {}", task_id);
                    return Poll::Pending;
                }
            }
        };

        let mut task = task;
        let ret = task.poll_task(task_id);
        match ret {
            Poll::Ready(()) => {
                let finished = self.task_pool.borrow_mut().remove(task_id);
                tracing::trace!(
                    "Task {} ({:?}) completed, remaining tasks: {}",
                    task_id,
                    task.name(),
                    self.pending_tasks()
                );
                // Dropping outside the borrow lets destructors spawn new tasks.
                drop(finished);
                drop(task);
            }
            Poll::Pending => {
                if let Some(slot) = self.task_pool.borrow_mut().get_mut(task_id) {
                    slot.replace(task);
                }
            }
        }
        ret
    }
}
