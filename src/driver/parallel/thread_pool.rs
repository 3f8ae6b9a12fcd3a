//! Default [`WorkerPool`]: file tasks run on background threads and replies
//! come back over `futures` oneshot channels, whose wakers reschedule the
//! waiting task on the runtime.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::fd::{AsRawFd, IntoRawFd};
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{ready, LocalBoxFuture};
use futures::FutureExt;

use crate::driver::parallel::worker::{FileTask, RemoteHandle, TaskOutput, Worker, WorkerId, WorkerPool};
use crate::error::{FileError, Result};
use crate::file::fd::close_raw;
use crate::lock;

/// Environment variable read by [`ThreadWorkerPool::from_env`].
pub const WORKERS_ENV: &str = "PLUVIO_FILE_WORKERS";

struct Job {
    task: FileTask,
    reply: oneshot::Sender<Result<TaskOutput>>,
}

/// A background thread owning the files opened on it.
pub struct ThreadWorker {
    id: WorkerId,
    sender: RefCell<Option<mpsc::Sender<Job>>>,
    running: Arc<AtomicBool>,
}

impl ThreadWorker {
    fn spawn(id: WorkerId) -> Result<Rc<Self>> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);
        std::thread::Builder::new()
            .name(format!("pluvio-file-worker-{id}"))
            .spawn(move || {
                let mut files = RemoteFiles::default();
                while let Ok(job) = receiver.recv() {
                    let name = job.task.name();
                    let result = files.execute(job.task);
                    if job.reply.send(result).is_err() {
                        tracing::trace!("worker {}: {} reply dropped", id, name);
                    }
                }
                thread_running.store(false, Ordering::Release);
                tracing::debug!("worker {} stopped with {} files open", id, files.files.len());
            })
            .map_err(|err| FileError::WorkerTransportFailed {
                message: format!("failed to spawn worker thread: {err}"),
            })?;
        tracing::debug!("ThreadWorker {} spawned", id);
        Ok(Rc::new(ThreadWorker {
            id,
            sender: RefCell::new(Some(sender)),
            running,
        }))
    }

    /// Stop accepting tasks. The thread exits after the tasks already sent.
    pub fn shutdown(&self) {
        self.sender.borrow_mut().take();
    }
}

impl Worker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn is_running(&self) -> bool {
        self.sender.borrow().is_some() && self.running.load(Ordering::Acquire)
    }

    fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
        let (reply, receiver) = oneshot::channel();
        let name = task.name();
        let sent = match &*self.sender.borrow() {
            Some(sender) => sender.send(Job { task, reply }).is_ok(),
            None => false,
        };
        if !sent {
            return ready(Err(FileError::WorkerTransportFailed {
                message: format!("worker {} is not running", self.id),
            }))
            .boxed_local();
        }
        let id = self.id;
        async move {
            receiver.await.map_err(|_| FileError::WorkerTransportFailed {
                message: format!("worker {id} went away before answering {name}"),
            })?
        }
        .boxed_local()
    }
}

/// Files opened on one worker thread.
#[derive(Default)]
struct RemoteFiles {
    files: HashMap<u64, (std::fs::File, PathBuf)>,
    next_handle: u64,
}

impl RemoteFiles {
    fn get(&self, handle: RemoteHandle) -> Result<&(std::fs::File, PathBuf)> {
        self.files.get(&handle.0).ok_or_else(|| {
            FileError::Closed(format!("remote handle {} is not open", handle.0))
        })
    }

    fn execute(&mut self, task: FileTask) -> Result<TaskOutput> {
        match task {
            FileTask::Open { path, mode } => {
                let file = mode.to_positional_options().open(&path).map_err(|err| {
                    FileError::from_io(format!("failed to open '{}'", path.display()), err)
                })?;
                let size = file
                    .metadata()
                    .map_err(|err| {
                        FileError::from_io(format!("failed to stat '{}'", path.display()), err)
                    })?
                    .len();
                let handle = RemoteHandle(self.next_handle);
                self.next_handle += 1;
                self.files.insert(handle.0, (file, path));
                Ok(TaskOutput::Opened { handle, size })
            }
            FileTask::Read {
                handle,
                offset,
                length,
            } => {
                let (file, path) = self.get(handle)?;
                let mut data = vec![0u8; length];
                let mut filled = 0;
                while filled < length {
                    let n = file
                        .read_at(&mut data[filled..], offset + filled as u64)
                        .map_err(|err| {
                            FileError::from_io(format!("failed to read '{}'", path.display()), err)
                        })?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                data.truncate(filled);
                Ok(TaskOutput::Data(data))
            }
            FileTask::Write {
                handle,
                offset,
                data,
            } => {
                let (file, path) = self.get(handle)?;
                file.write_all_at(&data, offset).map_err(|err| {
                    FileError::from_io(format!("failed to write '{}'", path.display()), err)
                })?;
                Ok(TaskOutput::Written(data.len()))
            }
            FileTask::Truncate { handle, size } => {
                let (file, path) = self.get(handle)?;
                file.set_len(size).map_err(|err| {
                    FileError::from_io(format!("failed to truncate '{}'", path.display()), err)
                })?;
                Ok(TaskOutput::Done)
            }
            FileTask::TryLock { handle, kind } => {
                let (file, path) = self.get(handle)?;
                Ok(TaskOutput::Locked(lock::try_flock(file.as_raw_fd(), path, kind)?))
            }
            FileTask::Unlock { handle } => {
                let (file, path) = self.get(handle)?;
                lock::unlock_flock(file.as_raw_fd(), path)?;
                Ok(TaskOutput::Done)
            }
            FileTask::Close { handle } => {
                let (file, path) = self.files.remove(&handle.0).ok_or_else(|| {
                    FileError::Closed(format!("remote handle {} is not open", handle.0))
                })?;
                close_raw(file.into_raw_fd(), &path)?;
                Ok(TaskOutput::Done)
            }
            FileTask::IsDirectory { path } => match std::fs::metadata(&path) {
                Ok(metadata) => Ok(TaskOutput::IsDirectory(metadata.is_dir())),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Ok(TaskOutput::IsDirectory(false))
                }
                Err(err) => Err(FileError::from_io(
                    format!("failed to stat '{}'", path.display()),
                    err,
                )),
            },
            FileTask::DeleteFile { path } => {
                std::fs::remove_file(&path).map_err(|err| {
                    FileError::from_io(format!("failed to delete '{}'", path.display()), err)
                })?;
                Ok(TaskOutput::Done)
            }
        }
    }
}

/// Pool of [`ThreadWorker`]s.
///
/// `get_worker` hands out a worker nobody else holds when there is one,
/// otherwise starts a thread until `max_workers` exist, otherwise shares the
/// least held worker.
pub struct ThreadWorkerPool {
    max_workers: usize,
    workers: RefCell<Vec<Rc<ThreadWorker>>>,
    next_id: Cell<WorkerId>,
}

impl ThreadWorkerPool {
    pub fn new(max_workers: usize) -> Self {
        ThreadWorkerPool {
            max_workers: max_workers.max(1),
            workers: RefCell::new(Vec::new()),
            next_id: Cell::new(0),
        }
    }

    /// Pool sized by `PLUVIO_FILE_WORKERS`, or by the available parallelism.
    pub fn from_env() -> Self {
        let max_workers = std::env::var(WORKERS_ENV)
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .or_else(|| std::thread::available_parallelism().ok().map(usize::from))
            .unwrap_or(4);
        tracing::debug!("ThreadWorkerPool: {} workers", max_workers);
        Self::new(max_workers)
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Workers started so far, including stopped ones not yet replaced.
    pub fn workers(&self) -> Vec<Rc<ThreadWorker>> {
        self.workers.borrow().clone()
    }

    fn next_worker(&self) -> Result<Rc<ThreadWorker>> {
        let mut workers = self.workers.borrow_mut();
        workers.retain(|worker| worker.is_running());
        // the pool's own reference is the only one left
        if let Some(idle) = workers.iter().find(|worker| Rc::strong_count(worker) == 1) {
            tracing::trace!("ThreadWorkerPool: reusing idle worker {}", idle.id);
            return Ok(Rc::clone(idle));
        }
        if workers.len() < self.max_workers {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            let worker = ThreadWorker::spawn(id)?;
            workers.push(Rc::clone(&worker));
            return Ok(worker);
        }
        workers
            .iter()
            .min_by_key(|worker| Rc::strong_count(worker))
            .cloned()
            .ok_or_else(|| FileError::WorkerTransportFailed {
                message: "thread pool has no workers".to_string(),
            })
    }
}

impl Default for ThreadWorkerPool {
    fn default() -> Self {
        Self::from_env()
    }
}

impl WorkerPool for ThreadWorkerPool {
    fn get_worker(&self) -> LocalBoxFuture<'static, Result<Rc<dyn Worker>>> {
        ready(self.next_worker().map(|worker| worker as Rc<dyn Worker>)).boxed_local()
    }

    fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
        match self.next_worker() {
            Ok(worker) => worker.submit(task),
            Err(err) => ready(Err(err)).boxed_local(),
        }
    }

    fn worker_limit(&self) -> usize {
        self.max_workers
    }
}

impl Drop for ThreadWorkerPool {
    fn drop(&mut self) {
        for worker in self.workers.borrow().iter() {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{LockKind, OpenMode};
    use futures::executor::block_on;

    #[test]
    fn worker_executes_file_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote");
        let pool = ThreadWorkerPool::new(1);
        block_on(async {
            let worker = pool.get_worker().await.unwrap();
            let (handle, size) = worker
                .submit(FileTask::Open {
                    path: path.clone(),
                    mode: OpenMode::parse("c+").unwrap(),
                })
                .await
                .unwrap()
                .into_opened()
                .unwrap();
            assert_eq!(size, 0);

            let written = worker
                .submit(FileTask::Write {
                    handle,
                    offset: 2,
                    data: b"xyz".to_vec(),
                })
                .await
                .unwrap();
            assert_eq!(written, TaskOutput::Written(3));

            let data = worker
                .submit(FileTask::Read {
                    handle,
                    offset: 2,
                    length: 10,
                })
                .await
                .unwrap();
            assert_eq!(data, TaskOutput::Data(b"xyz".to_vec()));

            let locked = worker
                .submit(FileTask::TryLock {
                    handle,
                    kind: LockKind::Exclusive,
                })
                .await
                .unwrap();
            assert_eq!(locked, TaskOutput::Locked(true));

            worker.submit(FileTask::Close { handle }).await.unwrap();
            let err = worker.submit(FileTask::Close { handle }).await.unwrap_err();
            assert!(matches!(err, FileError::Closed(_)));
        });
    }

    #[test]
    fn remote_failure_is_filesystem_error() {
        let dir = tempfile::tempdir().unwrap();
        let pool = ThreadWorkerPool::new(1);
        let err = block_on(pool.submit(FileTask::Open {
            path: dir.path().join("missing"),
            mode: OpenMode::parse("r").unwrap(),
        }))
        .unwrap_err();
        assert!(matches!(err, FileError::FilesystemOperationFailed { .. }));
    }

    #[test]
    fn stopped_worker_is_a_transport_failure() {
        let pool = ThreadWorkerPool::new(1);
        let worker = pool.next_worker().unwrap();
        worker.shutdown();
        assert!(!worker.is_running());
        let err = block_on(worker.submit(FileTask::IsDirectory {
            path: PathBuf::from("/"),
        }))
        .unwrap_err();
        assert!(matches!(err, FileError::WorkerTransportFailed { .. }));

        // the pool replaces it
        let replacement = pool.next_worker().unwrap();
        assert_ne!(replacement.id(), worker.id());
    }

    #[test]
    fn pool_caps_thread_count() {
        let pool = ThreadWorkerPool::new(2);
        let first = pool.next_worker().unwrap();
        let second = pool.next_worker().unwrap();
        assert_eq!((first.id(), second.id()), (0, 1));

        // both are held: the least held one is shared
        let third = pool.next_worker().unwrap();
        assert_eq!(third.id(), 0);
        let fourth = pool.next_worker().unwrap();
        assert_eq!(fourth.id(), 1);
        assert_eq!(pool.workers().len(), 2);
        assert_eq!(pool.worker_limit(), 2);
    }

    #[test]
    fn idle_worker_is_handed_out_first() {
        let pool = ThreadWorkerPool::new(2);
        let first = pool.next_worker().unwrap();
        let second = pool.next_worker().unwrap();
        let shared = pool.next_worker().unwrap();
        assert_eq!(shared.id(), 0);

        drop(second);
        assert_eq!(pool.next_worker().unwrap().id(), 1);
        drop((first, shared));
        assert_eq!(pool.next_worker().unwrap().id(), 0);
        assert_eq!(pool.workers().len(), 2);
    }
}
