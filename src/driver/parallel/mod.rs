//! Pooled driver: each handle is bound to one worker that executes its
//! requests.
//!
//! Handles are spread over the pool with a least-loaded policy. The driver
//! tracks how many open handles each worker owns; while fewer than
//! `worker_limit` workers are tracked another one is requested from the pool,
//! afterwards the worker with the lowest count is reused. The limit never
//! exceeds what the pool can hand out, so a worker left idle by closed
//! handles is picked up again before a busy one is shared.

mod thread_pool;
mod worker;

pub use thread_pool::{ThreadWorker, ThreadWorkerPool, WORKERS_ENV};
pub use worker::{FileTask, RemoteHandle, TaskOutput, Worker, WorkerId, WorkerPool};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::{ready, Future};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use futures::future::{Either, LocalBoxFuture};
use futures::lock::Mutex;
use futures::FutureExt;

use crate::cancel::{with_cancellation, Cancellation};
use crate::error::{FileError, Result};
use crate::file::queued::HandleCore;
use crate::file::{File, FilesystemDriver, PathMetadata};
use crate::lock::{self, Backoff};
use crate::mode::{LockKind, OpenMode, Whence};

struct Owner {
    worker: Rc<dyn Worker>,
    handles: usize,
}

type OwnerMap = Rc<RefCell<BTreeMap<WorkerId, Owner>>>;

/// One handle's claim on a worker. Dropping it gives the claim back; the
/// last claim removes the worker from the ownership map.
pub(crate) struct WorkerLease {
    owners: OwnerMap,
    worker: Rc<dyn Worker>,
}

impl WorkerLease {
    fn worker(&self) -> &Rc<dyn Worker> {
        &self.worker
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let id = self.worker.id();
        let mut owners = self.owners.borrow_mut();
        if let Some(owner) = owners.get_mut(&id) {
            owner.handles = owner.handles.saturating_sub(1);
            if owner.handles == 0 {
                owners.remove(&id);
                tracing::debug!("ParallelDriver: worker {} released", id);
            }
        }
    }
}

struct Balancer<P> {
    pool: P,
    worker_limit: usize,
    selecting: Mutex<()>,
    owners: OwnerMap,
}

impl<P: WorkerPool> Balancer<P> {
    async fn select_worker(&self) -> Result<WorkerLease> {
        let _selecting = self.selecting.lock().await;
        loop {
            if self.owners.borrow().len() < self.worker_limit {
                let worker = self.pool.get_worker().await?;
                let id = worker.id();
                let mut owners = self.owners.borrow_mut();
                let owner = owners.entry(id).or_insert_with(|| Owner {
                    worker: Rc::clone(&worker),
                    handles: 0,
                });
                owner.handles += 1;
                tracing::debug!("ParallelDriver: new worker {} ({} tracked)", id, owners.len());
                return Ok(self.lease(worker));
            }

            let (id, worker) = {
                let owners = self.owners.borrow();
                match owners.iter().min_by_key(|(_, owner)| owner.handles) {
                    Some((id, owner)) => (*id, Rc::clone(&owner.worker)),
                    None => continue,
                }
            };
            if !worker.is_running() {
                tracing::debug!("ParallelDriver: evicting stopped worker {}", id);
                self.owners.borrow_mut().remove(&id);
                continue;
            }
            if let Some(owner) = self.owners.borrow_mut().get_mut(&id) {
                owner.handles += 1;
                tracing::debug!("ParallelDriver: reusing worker {} ({} handles)", id, owner.handles);
            }
            return Ok(self.lease(worker));
        }
    }

    fn lease(&self, worker: Rc<dyn Worker>) -> WorkerLease {
        WorkerLease {
            owners: Rc::clone(&self.owners),
            worker,
        }
    }
}

/// Opens [`ParallelFile`]s on workers drawn from a [`WorkerPool`].
pub struct ParallelDriver<P> {
    balancer: Rc<Balancer<P>>,
    backoff: Backoff,
}

impl<P> Clone for ParallelDriver<P> {
    fn clone(&self) -> Self {
        ParallelDriver {
            balancer: Rc::clone(&self.balancer),
            backoff: self.backoff,
        }
    }
}

impl ParallelDriver<ThreadWorkerPool> {
    /// Driver over a [`ThreadWorkerPool`] sized from the environment.
    pub fn with_threads() -> Self {
        Self::new(ThreadWorkerPool::from_env())
    }
}

impl<P: WorkerPool> ParallelDriver<P> {
    /// Spread handles over as many workers as `pool` offers.
    pub fn new(pool: P) -> Self {
        let worker_limit = pool.worker_limit();
        Self::with_limit(pool, worker_limit)
    }

    /// Spread handles over at most `worker_limit` workers, clamped to the
    /// pool's own limit.
    pub fn with_limit(pool: P, worker_limit: usize) -> Self {
        let worker_limit = worker_limit.clamp(1, pool.worker_limit().max(1));
        tracing::debug!("ParallelDriver: worker limit {}", worker_limit);
        ParallelDriver {
            balancer: Rc::new(Balancer {
                pool,
                worker_limit,
                selecting: Mutex::new(()),
                owners: Rc::new(RefCell::new(BTreeMap::new())),
            }),
            backoff: Backoff::default(),
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &P {
        &self.balancer.pool
    }

    pub fn worker_limit(&self) -> usize {
        self.balancer.worker_limit
    }

    /// Open handles per tracked worker.
    pub fn worker_loads(&self) -> BTreeMap<WorkerId, usize> {
        self.balancer
            .owners
            .borrow()
            .iter()
            .map(|(id, owner)| (*id, owner.handles))
            .collect()
    }

    /// Run a task that is not bound to a handle.
    pub fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
        self.balancer.pool.submit(task)
    }
}

impl<P: WorkerPool + 'static> FilesystemDriver for ParallelDriver<P> {
    type File = ParallelFile;

    fn open_file(&self, path: &Path, mode: &str) -> impl Future<Output = Result<ParallelFile>> {
        let balancer = Rc::clone(&self.balancer);
        let backoff = self.backoff;
        let path = path.to_path_buf();
        let mode = OpenMode::parse(mode);
        async move {
            let mode = mode?;
            let lease = balancer.select_worker().await?;
            let opened = lease
                .worker()
                .submit(FileTask::Open {
                    path: path.clone(),
                    mode: mode.clone(),
                })
                .await?;
            let (handle, size) = opened.into_opened()?;
            tracing::debug!(
                "ParallelDriver: opened {} on worker {} mode={} size={}",
                path.display(),
                lease.worker().id(),
                mode,
                size
            );
            Ok(ParallelFile {
                core: HandleCore::new(path.clone(), mode, size),
                remote: Rc::new(RemoteFile {
                    worker_id: lease.worker().id(),
                    lease: RefCell::new(Some(lease)),
                    handle,
                    path,
                }),
                backoff,
            })
        }
    }
}

impl<P: WorkerPool> PathMetadata for ParallelDriver<P> {
    fn is_directory(&self, path: &Path) -> impl Future<Output = Result<bool>> {
        let reply = self.submit(FileTask::IsDirectory {
            path: path.to_path_buf(),
        });
        async move { reply.await?.into_is_directory() }
    }

    fn delete_file(&self, path: &Path) -> impl Future<Output = Result<()>> {
        let reply = self.submit(FileTask::DeleteFile {
            path: path.to_path_buf(),
        });
        async move { reply.await?.into_done() }
    }
}

/// Remote side of a [`ParallelFile`]. The worker is only reachable through
/// the lease, so a closed handle keeps nothing alive on the pool side.
struct RemoteFile {
    worker_id: WorkerId,
    lease: RefCell<Option<WorkerLease>>,
    handle: RemoteHandle,
    path: PathBuf,
}

impl RemoteFile {
    fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
        match &*self.lease.borrow() {
            Some(lease) => lease.worker().submit(task),
            None => ready(Err(FileError::closed(&self.path))).boxed_local(),
        }
    }

    /// Close the remote file and give the worker claim back.
    fn close(&self) -> impl Future<Output = Result<()>> + 'static {
        let Some(lease) = self.lease.borrow_mut().take() else {
            return Either::Left(ready(Ok(())));
        };
        let reply = lease.worker().submit(FileTask::Close {
            handle: self.handle,
        });
        drop(lease);
        Either::Right(async move { reply.await?.into_done() })
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        if self.lease.borrow().is_none() {
            return;
        }
        let path = self.path.clone();
        // the task is already on its way; only the reply is left to watch
        let closing = self.close();
        let watched = crate::executor::try_spawn(async move {
            if let Err(err) = closing.await {
                tracing::warn!("best-effort close of {} failed: {}", path.display(), err);
            }
        });
        if watched.is_none() {
            tracing::trace!("RemoteFile: close of {} sent without a runtime", self.path.display());
        }
    }
}

/// Handle whose I/O runs on a pool worker.
pub struct ParallelFile {
    core: Rc<HandleCore>,
    remote: Rc<RemoteFile>,
    backoff: Backoff,
}

impl ParallelFile {
    /// Worker this handle is bound to.
    pub fn worker_id(&self) -> WorkerId {
        self.remote.worker_id
    }
}

fn close_handle(core: &Rc<HandleCore>, remote: Rc<RemoteFile>) -> LocalBoxFuture<'static, Result<()>> {
    core.close_with(move || remote.close())
}

impl File for ParallelFile {
    fn read(
        &self,
        cancellation: Option<Cancellation>,
        length: usize,
    ) -> impl Future<Output = Result<Option<Vec<u8>>>> {
        let submitted = self.core.begin_read(length).and_then(|ticket| {
            if let Some(cancellation) = &cancellation {
                cancellation.check()?;
            }
            if ticket.length() == 0 {
                return Ok(None);
            }
            let reply = self.remote.submit(FileTask::Read {
                handle: self.remote.handle,
                offset: ticket.offset(),
                length: ticket.length(),
            });
            Ok(Some((ticket, reply)))
        });
        async move {
            let Some((ticket, reply)) = submitted? else {
                return Ok(None);
            };
            // a cancelled read's data is discarded and the cursor stays put
            let data = with_cancellation(reply, cancellation.as_ref()).await??.into_data()?;
            Ok(ticket.complete(data))
        }
    }

    fn write(&self, bytes: Vec<u8>) -> impl Future<Output = Result<()>> {
        let remote = Rc::clone(&self.remote);
        let queued = self.core.queue_write(move |offset| {
            let reply = remote.submit(FileTask::Write {
                handle: remote.handle,
                offset,
                data: bytes,
            });
            async move { reply.await?.into_written() }
        });
        async move { queued?.await }
    }

    fn truncate(&self, size: u64) -> impl Future<Output = Result<()>> {
        let remote = Rc::clone(&self.remote);
        let queued = self.core.queue_truncate(size, move |size| {
            let reply = remote.submit(FileTask::Truncate {
                handle: remote.handle,
                size,
            });
            async move { reply.await?.into_done() }
        });
        async move { queued?.await }
    }

    fn seek(&self, offset: i64, whence: Whence) -> Result<u64> {
        self.core.seek(offset, whence)
    }

    fn tell(&self) -> u64 {
        self.core.tell()
    }

    fn eof(&self) -> bool {
        self.core.eof()
    }

    fn close(&self) -> impl Future<Output = Result<()>> {
        close_handle(&self.core, Rc::clone(&self.remote))
    }

    fn end(&self) -> impl Future<Output = Result<()>> {
        let core = Rc::clone(&self.core);
        let remote = Rc::clone(&self.remote);
        self.core.end_with(move || close_handle(&core, remote))
    }

    fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    fn on_close<F>(&self, observer: F)
    where
        F: FnOnce() + 'static,
    {
        self.core.on_close(Box::new(observer));
    }

    fn lock(&self, kind: LockKind, cancellation: Option<Cancellation>) -> impl Future<Output = Result<()>> {
        async move { lock::acquire(self, kind, &self.backoff, cancellation.as_ref()).await }
    }

    fn try_lock(&self, kind: LockKind) -> impl Future<Output = Result<bool>> {
        let core = Rc::clone(&self.core);
        let reply = core.ensure_open().map(|()| {
            self.remote.submit(FileTask::TryLock {
                handle: self.remote.handle,
                kind,
            })
        });
        async move {
            let locked = reply?.await?.into_locked()?;
            core.record_lock_attempt(kind, locked);
            Ok(locked)
        }
    }

    fn unlock(&self) -> impl Future<Output = Result<()>> {
        let core = Rc::clone(&self.core);
        let reply = core.ensure_open().map(|()| {
            self.remote.submit(FileTask::Unlock {
                handle: self.remote.handle,
            })
        });
        async move {
            reply?.await?.into_done()?;
            core.set_lock_kind(None);
            Ok(())
        }
    }

    fn lock_kind(&self) -> Option<LockKind> {
        self.core.lock_kind()
    }

    fn path(&self) -> &Path {
        self.core.path()
    }

    fn mode(&self) -> &OpenMode {
        self.core.mode()
    }

    fn is_readable(&self) -> bool {
        self.core.mode().is_readable()
    }

    fn is_writable(&self) -> bool {
        self.core.is_writable()
    }

    fn is_seekable(&self) -> bool {
        true
    }
}

impl std::fmt::Debug for ParallelFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelFile")
            .field("path", &self.remote.path)
            .field("worker", &self.worker_id())
            .field("position", &self.core.tell())
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct StubWorker {
        id: WorkerId,
        running: Cell<bool>,
    }

    impl Worker for StubWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        fn is_running(&self) -> bool {
            self.running.get()
        }

        fn submit(&self, _task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
            ready(Err(FileError::WorkerTransportFailed {
                message: "stub".to_string(),
            }))
            .boxed_local()
        }
    }

    #[derive(Default)]
    struct StubPool {
        issued: RefCell<Vec<Rc<StubWorker>>>,
    }

    impl WorkerPool for StubPool {
        fn get_worker(&self) -> LocalBoxFuture<'static, Result<Rc<dyn Worker>>> {
            let mut issued = self.issued.borrow_mut();
            let worker = Rc::new(StubWorker {
                id: issued.len() as WorkerId,
                running: Cell::new(true),
            });
            issued.push(Rc::clone(&worker));
            ready(Ok(worker as Rc<dyn Worker>)).boxed_local()
        }

        fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
            self.get_worker().then(move |worker| worker.unwrap().submit(task)).boxed_local()
        }

        fn worker_limit(&self) -> usize {
            usize::MAX
        }
    }

    /// Hands out at most two workers, preferring ones nobody else holds.
    #[derive(Default)]
    struct PairPool {
        workers: RefCell<Vec<Rc<StubWorker>>>,
    }

    impl WorkerPool for PairPool {
        fn get_worker(&self) -> LocalBoxFuture<'static, Result<Rc<dyn Worker>>> {
            let mut workers = self.workers.borrow_mut();
            let idle = workers.iter().find(|worker| Rc::strong_count(worker) == 1).cloned();
            let worker = match idle {
                Some(worker) => worker,
                None if workers.len() < 2 => {
                    let worker = Rc::new(StubWorker {
                        id: workers.len() as WorkerId,
                        running: Cell::new(true),
                    });
                    workers.push(Rc::clone(&worker));
                    worker
                }
                None => Rc::clone(&workers[0]),
            };
            ready(Ok(worker as Rc<dyn Worker>)).boxed_local()
        }

        fn submit(&self, task: FileTask) -> LocalBoxFuture<'static, Result<TaskOutput>> {
            self.get_worker().then(move |worker| worker.unwrap().submit(task)).boxed_local()
        }

        fn worker_limit(&self) -> usize {
            2
        }
    }

    fn select<P: WorkerPool>(driver: &ParallelDriver<P>) -> WorkerLease {
        futures::executor::block_on(driver.balancer.select_worker()).unwrap()
    }

    #[test]
    fn least_loaded_worker_is_reused() {
        let driver = ParallelDriver::with_limit(StubPool::default(), 2);
        let a = select(&driver);
        let b = select(&driver);
        let c = select(&driver);
        assert_eq!(driver.pool().issued.borrow().len(), 2);
        assert_eq!(a.worker().id(), 0);
        assert_eq!(b.worker().id(), 1);
        // tie goes to the lowest id
        assert_eq!(c.worker().id(), 0);

        let d = select(&driver);
        assert_eq!(d.worker().id(), 1);
        drop(a);
        drop(c);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(1, 2)]));

        // worker 0 left the map, so there is room for a fresh one
        let e = select(&driver);
        assert_eq!(e.worker().id(), 2);
        assert_eq!(driver.pool().issued.borrow().len(), 3);
        drop((b, d, e));
        assert!(driver.worker_loads().is_empty());
    }

    #[test]
    fn stopped_worker_is_evicted() {
        let driver = ParallelDriver::with_limit(StubPool::default(), 2);
        let _a = select(&driver);
        let _b = select(&driver);
        let _c = select(&driver);
        driver.pool().issued.borrow()[1].running.set(false);

        let d = select(&driver);
        assert_eq!(d.worker().id(), 2);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2), (2, 1)]));
    }

    #[test]
    fn limit_follows_the_pool() {
        assert_eq!(ParallelDriver::new(PairPool::default()).worker_limit(), 2);
        assert_eq!(ParallelDriver::with_limit(PairPool::default(), 8).worker_limit(), 2);
        assert_eq!(ParallelDriver::with_limit(PairPool::default(), 0).worker_limit(), 1);
        assert_eq!(ParallelDriver::with_limit(StubPool::default(), 3).worker_limit(), 3);
    }

    #[test]
    fn idle_pool_worker_is_preferred_over_a_busy_one() {
        let driver = ParallelDriver::new(PairPool::default());
        let leases: Vec<WorkerLease> = (0..4).map(|_| select(&driver)).collect();
        let ids: Vec<WorkerId> = leases.iter().map(|lease| lease.worker().id()).collect();
        assert_eq!(ids, vec![0, 1, 0, 1]);

        let mut leases = leases.into_iter();
        let (a, b, c, d) = (leases.next(), leases.next(), leases.next(), leases.next());
        drop((b, d));
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2)]));

        let e = select(&driver);
        assert_eq!(e.worker().id(), 1);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2), (1, 1)]));
        drop((a, c, e));
    }
}
