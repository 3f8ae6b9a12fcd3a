mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;

use pluvio_file::driver::parallel::{FileTask, TaskOutput};
use pluvio_file::{File, FileError, FilesystemDriver, ParallelDriver, ThreadWorkerPool, Whence};

#[test]
fn handles_go_to_the_least_loaded_worker() {
    let runtime = common::runtime();
    let dir = tempfile::tempdir().unwrap();
    runtime.block_on(async move {
        let driver = ParallelDriver::with_limit(ThreadWorkerPool::new(4), 2);
        let a = driver.open_file(&dir.path().join("a"), "w").await.unwrap();
        let b = driver.open_file(&dir.path().join("b"), "w").await.unwrap();
        let c = driver.open_file(&dir.path().join("c"), "w").await.unwrap();
        assert_eq!([a.worker_id(), b.worker_id(), c.worker_id()], [0, 1, 0]);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2), (1, 1)]));

        a.close().await.unwrap();
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 1), (1, 1)]));
        c.close().await.unwrap();
        assert_eq!(driver.worker_loads(), BTreeMap::from([(1, 1)]));

        // the untracked slot goes back to the worker the pool has idle
        let d = driver.open_file(&dir.path().join("d"), "w").await.unwrap();
        assert_eq!(d.worker_id(), 0);
        assert_eq!(driver.pool().workers().len(), 2);

        drop(b);
        drop(d);
        assert!(driver.worker_loads().is_empty());
    });
}

#[test]
fn default_limit_is_the_pool_size() {
    let runtime = common::runtime();
    let dir = tempfile::tempdir().unwrap();
    runtime.block_on(async move {
        let driver = ParallelDriver::new(ThreadWorkerPool::new(2));
        assert_eq!(driver.worker_limit(), 2);

        let mut files = Vec::new();
        for i in 0..4 {
            files.push(driver.open_file(&dir.path().join(format!("f{i}")), "w").await.unwrap());
        }
        let ids: Vec<_> = files.iter().map(|file| file.worker_id()).collect();
        assert_eq!(ids, vec![0, 1, 0, 1]);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2), (1, 2)]));

        files[1].close().await.unwrap();
        files[3].close().await.unwrap();
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2)]));

        // worker 1 is idle again and takes the next handle
        let next = driver.open_file(&dir.path().join("next"), "w").await.unwrap();
        assert_eq!(next.worker_id(), 1);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 2), (1, 1)]));
        assert_eq!(driver.pool().workers().len(), 2);
    });
}

#[test]
fn concurrent_opens_spread_evenly() {
    let runtime = common::runtime();
    let dir = tempfile::tempdir().unwrap();
    runtime.block_on(async move {
        let driver = ParallelDriver::with_limit(ThreadWorkerPool::new(3), 3);
        let paths: Vec<PathBuf> = (0..9).map(|i| dir.path().join(format!("f{i}"))).collect();
        let files = futures::future::join_all(paths.iter().map(|path| driver.open_file(path, "c")))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        assert_eq!(files.len(), 9);
        assert_eq!(driver.worker_loads(), BTreeMap::from([(0, 3), (1, 3), (2, 3)]));
    });
}

#[test]
fn pending_read_blocks_writes_and_seeks() {
    let runtime = common::runtime();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy");
    std::fs::write(&path, b"0123456789").unwrap();
    runtime.block_on(async move {
        let driver = ParallelDriver::with_limit(ThreadWorkerPool::new(1), 1);
        let file = driver.open_file(&path, "r+").await.unwrap();

        let read = file.read(None, 4);
        assert!(matches!(file.write(b"x".to_vec()).await, Err(FileError::PendingOperation)));
        assert!(matches!(file.seek(0, Whence::End), Err(FileError::PendingOperation)));
        assert!(matches!(file.read(None, 1).await, Err(FileError::PendingOperation)));

        assert_eq!(read.await.unwrap(), Some(b"0123".to_vec()));
        file.write(b"abcd".to_vec()).await.unwrap();
        file.close().await.unwrap();
    });
    assert_eq!(std::fs::read(dir.path().join("busy")).unwrap(), b"0123abcd89");
}

#[test]
fn unbound_tasks_run_on_the_pool() {
    let runtime = common::runtime();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gone");
    std::fs::write(&path, b"").unwrap();
    runtime.block_on(async move {
        let driver = ParallelDriver::with_threads();
        let reply = driver
            .submit(FileTask::DeleteFile { path: path.clone() })
            .await
            .unwrap();
        assert!(matches!(reply, TaskOutput::Done));
        assert!(!path.exists());

        let err = driver
            .submit(FileTask::DeleteFile { path })
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::FilesystemOperationFailed { .. }));
        assert!(driver.worker_loads().is_empty());
    });
}
