//! Demo binary exercising each driver and the mutexes.

use std::path::Path;
use std::time::Instant;

use pluvio_file::{
    BlockingDriver, File, FileError, FileMutex, FilesystemDriver, LockKind, ParallelDriver,
    Runtime, ThreadWorkerPool, UringDriver, Whence,
};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CHUNK: usize = 64 * 1024;
const CHUNKS: usize = 64;

async fn exercise<D: FilesystemDriver>(name: &str, driver: &D, path: &Path) -> Result<(), FileError> {
    let started = Instant::now();
    let file = driver.open_file(path, "w+").await?;

    // issued back to back; each one is bound to the cursor moved by the seek before it
    let mut writes = Vec::with_capacity(CHUNKS);
    for i in 0..CHUNKS {
        writes.push(file.write(vec![b'a' + (i % 26) as u8; CHUNK]));
        file.seek(((i + 1) * CHUNK) as i64, Whence::Start)?;
    }
    for write in writes {
        write.await?;
    }

    file.lock(LockKind::Exclusive, None).await?;
    file.seek(0, Whence::Start)?;
    let mut total = 0;
    while let Some(chunk) = file.read(None, CHUNK).await? {
        total += chunk.len();
    }
    file.unlock().await?;
    file.close().await?;

    tracing::info!(
        "{}: wrote and read back {} bytes in {:?}",
        name,
        total,
        started.elapsed()
    );
    Ok(())
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::Layer::default().with_ansi(true))
        .init();

    let dir = std::env::temp_dir().join(format!("pluvio_file_demo_{}", std::process::id()));
    if let Err(err) = std::fs::create_dir_all(&dir) {
        tracing::error!("cannot create {}: {}", dir.display(), err);
        return;
    }

    let runtime = Runtime::new(1024);
    let uring = match UringDriver::new() {
        Ok(driver) => {
            driver.attach(&runtime);
            Some(driver)
        }
        Err(err) => {
            tracing::warn!("io_uring unavailable, skipping: {}", err);
            None
        }
    };

    let demo_dir = dir.clone();
    let result = runtime.block_on(async move {
        exercise("blocking", &BlockingDriver::new(), &demo_dir.join("blocking.dat")).await?;
        if let Some(uring) = &uring {
            exercise("io_uring", uring, &demo_dir.join("uring.dat")).await?;
        }
        let parallel = ParallelDriver::new(ThreadWorkerPool::from_env());
        exercise("parallel", &parallel, &demo_dir.join("parallel.dat")).await?;

        let mutex = FileMutex::new(BlockingDriver::new(), demo_dir.join("demo.mutex"));
        let lock = mutex.acquire(None).await?;
        tracing::info!("holding {}", lock.path().display());
        lock.release().await
    });

    if let Err(err) = result {
        tracing::error!("demo failed: {}", err);
    }
    if let Err(err) = std::fs::remove_dir_all(&dir) {
        tracing::warn!("cannot remove {}: {}", dir.display(), err);
    }
}
