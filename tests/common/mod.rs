#![allow(dead_code)]

use std::rc::Rc;

use pluvio_file::{IoUringReactorBuilder, Runtime, UringDriver};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh runtime, installed as this thread's runtime so `spawn` works.
pub fn runtime() -> Rc<Runtime> {
    init_tracing();
    let runtime = Runtime::new(64);
    pluvio_file::set_runtime(runtime.clone());
    runtime
}

/// An io_uring driver attached to `runtime`, or `None` where rings are unavailable.
pub fn uring_driver(runtime: &Runtime) -> Option<UringDriver> {
    match IoUringReactorBuilder::new().queue_size(64).build() {
        Ok(reactor) => {
            let driver = UringDriver::with_reactor(reactor);
            driver.attach(runtime);
            Some(driver)
        }
        Err(err) => {
            eprintln!("skipping io_uring test: {err}");
            None
        }
    }
}

/// Generate one test per driver for each listed
/// `async fn(&impl FilesystemDriver, &Path)`.
#[macro_export]
macro_rules! on_every_driver {
    ($($property:ident),* $(,)?) => {
        $(
            mod $property {
                #[test]
                fn blocking() {
                    let runtime = $crate::common::runtime();
                    let dir = tempfile::tempdir().unwrap();
                    runtime.block_on(async move {
                        super::$property(&pluvio_file::BlockingDriver::new(), dir.path()).await;
                    });
                }

                #[test]
                fn parallel() {
                    let runtime = $crate::common::runtime();
                    let dir = tempfile::tempdir().unwrap();
                    runtime.block_on(async move {
                        let driver = pluvio_file::ParallelDriver::with_limit(
                            pluvio_file::ThreadWorkerPool::new(2),
                            2,
                        );
                        super::$property(&driver, dir.path()).await;
                    });
                }

                #[test]
                fn uring() {
                    let runtime = $crate::common::runtime();
                    let Some(driver) = $crate::common::uring_driver(&runtime) else {
                        return;
                    };
                    let dir = tempfile::tempdir().unwrap();
                    runtime.block_on(async move {
                        super::$property(&driver, dir.path()).await;
                    });
                }
            }
        )*
    };
}
