use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    io,
    rc::Rc,
    time::{Duration, Instant},
};

use io_uring::IoUring;

use crate::driver::uring::reactor::{IoUringParams, IoUringReactor};

/// Configuration for an [`IoUringReactor`].
#[derive(Debug, Clone)]
pub struct IoUringReactorBuilder {
    queue_size: u32,
    submit_depth: u32,
    wait_submit_timeout: Duration,
    wait_complete_timeout: Duration,
}

impl Default for IoUringReactorBuilder {
    fn default() -> Self {
        IoUringReactorBuilder {
            queue_size: 256,
            submit_depth: 32,
            wait_submit_timeout: Duration::from_micros(100),
            wait_complete_timeout: Duration::from_micros(100),
        }
    }
}

impl IoUringReactorBuilder {
    pub fn new() -> Self {
        IoUringReactorBuilder::default()
    }

    pub fn queue_size(mut self, size: u32) -> Self {
        self.queue_size = size;
        self
    }

    /// Submit as soon as this many SQEs are queued.
    pub fn submit_depth(mut self, depth: u32) -> Self {
        self.submit_depth = depth;
        self
    }

    /// Submit a partial batch once it has waited this long.
    pub fn wait_submit_timeout(mut self, timeout: Duration) -> Self {
        self.wait_submit_timeout = timeout;
        self
    }

    /// Reap completions at most this often while requests are in flight.
    pub fn wait_complete_timeout(mut self, timeout: Duration) -> Self {
        self.wait_complete_timeout = timeout;
        self
    }

    pub fn build(self) -> io::Result<Rc<IoUringReactor>> {
        let ring = IoUring::builder().build(self.queue_size)?;
        if ring.params().is_feature_nodrop() {
            tracing::trace!("io_uring supports IORING_FEAT_NODROP");
        } else {
            tracing::trace!("io_uring does not support IORING_FEAT_NODROP");
        }

        Ok(Rc::new(IoUringReactor {
            ring: RefCell::new(ring),
            completions: RefCell::new(HashMap::new()),
            user_data_counter: Cell::new(0),
            last_submit_time: Cell::new(Instant::now()),
            io_uring_params: IoUringParams {
                submit_depth: self.submit_depth,
                wait_submit_timeout: self.wait_submit_timeout,
                wait_complete_timeout: self.wait_complete_timeout,
            },
            completed_count: Cell::new(0),
            listeners: Cell::new(0),
        }))
    }
}
