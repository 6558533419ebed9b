//! Bounded worker pool shared by the read and write engines.
//!
//! Handlers are spawned as Tokio tasks immediately, so the control loops never
//! wait on the pool; each task then waits for a permit before running.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, Instrument, Span};

#[derive(Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Run `task` once a worker slot is free.
    pub fn execute<F>(&self, span: Span, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(
            async move {
                let _permit = match permits.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        error!("worker pool closed, task dropped");
                        return;
                    }
                };
                task.await
            }
            .instrument(span),
        )
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently running a task.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }
}
