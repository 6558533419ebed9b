//! Connection lifecycle: wiring of the engines and the single teardown path.

use crate::config::SyncConfig;
use crate::connection::Connection;
use crate::frame::Frame;
use crate::pool::WorkerPool;
use crate::read::ReadEngine;
use crate::state::SharedSyncState;
use crate::storage::SyncStorage;
use crate::write::WriteEngine;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Tears a connection down. Invoked by both engines on any fatal condition.
///
/// Implementations must be idempotent, safe to call concurrently for the same
/// connection, and must never fail.
#[async_trait]
pub trait CloseHook: Send + Sync {
    async fn close(&self, conn: &Arc<Connection>);
}

/// Default [`CloseHook`]: forget the connection everywhere, then say goodbye.
#[derive(Debug)]
pub struct Lifecycle {
    state: Arc<SharedSyncState>,
    close_timeout: Duration,
}

impl Lifecycle {
    pub fn new(state: Arc<SharedSyncState>, close_timeout: Duration) -> Self {
        Self {
            state,
            close_timeout,
        }
    }
}

#[async_trait]
impl CloseHook for Lifecycle {
    async fn close(&self, conn: &Arc<Connection>) {
        // Flag first: once a claim is gone nobody may see the connection as live
        let first = conn.mark_closed();
        let id = conn.id();
        self.state.clients().remove(id);
        self.state.read_claims().release(id);
        self.state.write_claims().release(id);
        // Deferred broadcasts may have been waiting on this claim
        self.state.notify_work();

        if !first {
            debug!("connection already torn down");
            return;
        }

        let goodbye = async {
            conn.send_frame(&Frame::close()).await?;
            conn.shutdown().await?;
            Ok::<_, crate::error::ProtocolError>(())
        };
        match tokio::time::timeout(self.close_timeout, goodbye).await {
            Ok(Ok(())) => info!("client disconnected"),
            Ok(Err(e)) => info!(error = %e, "client disconnected (CLOSE not delivered)"),
            Err(_) => warn!(
                timeout_ms = self.close_timeout.as_millis() as u64,
                "client disconnected (CLOSE timed out)"
            ),
        }
    }
}

/// Owns the shared state, both engines and their control loops.
pub struct SyncManager {
    state: Arc<SharedSyncState>,
    pool: Arc<WorkerPool>,
    lifecycle: Arc<Lifecycle>,
    read: Arc<ReadEngine>,
    write: Arc<WriteEngine>,
    stop: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(
        state: Arc<SharedSyncState>,
        storage: Arc<dyn SyncStorage>,
        config: &SyncConfig,
    ) -> Self {
        let pool = Arc::new(WorkerPool::new(config.max_workers));
        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&state), config.close_timeout));
        let hook: Arc<dyn CloseHook> = lifecycle.clone();
        let read = Arc::new(ReadEngine::new(
            Arc::clone(&state),
            Arc::clone(&storage),
            Arc::clone(&pool),
            Arc::clone(&hook),
        ));
        let write = Arc::new(WriteEngine::new(
            Arc::clone(&state),
            storage,
            Arc::clone(&pool),
            hook,
            config.chunk_size,
        ));
        Self {
            state,
            pool,
            lifecycle,
            read,
            write,
            stop: CancellationToken::new(),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the read and write control loops. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut loops = self.loops.lock();
        if !loops.is_empty() {
            return;
        }
        let read = Arc::clone(&self.read);
        loops.push(tokio::spawn(
            read.run(self.stop.clone())
                .instrument(tracing::info_span!("read_loop")),
        ));
        let write = Arc::clone(&self.write);
        loops.push(tokio::spawn(
            write
                .run(self.stop.clone())
                .instrument(tracing::info_span!("write_loop")),
        ));
        debug!(workers = self.pool.size(), "sync engines started");
    }

    /// Admit an authenticated connection.
    pub fn register(&self, conn: Arc<Connection>) {
        self.state.clients().add(Arc::clone(&conn));
        conn.span().in_scope(|| info!("client connected"));
        self.read.watch(conn);
    }

    pub async fn close(&self, conn: &Arc<Connection>) {
        self.lifecycle
            .close(conn)
            .instrument(conn.span())
            .await
    }

    /// Stop both loops and close every connected client.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        for conn in self.state.clients().snapshot() {
            self.close(&conn).await;
        }
        let loops: Vec<_> = self.loops.lock().drain(..).collect();
        for handle in loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "control loop ended abnormally");
            }
        }
        info!("sync engines stopped");
    }

    pub fn connected(&self) -> usize {
        self.state.clients().len()
    }

    pub fn state(&self) -> &Arc<SharedSyncState> {
        &self.state
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }
}
