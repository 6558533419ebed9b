//! Write engine: the coordinator that drains both work queues and the
//! streaming tasks it dispatches to the worker pool.
//!
//! A connection never has two writers: every dispatched task holds the write
//! claim of each connection it writes to. Broadcasts are stricter and only start
//! when no connection other than the excluded uploader holds a claim, then claim
//! every recipient at once and send them identical frames in lockstep.

use crate::connection::{Connection, ConnectionId};
use crate::error::SyncResult;
use crate::frame::Frame;
use crate::manager::CloseHook;
use crate::pool::WorkerPool;
use crate::state::{ReverseInit, SharedSyncState, WriteRequest, WriteTarget};
use crate::storage::{FileSource, SyncStorage};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

// Upper bound on the up-front allocation for one chunk buffer
const CHUNK_PREALLOC: usize = 1024 * 1024;

/// Result of one pass over the queues.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WriteCheck {
    /// Items handed to the pool.
    pub dispatched: usize,
    /// Items put back because a target was busy.
    pub deferred: usize,
}

pub struct WriteEngine {
    state: Arc<SharedSyncState>,
    storage: Arc<dyn SyncStorage>,
    pool: Arc<WorkerPool>,
    hook: Arc<dyn CloseHook>,
    chunk_size: usize,
}

impl WriteEngine {
    pub fn new(
        state: Arc<SharedSyncState>,
        storage: Arc<dyn SyncStorage>,
        pool: Arc<WorkerPool>,
        hook: Arc<dyn CloseHook>,
        chunk_size: usize,
    ) -> Self {
        Self {
            state,
            storage,
            pool,
            hook,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Control loop. Parks until new work arrives or a write claim is released.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let wake = self.state.work_ready();
        loop {
            if stop.is_cancelled() {
                break;
            }
            let check = self.execute_write_check();
            if check.dispatched > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = wake.notified() => {}
            }
        }
        debug!("write loop stopped");
    }

    /// One pass over both queues. Each item present at the start is looked at once.
    pub fn execute_write_check(self: &Arc<Self>) -> WriteCheck {
        let mut check = WriteCheck::default();

        let pending = self.state.reverse_inits().len();
        for _ in 0..pending {
            let Some(notice) = self.state.reverse_inits().poll() else {
                break;
            };
            if notice.conn.is_closed() {
                debug!(session = %notice.conn.id(), "dropping upload request for closed connection");
                continue;
            }
            if self.state.write_claims().try_claim(notice.conn.id()) {
                self.dispatch_reverse_init(notice);
                check.dispatched += 1;
            } else {
                self.state.reverse_inits().requeue(notice);
                check.deferred += 1;
            }
        }

        let pending = self.state.write_requests().len();
        for _ in 0..pending {
            let Some(request) = self.state.write_requests().poll() else {
                break;
            };
            match &request.target {
                WriteTarget::Only(conn) => {
                    let conn = Arc::clone(conn);
                    if conn.is_closed() {
                        debug!(session = %conn.id(), "dropping write for closed connection");
                        continue;
                    }
                    if self.state.write_claims().try_claim(conn.id()) {
                        self.dispatch_stream(vec![conn], request.paths);
                        check.dispatched += 1;
                    } else {
                        self.state.write_requests().requeue(request);
                        check.deferred += 1;
                    }
                }
                WriteTarget::AllExcept(excluded) => {
                    let excluded = *excluded;
                    if self.try_broadcast(&request, excluded) {
                        check.dispatched += 1;
                    } else if self.broadcast_has_recipients(excluded) {
                        self.state.write_requests().requeue(request);
                        check.deferred += 1;
                    } else {
                        debug!(paths = request.paths.len(), "broadcast has no recipients");
                    }
                }
            }
        }

        if check.dispatched > 0 || check.deferred > 0 {
            trace!(
                dispatched = check.dispatched,
                deferred = check.deferred,
                "write check"
            );
        }
        check
    }

    fn recipients(&self, excluded: ConnectionId) -> Vec<Arc<Connection>> {
        self.state
            .clients()
            .snapshot()
            .into_iter()
            .filter(|c| c.id() != excluded && !c.is_closed())
            .collect()
    }

    fn broadcast_has_recipients(&self, excluded: ConnectionId) -> bool {
        !self.recipients(excluded).is_empty()
    }

    /// Claim every recipient and dispatch, or leave everything untouched.
    fn try_broadcast(self: &Arc<Self>, request: &WriteRequest, excluded: ConnectionId) -> bool {
        if self.state.write_claims().any_claimed_except(excluded) {
            return false;
        }
        let targets = self.recipients(excluded);
        if targets.is_empty() {
            return false;
        }
        let ids: Vec<ConnectionId> = targets.iter().map(|c| c.id()).collect();
        if !self
            .state
            .write_claims()
            .try_claim_all_unless_busy(excluded, &ids)
        {
            return false;
        }
        debug!(
            recipients = targets.len(),
            paths = request.paths.len(),
            "broadcasting"
        );
        self.dispatch_stream(targets, request.paths.clone());
        true
    }

    fn dispatch_reverse_init(self: &Arc<Self>, notice: ReverseInit) {
        let engine = Arc::clone(self);
        let span = notice.conn.span();
        self.pool.execute(span, async move {
            engine.send_reverse_init(notice).await;
        });
    }

    fn dispatch_stream(self: &Arc<Self>, targets: Vec<Arc<Connection>>, paths: Vec<String>) {
        let engine = Arc::clone(self);
        let span = match targets.as_slice() {
            [single] => single.span(),
            _ => tracing::info_span!("broadcast", recipients = targets.len()),
        };
        self.pool.execute(span, async move {
            engine.stream_files(targets, paths).await;
        });
    }

    async fn send_reverse_init(&self, notice: ReverseInit) {
        let ReverseInit { conn, paths } = notice;
        match conn.send_frame(&Frame::init(&paths)).await {
            Ok(()) => debug!(paths = paths.len(), "requested files from client"),
            Err(e) => {
                warn!(error = %e, "failed to send upload request");
                self.hook.close(&conn).await;
            }
        }
        self.state.write_claims().release(conn.id());
        self.state.notify_work();
    }

    /// Stream `paths` to every target in lockstep, then release their claims.
    ///
    /// A target whose send fails drops out and is torn down once streaming ends;
    /// the others keep going. A source that fails mid-file leaves every current
    /// target with a half-sent file, so all of them are torn down.
    pub async fn stream_files(&self, targets: Vec<Arc<Connection>>, paths: Vec<String>) {
        let ids: Vec<ConnectionId> = targets.iter().map(|c| c.id()).collect();
        let mut live = targets;
        let mut failed = Vec::new();

        for path in &paths {
            live.retain(|c| !c.is_closed());
            if live.is_empty() {
                break;
            }
            let mut source = match self.storage.open_for_read(path).await {
                Ok(source) => source,
                Err(e) => {
                    error!(path = %path, error = %e, "cannot open file for sending, skipping");
                    continue;
                }
            };
            match self
                .stream_one(&mut source, path, &mut live, &mut failed)
                .await
            {
                Ok(_) if live.is_empty() => {
                    debug!(path = %path, "every recipient dropped out, stopping");
                    break;
                }
                Ok(bytes) => info!(path = %path, bytes, recipients = live.len(), "file sent"),
                Err(e) => {
                    error!(path = %path, error = %e, "file send aborted");
                    failed.append(&mut live);
                    break;
                }
            }
        }

        for conn in &failed {
            self.hook.close(conn).instrument(conn.span()).await;
        }
        self.state.write_claims().release_all(&ids);
        self.state.notify_work();
    }

    async fn stream_one(
        &self,
        source: &mut FileSource,
        path: &str,
        live: &mut Vec<Arc<Connection>>,
        failed: &mut Vec<Arc<Connection>>,
    ) -> SyncResult<u64> {
        fan_out(&Frame::new_file_path(path), live, failed).await?;
        let mut sent = 0u64;
        if live.is_empty() {
            return Ok(sent);
        }
        loop {
            let mut chunk = Vec::with_capacity(self.chunk_size.min(CHUNK_PREALLOC));
            let n = (&mut *source)
                .take(self.chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;
            sent += n as u64;
            fan_out(&Frame::new_file_part(chunk), live, failed).await?;
            if live.is_empty() {
                return Ok(sent);
            }
            if n < self.chunk_size {
                break;
            }
        }
        fan_out(&Frame::new_file_end(path), live, failed).await?;
        Ok(sent)
    }
}

/// Send one encoded frame to every live target before moving on.
async fn fan_out(
    frame: &Frame,
    live: &mut Vec<Arc<Connection>>,
    failed: &mut Vec<Arc<Connection>>,
) -> SyncResult<()> {
    let bytes = frame.to_bytes()?;
    let mut still_live = Vec::with_capacity(live.len());
    for conn in live.drain(..) {
        if conn.is_closed() {
            continue;
        }
        match conn.send_encoded(&bytes).await {
            Ok(()) => still_live.push(conn),
            Err(e) => {
                warn!(session = %conn.id(), error = %e, opcode = %frame.opcode(), "send failed, dropping recipient");
                failed.push(conn);
            }
        }
    }
    *live = still_live;
    Ok(())
}
