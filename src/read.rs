//! Read engine: inbound frame dispatch for every connected client.
//!
//! Each idle connection has one lightweight probe task waiting for input. When
//! bytes arrive the probe hands the connection to the control loop, which takes
//! the connection's read claim and runs exactly one frame-handling unit on the
//! worker pool. A unit is a single INIT or CLOSE frame, or a complete upload
//! (NEW_FILE_PATH .. NEW_FILE_END). When the unit finishes the claim is released
//! and a new probe is armed.
//!
//! Idle clients cost a parked task, never a worker slot, and a slow client
//! cannot hold up the loop for the others.

use crate::connection::Connection;
use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::frame::{Frame, Opcode};
use crate::manager::CloseHook;
use crate::paths::{canonical_relative, decode_path, split_path_list};
use crate::pool::WorkerPool;
use crate::state::{ReverseInit, SharedSyncState, WriteRequest};
use crate::storage::SyncStorage;
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// What the connection should do after a handled unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

pub struct ReadEngine {
    state: Arc<SharedSyncState>,
    storage: Arc<dyn SyncStorage>,
    pool: Arc<WorkerPool>,
    hook: Arc<dyn CloseHook>,
    ready_tx: mpsc::UnboundedSender<Arc<Connection>>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<Connection>>>>,
}

impl ReadEngine {
    pub fn new(
        state: Arc<SharedSyncState>,
        storage: Arc<dyn SyncStorage>,
        pool: Arc<WorkerPool>,
        hook: Arc<dyn CloseHook>,
    ) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            state,
            storage,
            pool,
            hook,
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
        }
    }

    /// Arm the availability probe for `conn`.
    pub fn watch(&self, conn: Arc<Connection>) {
        let ready = self.ready_tx.clone();
        let hook = Arc::clone(&self.hook);
        let span = conn.span();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = conn.closed() => {}
                    readable = conn.wait_readable() => match readable {
                        Ok(true) => {
                            if ready.send(conn).is_err() {
                                debug!("read loop stopped, input left unread");
                            }
                        }
                        Ok(false) => {
                            debug!("peer closed its stream");
                            hook.close(&conn).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "read failed while idle");
                            hook.close(&conn).await;
                        }
                    },
                }
            }
            .instrument(span),
        );
    }

    /// Control loop. Runs until `stop` fires.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) {
        let Some(mut ready) = self.ready_rx.lock().take() else {
            error!("read loop is already running");
            return;
        };
        loop {
            let conn = tokio::select! {
                _ = stop.cancelled() => break,
                next = ready.recv() => match next {
                    Some(conn) => conn,
                    None => break,
                },
            };
            self.dispatch(conn);
        }
        debug!("read loop stopped");
    }

    /// Claim `conn` for reading and hand one unit to the pool.
    ///
    /// Returns false when the connection is gone or already claimed.
    pub fn dispatch(self: &Arc<Self>, conn: Arc<Connection>) -> bool {
        if conn.is_closed() || !self.state.clients().contains(conn.id()) {
            trace!(session = %conn.id(), "skipping departed connection");
            return false;
        }
        if !self.state.read_claims().try_claim(conn.id()) {
            warn!(session = %conn.id(), "connection already has a read in flight");
            return false;
        }
        let engine = Arc::clone(self);
        let span = conn.span();
        self.pool
            .execute(span, async move { engine.handle_read(conn).await });
        true
    }

    /// Run one unit for a claimed connection, then release or tear down.
    pub async fn handle_read(self: Arc<Self>, conn: Arc<Connection>) {
        let mut upload = None;
        match self.process_unit(&conn, &mut upload).await {
            Ok(Flow::Continue) => {
                self.state.read_claims().release(conn.id());
                if !conn.is_closed() {
                    self.watch(conn);
                }
            }
            Ok(Flow::Close) => {
                info!("client sent CLOSE");
                self.hook.close(&conn).await;
            }
            Err(e) => {
                if let Some(path) = upload.take() {
                    self.discard_upload(&path).await;
                }
                if e.is_disconnect() {
                    debug!(error = %e, "connection ended during read");
                } else {
                    warn!(error = %e, "closing connection");
                }
                self.hook.close(&conn).await;
            }
        }
    }

    async fn process_unit(
        &self,
        conn: &Arc<Connection>,
        upload: &mut Option<String>,
    ) -> SyncResult<Flow> {
        let frame = next_frame(conn).await?;
        trace!(opcode = %frame.opcode(), len = frame.payload().len(), "frame");
        match frame.opcode() {
            Opcode::Close => Ok(Flow::Close),
            Opcode::Init => {
                self.handle_init(conn, frame.payload())?;
                Ok(Flow::Continue)
            }
            Opcode::NewFilePath => {
                self.receive_file(conn, frame.payload(), upload).await?;
                Ok(Flow::Continue)
            }
            opcode @ (Opcode::NewFilePart | Opcode::NewFileEnd) => {
                Err(ProtocolError::UnexpectedOpcode {
                    opcode,
                    expected: "INIT, NEW_FILE_PATH or CLOSE",
                }
                .into())
            }
        }
    }

    fn handle_init(&self, conn: &Arc<Connection>, payload: &[u8]) -> SyncResult<()> {
        let client_paths: Vec<String> = split_path_list(payload)?
            .into_iter()
            .filter_map(|path| match canonical_relative(&path) {
                Ok(canonical) => Some(canonical),
                Err(e) => {
                    warn!(error = %e, "ignoring INIT entry");
                    None
                }
            })
            .collect::<IndexSet<String>>()
            .into_iter()
            .collect();

        let diff = self.state.files().reconcile(&client_paths);
        debug!(
            client = client_paths.len(),
            to_send = diff.to_send.len(),
            to_request = diff.to_request.len(),
            "reconciled"
        );
        if !diff.to_send.is_empty() {
            self.state
                .write_requests()
                .put(WriteRequest::to_connection(diff.to_send, Arc::clone(conn)));
        }
        if !diff.to_request.is_empty() {
            self.state.reverse_inits().put(ReverseInit {
                conn: Arc::clone(conn),
                paths: diff.to_request,
            });
        }
        Ok(())
    }

    /// Receive one file. `upload` holds the path while a partial file exists.
    async fn receive_file(
        &self,
        conn: &Arc<Connection>,
        payload: &[u8],
        upload: &mut Option<String>,
    ) -> SyncResult<()> {
        let path = decode_path(payload)?;
        self.state.files().begin_upload(&path)?;
        *upload = Some(path.clone());

        self.storage.create_parent_dirs(&path).await?;
        let mut sink = self.storage.open_for_write(&path).await?;
        debug!(path = %path, "receiving file");

        let mut received = 0u64;
        loop {
            let frame = next_frame(conn).await?;
            match frame.opcode() {
                Opcode::NewFilePart => {
                    sink.write_all(frame.payload()).await?;
                    received += frame.payload().len() as u64;
                }
                Opcode::NewFileEnd => {
                    if frame.payload() != path.as_bytes() {
                        warn!(
                            path = %path,
                            end = %String::from_utf8_lossy(frame.payload()),
                            "NEW_FILE_END names a different path"
                        );
                    }
                    break;
                }
                opcode => {
                    return Err(ProtocolError::UnexpectedOpcode {
                        opcode,
                        expected: "NEW_FILE_PART or NEW_FILE_END",
                    }
                    .into())
                }
            }
        }
        sink.flush().await?;
        sink.shutdown().await?;
        drop(sink);

        self.state.files().finish_upload(&path);
        *upload = None;
        info!(path = %path, bytes = received, "file received");
        self.state
            .write_requests()
            .put(WriteRequest::broadcast(vec![path], conn.id()));
        Ok(())
    }

    async fn discard_upload(&self, path: &str) {
        if let Err(e) = self.storage.delete_if_exists(path).await {
            error!(path = %path, error = %e, "failed to delete partial upload");
        }
        self.state.files().abort_upload(path);
        debug!(path = %path, "partial upload discarded");
    }
}

/// Next frame from `conn`, abandoned as soon as the connection is torn down.
async fn next_frame(conn: &Connection) -> SyncResult<Frame> {
    tokio::select! {
        _ = conn.closed() => Err(SyncError::ConnectionClosed),
        frame = conn.read_frame() => Ok(frame?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::frame::write_frame;
    use crate::state::WriteTarget;
    use crate::storage::{FsStorage, MemoryStorage};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    /// Records teardowns instead of performing them, apart from the flag.
    #[derive(Default)]
    struct RecordingHook {
        closed: parking_lot::Mutex<Vec<ConnectionId>>,
    }

    impl RecordingHook {
        fn count(&self, id: ConnectionId) -> usize {
            self.closed.lock().iter().filter(|c| **c == id).count()
        }
    }

    #[async_trait]
    impl CloseHook for RecordingHook {
        async fn close(&self, conn: &Arc<Connection>) {
            conn.mark_closed();
            self.closed.lock().push(conn.id());
        }
    }

    struct Harness {
        state: Arc<SharedSyncState>,
        storage: MemoryStorage,
        hook: Arc<RecordingHook>,
        engine: Arc<ReadEngine>,
    }

    fn harness(files: &[&str]) -> Harness {
        let state = Arc::new(SharedSyncState::new(files.iter().map(|s| s.to_string())));
        let storage = MemoryStorage::new();
        let hook = Arc::new(RecordingHook::default());
        let engine = Arc::new(ReadEngine::new(
            Arc::clone(&state),
            Arc::new(storage.clone()),
            Arc::new(WorkerPool::new(4)),
            hook.clone(),
        ));
        Harness {
            state,
            storage,
            hook,
            engine,
        }
    }

    impl Harness {
        fn connect(&self) -> (Arc<Connection>, DuplexStream) {
            let (peer, server) = tokio::io::duplex(64 * 1024);
            let conn = Connection::new(server, "test");
            self.state.clients().add(Arc::clone(&conn));
            self.state.read_claims().try_claim(conn.id());
            (conn, peer)
        }

        /// Run one unit the way the control loop would.
        async fn run_unit(&self, conn: &Arc<Connection>) {
            Arc::clone(&self.engine)
                .handle_read(Arc::clone(conn))
                .await;
        }
    }

    async fn send(peer: &mut DuplexStream, frames: &[Frame]) {
        for frame in frames {
            write_frame(peer, frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn read_claim_is_never_taken_twice() {
        let h = harness(&[]);
        let (peer, server) = tokio::io::duplex(1024);
        let conn = Connection::new(server, "test");
        h.state.clients().add(Arc::clone(&conn));

        assert!(h.state.read_claims().try_claim(conn.id()));
        assert!(!h.engine.dispatch(Arc::clone(&conn)));
        assert_eq!(h.state.read_claims().len(), 1);

        // Departed connections are not claimed at all
        h.state.read_claims().release(conn.id());
        h.state.clients().remove(conn.id());
        assert!(!h.engine.dispatch(Arc::clone(&conn)));
        assert!(h.state.read_claims().is_empty());
        drop(peer);
    }

    #[tokio::test]
    async fn close_tears_down_once_and_ignores_buffered_frames() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[Frame::close(), Frame::init(&["late.txt"]), Frame::close()],
        )
        .await;

        h.run_unit(&conn).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(h.hook.count(conn.id()), 1);
        assert!(h.state.reverse_inits().is_empty());
        assert!(h.state.write_requests().is_empty());
    }

    #[tokio::test]
    async fn init_with_empty_client_sends_registry() {
        let h = harness(&["A", "B"]);
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::init::<&str>(&[])]).await;
        h.run_unit(&conn).await;

        let request = h.state.write_requests().poll().unwrap();
        assert_eq!(request.paths, vec!["A".to_string(), "B".to_string()]);
        match request.target {
            WriteTarget::Only(target) => assert_eq!(target.id(), conn.id()),
            other => panic!("unexpected target {other:?}"),
        }
        assert!(h.state.reverse_inits().is_empty());
        // Claim released, connection still eligible
        assert!(!h.state.read_claims().is_claimed(conn.id()));
    }

    #[tokio::test]
    async fn init_with_empty_server_requests_client_files() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::init(&["X", "Y"])]).await;
        h.run_unit(&conn).await;

        let notice = h.state.reverse_inits().poll().unwrap();
        assert_eq!(notice.conn.id(), conn.id());
        assert_eq!(notice.paths, vec!["X".to_string(), "Y".to_string()]);
        assert!(h.state.write_requests().is_empty());
    }

    #[tokio::test]
    async fn init_with_overlap_only_requests_the_difference() {
        let h = harness(&["S"]);
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::init(&["S", "C"])]).await;
        h.run_unit(&conn).await;

        assert!(h.state.write_requests().is_empty());
        let notice = h.state.reverse_inits().poll().unwrap();
        assert_eq!(notice.paths, vec!["C".to_string()]);
    }

    #[tokio::test]
    async fn init_drops_unsafe_entries() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::init(&["../etc/passwd", "ok.txt"])]).await;
        h.run_unit(&conn).await;

        let notice = h.state.reverse_inits().poll().unwrap();
        assert_eq!(notice.paths, vec!["ok.txt".to_string()]);
        assert_eq!(h.hook.count(conn.id()), 0);
    }

    #[tokio::test]
    async fn init_aliases_match_registered_paths() {
        let h = harness(&["a.txt", "dir/b.txt"]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[Frame::init(&["./a.txt", "dir//b.txt", "dir/./b.txt", "./c.txt", "c.txt"])],
        )
        .await;
        h.run_unit(&conn).await;

        assert!(h.state.write_requests().is_empty());
        let notice = h.state.reverse_inits().poll().unwrap();
        assert_eq!(notice.paths, vec!["c.txt".to_string()]);
        assert!(h.state.reverse_inits().is_empty());
    }

    #[tokio::test]
    async fn upload_writes_registers_and_broadcasts() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("parent/path.txt"),
                Frame::new_file_part(b"part1".to_vec()),
                Frame::new_file_part(b"part2".to_vec()),
                Frame::new_file_end("parent/path.txt"),
            ],
        )
        .await;
        h.run_unit(&conn).await;

        assert_eq!(h.storage.contents("parent/path.txt").unwrap(), b"part1part2");
        assert_eq!(h.storage.created_dirs(), vec!["parent".to_string()]);
        assert!(h.state.files().contains("parent/path.txt"));
        assert!(!h.state.files().is_in_flight("parent/path.txt"));

        let request = h.state.write_requests().poll().unwrap();
        assert_eq!(request.paths, vec!["parent/path.txt".to_string()]);
        assert!(matches!(request.target, WriteTarget::AllExcept(id) if id == conn.id()));
        assert_eq!(h.hook.count(conn.id()), 0);
    }

    #[tokio::test]
    async fn upload_of_registered_path_is_a_collision() {
        let h = harness(&["taken.txt"]);
        h.storage.insert("taken.txt", "original");
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("taken.txt"),
                Frame::new_file_part(b"evil".to_vec()),
                Frame::new_file_end("taken.txt"),
            ],
        )
        .await;
        h.run_unit(&conn).await;

        assert_eq!(h.hook.count(conn.id()), 1);
        assert_eq!(h.state.files().snapshot(), vec!["taken.txt".to_string()]);
        assert_eq!(h.storage.contents("taken.txt").unwrap(), b"original");
        assert!(h.storage.deleted().is_empty());
        assert!(h.state.write_requests().is_empty());
    }

    #[tokio::test]
    async fn upload_under_alias_of_registered_path_is_a_collision() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken.txt"), "original").unwrap();
        let state = Arc::new(SharedSyncState::new(["taken.txt".to_string()]));
        let hook = Arc::new(RecordingHook::default());
        let engine = Arc::new(ReadEngine::new(
            Arc::clone(&state),
            Arc::new(FsStorage::new(dir.path())),
            Arc::new(WorkerPool::new(1)),
            hook.clone(),
        ));
        let (mut peer, server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(server, "test");
        state.clients().add(Arc::clone(&conn));
        state.read_claims().try_claim(conn.id());

        send(
            &mut peer,
            &[
                Frame::new_file_path("./taken.txt"),
                Frame::new_file_part(b"evil".to_vec()),
                Frame::new_file_end("./taken.txt"),
            ],
        )
        .await;
        Arc::clone(&engine).handle_read(Arc::clone(&conn)).await;

        assert_eq!(hook.count(conn.id()), 1);
        assert!(conn.is_closed());
        assert_eq!(
            std::fs::read_to_string(dir.path().join("taken.txt")).unwrap(),
            "original"
        );
        assert_eq!(state.files().snapshot(), vec!["taken.txt".to_string()]);
        assert!(state.write_requests().is_empty());
    }

    #[tokio::test]
    async fn upload_of_in_flight_path_is_a_collision() {
        let h = harness(&[]);
        h.state.files().begin_upload("busy.txt").unwrap();
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::new_file_path("busy.txt")]).await;
        h.run_unit(&conn).await;

        assert_eq!(h.hook.count(conn.id()), 1);
        assert!(h.state.files().is_empty());
        // The other uploader's entry is untouched
        assert!(h.state.files().is_in_flight("busy.txt"));
    }

    #[tokio::test]
    async fn failed_storage_write_discards_partial_file() {
        let h = harness(&[]);
        h.storage.set_fail_writes(true);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("dir/broken.bin"),
                Frame::new_file_part(b"data".to_vec()),
                Frame::new_file_end("dir/broken.bin"),
            ],
        )
        .await;
        h.run_unit(&conn).await;

        assert_eq!(h.storage.deleted(), vec!["dir/broken.bin".to_string()]);
        assert!(h.storage.contents("dir/broken.bin").is_none());
        assert!(!h.state.files().is_in_flight("dir/broken.bin"));
        assert!(!h.state.files().contains("dir/broken.bin"));
        assert_eq!(h.hook.count(conn.id()), 1);
    }

    #[tokio::test]
    async fn wrong_opcode_mid_upload_discards_partial_file() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("a.txt"),
                Frame::new_file_part(b"half".to_vec()),
                Frame::init::<&str>(&[]),
            ],
        )
        .await;
        h.run_unit(&conn).await;

        assert_eq!(h.storage.deleted(), vec!["a.txt".to_string()]);
        assert!(!h.state.files().is_in_flight("a.txt"));
        assert_eq!(h.hook.count(conn.id()), 1);

        // The path can be uploaded again later
        h.state.files().begin_upload("a.txt").unwrap();
    }

    #[tokio::test]
    async fn peer_vanishing_mid_upload_discards_partial_file() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("gone.txt"),
                Frame::new_file_part(b"some".to_vec()),
            ],
        )
        .await;
        drop(peer);
        h.run_unit(&conn).await;

        assert_eq!(h.storage.deleted(), vec!["gone.txt".to_string()]);
        assert!(!h.state.files().is_in_flight("gone.txt"));
        assert_eq!(h.hook.count(conn.id()), 1);
    }

    #[tokio::test]
    async fn stray_part_outside_upload_is_a_protocol_error() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(&mut peer, &[Frame::new_file_part(b"x".to_vec())]).await;
        h.run_unit(&conn).await;

        assert_eq!(h.hook.count(conn.id()), 1);
        assert!(h.storage.deleted().is_empty());
    }

    #[tokio::test]
    async fn end_with_other_path_still_completes_current_upload() {
        let h = harness(&[]);
        let (conn, mut peer) = h.connect();
        send(
            &mut peer,
            &[
                Frame::new_file_path("real.txt"),
                Frame::new_file_part(b"ok".to_vec()),
                Frame::new_file_end("other.txt"),
            ],
        )
        .await;
        h.run_unit(&conn).await;

        assert!(h.state.files().contains("real.txt"));
        assert!(!h.state.files().contains("other.txt"));
        assert_eq!(h.hook.count(conn.id()), 0);
    }

    #[tokio::test]
    async fn control_loop_processes_pipelined_units() {
        let h = harness(&[]);
        let stop = CancellationToken::new();
        let loop_task = tokio::spawn(Arc::clone(&h.engine).run(stop.clone()));

        let (mut peer, server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::new(server, "test");
        h.state.clients().add(Arc::clone(&conn));
        h.engine.watch(Arc::clone(&conn));

        send(
            &mut peer,
            &[
                Frame::new_file_path("one.txt"),
                Frame::new_file_part(b"1".to_vec()),
                Frame::new_file_end("one.txt"),
                Frame::new_file_path("two.txt"),
                Frame::new_file_part(b"2".to_vec()),
                Frame::new_file_end("two.txt"),
            ],
        )
        .await;

        for _ in 0..100 {
            if h.state.files().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            h.state.files().snapshot(),
            vec!["one.txt".to_string(), "two.txt".to_string()]
        );
        assert_eq!(h.state.write_requests().len(), 2);

        // EOF from the peer tears the connection down
        drop(peer);
        for _ in 0..100 {
            if h.hook.count(conn.id()) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.hook.count(conn.id()), 1);

        stop.cancel();
        loop_task.await.unwrap();
    }
}
