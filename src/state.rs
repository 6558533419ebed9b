//! Shared sync state: everything the read and write engines arbitrate over.
//!
//! One [`SharedSyncState`] is created per server and passed explicitly to both
//! engines and the lifecycle manager. Each container carries its own lock; no
//! operation here holds more than one of them at a time.

use crate::connection::{ClaimSet, Connection, ConnectionId};
use crate::error::{SyncError, SyncResult};
use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Who receives the files of a [`WriteRequest`].
#[derive(Debug, Clone)]
pub enum WriteTarget {
    /// Exactly this connection.
    Only(Arc<Connection>),
    /// Every connected client except this one.
    AllExcept(ConnectionId),
}

/// Outbound work: stream `paths` to `target`.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub paths: Vec<String>,
    pub target: WriteTarget,
}

impl WriteRequest {
    pub fn to_connection(paths: Vec<String>, conn: Arc<Connection>) -> Self {
        Self {
            paths,
            target: WriteTarget::Only(conn),
        }
    }

    pub fn broadcast(paths: Vec<String>, excluded: ConnectionId) -> Self {
        Self {
            paths,
            target: WriteTarget::AllExcept(excluded),
        }
    }
}

/// Ask `conn`'s client to upload `paths`, answered with one INIT frame.
#[derive(Debug, Clone)]
pub struct ReverseInit {
    pub conn: Arc<Connection>,
    pub paths: Vec<String>,
}

/// Outcome of comparing a client's INIT list with the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// In the registry, missing on the client. Registry order.
    pub to_send: Vec<String>,
    /// On the client, unknown to the server. Client order.
    pub to_request: Vec<String>,
}

/// Connected clients, in connection order.
#[derive(Debug, Default)]
pub struct Membership {
    clients: RwLock<IndexMap<ConnectionId, Arc<Connection>>>,
}

impl Membership {
    pub fn add(&self, conn: Arc<Connection>) {
        self.clients.write().insert(conn.id(), conn);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.clients.write().shift_remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.clients.read().contains_key(&id)
    }

    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.clients.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    available: IndexSet<String>,
    in_flight: HashSet<String>,
}

/// Files known to exist in the sync root, plus the uploads still in progress.
///
/// Both sets live under one lock so a path is never observed in both, and a
/// finished upload moves from one to the other in a single step.
#[derive(Debug, Default)]
pub struct FileRegistry {
    inner: Mutex<RegistryInner>,
}

impl FileRegistry {
    pub fn new<I>(paths: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        Self {
            inner: Mutex::new(RegistryInner {
                available: paths.into_iter().collect(),
                in_flight: HashSet::new(),
            }),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.lock().available.contains(path)
    }

    /// Register a path directly (startup scan). Returns false if already known.
    pub fn insert(&self, path: impl Into<String>) -> bool {
        self.inner.lock().available.insert(path.into())
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.inner.lock().available.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().available.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().available.is_empty()
    }

    pub fn is_in_flight(&self, path: &str) -> bool {
        self.inner.lock().in_flight.contains(path)
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// Diff a client's path list against the registry.
    ///
    /// Paths currently being uploaded by someone count as known: asking for them
    /// would only produce a collision.
    pub fn reconcile(&self, client_paths: &[String]) -> Reconciliation {
        let inner = self.inner.lock();
        let client: HashSet<&str> = client_paths.iter().map(String::as_str).collect();
        let to_send = inner
            .available
            .iter()
            .filter(|p| !client.contains(p.as_str()))
            .cloned()
            .collect();
        let to_request = client_paths
            .iter()
            .filter(|p| !inner.available.contains(*p) && !inner.in_flight.contains(*p))
            .cloned()
            .collect();
        Reconciliation {
            to_send,
            to_request,
        }
    }

    /// Mark `path` as being uploaded, unless it is already registered or in flight.
    pub fn begin_upload(&self, path: &str) -> SyncResult<()> {
        let mut inner = self.inner.lock();
        if inner.available.contains(path) || inner.in_flight.contains(path) {
            return Err(SyncError::Collision {
                path: path.to_string(),
            });
        }
        inner.in_flight.insert(path.to_string());
        Ok(())
    }

    /// Promote a completed upload into the registry.
    pub fn finish_upload(&self, path: &str) {
        let mut inner = self.inner.lock();
        inner.in_flight.remove(path);
        inner.available.insert(path.to_string());
    }

    /// Forget a failed upload. The registry is untouched.
    pub fn abort_upload(&self, path: &str) -> bool {
        self.inner.lock().in_flight.remove(path)
    }
}

/// Unbounded FIFO of pending work.
///
/// New items wake the write loop; requeued items do not, they wait for the next
/// claim release or new item instead of spinning the loop.
#[derive(Debug)]
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Arc<Notify>,
}

impl<T> WorkQueue<T> {
    fn new(ready: Arc<Notify>) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready,
        }
    }

    pub fn put(&self, item: T) {
        self.items.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Put an item back that could not be dispatched yet.
    pub fn requeue(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// State shared by the read engine, the write engine and the lifecycle manager.
#[derive(Debug)]
pub struct SharedSyncState {
    clients: Membership,
    files: FileRegistry,
    write_requests: WorkQueue<WriteRequest>,
    reverse_inits: WorkQueue<ReverseInit>,
    read_claims: ClaimSet,
    write_claims: ClaimSet,
    work_ready: Arc<Notify>,
}

impl Default for SharedSyncState {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl SharedSyncState {
    /// Create state whose registry is seeded with `files`.
    pub fn new<I>(files: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        let work_ready = Arc::new(Notify::new());
        Self {
            clients: Membership::default(),
            files: FileRegistry::new(files),
            write_requests: WorkQueue::new(Arc::clone(&work_ready)),
            reverse_inits: WorkQueue::new(Arc::clone(&work_ready)),
            read_claims: ClaimSet::new(),
            write_claims: ClaimSet::new(),
            work_ready,
        }
    }

    pub fn clients(&self) -> &Membership {
        &self.clients
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    pub fn write_requests(&self) -> &WorkQueue<WriteRequest> {
        &self.write_requests
    }

    pub fn reverse_inits(&self) -> &WorkQueue<ReverseInit> {
        &self.reverse_inits
    }

    pub fn read_claims(&self) -> &ClaimSet {
        &self.read_claims
    }

    pub fn write_claims(&self) -> &ClaimSet {
        &self.write_claims
    }

    /// Signal fired on new work and on released write claims.
    pub fn work_ready(&self) -> Arc<Notify> {
        Arc::clone(&self.work_ready)
    }

    pub fn notify_work(&self) {
        self.work_ready.notify_one();
    }
}
