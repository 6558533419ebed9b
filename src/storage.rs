//! Storage interface consumed by the sync engines.
//!
//! The engines never touch the filesystem directly. They go through
//! [`SyncStorage`], addressing files by their relative wire path, so the same
//! read/write logic runs against the real sync root or an in-memory store.
//!
//! ## Available Backends
//!
//! - [`FsStorage`] - files under a sync root directory
//! - [`MemoryStorage`] - in-memory files, records every call, for tests

use crate::paths::normalize_under_root;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Destination for an inbound file.
pub type FileSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Source for an outbound file.
pub type FileSource = Box<dyn AsyncRead + Send + Unpin>;

/// Raw file primitives, addressed by relative path.
///
/// All methods may fail with an I/O error; callers decide whether that is fatal
/// to the connection at hand.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Create every missing parent directory of `path`.
    async fn create_parent_dirs(&self, path: &str) -> io::Result<()>;

    /// Create or truncate `path` for writing.
    async fn open_for_write(&self, path: &str) -> io::Result<FileSink>;

    /// Open `path` for reading.
    async fn open_for_read(&self, path: &str) -> io::Result<FileSource>;

    /// Remove `path`; succeeds when it is already gone.
    async fn delete_if_exists(&self, path: &str) -> io::Result<()>;
}

/// Storage rooted at a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        normalize_under_root(&self.root, path)
    }
}

#[async_trait]
impl SyncStorage for FsStorage {
    async fn create_parent_dirs(&self, path: &str) -> io::Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn open_for_write(&self, path: &str) -> io::Result<FileSink> {
        let file = tokio::fs::File::create(self.resolve(path)?).await?;
        Ok(Box::new(file))
    }

    async fn open_for_read(&self, path: &str) -> io::Result<FileSource> {
        let file = tokio::fs::File::open(self.resolve(path)?).await?;
        Ok(Box::new(file))
    }

    async fn delete_if_exists(&self, path: &str) -> io::Result<()> {
        match tokio::fs::remove_file(self.resolve(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    files: HashMap<String, Vec<u8>>,
    created_dirs: Vec<String>,
    deleted: Vec<String>,
    fail_writes: bool,
    fail_reads_after: Option<usize>,
    bytes_read: u64,
}

/// In-memory storage.
///
/// Keeps file contents in a map and records directory creation and deletion
/// calls so tests can assert on exactly what the engines asked for.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file.
    pub fn insert(&self, path: &str, contents: impl Into<Vec<u8>>) {
        self.inner
            .lock()
            .files
            .insert(path.to_string(), contents.into());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.inner.lock().files.get(path).cloned()
    }

    /// Parent directories requested through `create_parent_dirs`, in call order.
    pub fn created_dirs(&self) -> Vec<String> {
        self.inner.lock().created_dirs.clone()
    }

    /// Paths passed to `delete_if_exists`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.inner.lock().deleted.clone()
    }

    /// Make every subsequent sink write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Make sources opened from now on fail once `limit` bytes have been read.
    pub fn set_fail_reads(&self, limit: Option<usize>) {
        self.inner.lock().fail_reads_after = limit;
    }

    /// Total bytes handed out by every source so far.
    pub fn bytes_read(&self) -> u64 {
        self.inner.lock().bytes_read
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    async fn create_parent_dirs(&self, path: &str) -> io::Result<()> {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.inner.lock().created_dirs.push(parent.to_string());
        }
        Ok(())
    }

    async fn open_for_write(&self, path: &str) -> io::Result<FileSink> {
        self.inner.lock().files.insert(path.to_string(), Vec::new());
        Ok(Box::new(MemorySink {
            path: path.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn open_for_read(&self, path: &str) -> io::Result<FileSource> {
        let data = self.contents(path).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("no such file: {path}"))
        })?;
        let fail_after = self.inner.lock().fail_reads_after;
        Ok(Box::new(MemorySource {
            data,
            pos: 0,
            fail_after,
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn delete_if_exists(&self, path: &str) -> io::Result<()> {
        let mut inner = self.inner.lock();
        inner.files.remove(path);
        inner.deleted.push(path.to_string());
        Ok(())
    }
}

/// Read handle over a snapshot of a [`MemoryStorage`] file.
struct MemorySource {
    data: Vec<u8>,
    pos: usize,
    fail_after: Option<usize>,
    inner: Arc<Mutex<MemoryInner>>,
}

impl AsyncRead for MemorySource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let end = match self.fail_after {
            Some(limit) if self.pos >= limit => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::Other,
                    "simulated read failure",
                )));
            }
            Some(limit) => limit.min(self.data.len()),
            None => self.data.len(),
        };
        let start = self.pos.min(end);
        let n = (end - start).min(buf.remaining());
        buf.put_slice(&self.data[start..start + n]);
        self.pos = start + n;
        self.inner.lock().bytes_read += n as u64;
        Poll::Ready(Ok(()))
    }
}

/// Write handle into a [`MemoryStorage`] file; bytes land in the map immediately.
struct MemorySink {
    path: String,
    inner: Arc<Mutex<MemoryInner>>,
}

impl AsyncWrite for MemorySink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut inner = self.inner.lock();
        if inner.fail_writes {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::Other,
                "simulated write failure",
            )));
        }
        inner
            .files
            .entry(self.path.clone())
            .or_default()
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
