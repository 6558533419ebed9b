//! Server configuration.
//!
//! [`SyncConfig`] holds everything the server and the engines read at startup.
//! Values come from the built-in defaults, an optional TOML file
//! ([`FileConfig`]) and the command line (see [`crate::cli`]), in that order of
//! increasing precedence.

use crate::protocol::{timeouts, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CLIENTS, DEFAULT_POOL_HEADROOM};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_ROOT: &str = "mounted-server-folder";
/// Only ever used when the daemon runs with `--debug`.
pub const DEBUG_API_KEY: &str = "SUPER-SECRET-API-KEY";

#[derive(Clone)]
pub struct SyncConfig {
    pub bind_addr: SocketAddr,
    pub root: PathBuf,
    pub api_key: Vec<u8>,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub auth_timeout: Duration,
    pub close_timeout: Duration,
}

// Hand-written so the key never ends up in logs
impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("bind_addr", &self.bind_addr)
            .field("root", &self.root)
            .field("api_key", &"<redacted>")
            .field("chunk_size", &self.chunk_size)
            .field("max_workers", &self.max_workers)
            .field("auth_timeout", &self.auth_timeout)
            .field("close_timeout", &self.close_timeout)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            root: PathBuf::from(DEFAULT_ROOT),
            api_key: DEBUG_API_KEY.as_bytes().to_vec(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: DEFAULT_MAX_CLIENTS + DEFAULT_POOL_HEADROOM,
            auth_timeout: Duration::from_millis(timeouts::AUTH_MS),
            close_timeout: Duration::from_millis(timeouts::CLOSE_MS),
        }
    }
}

impl SyncConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.bind_addr.set_port(port);
        self
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_api_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.api_key = key.into();
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Reject settings the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk size must be greater than zero");
        }
        if u32::try_from(self.chunk_size).is_err() {
            anyhow::bail!(
                "chunk size {} does not fit in a frame (max {})",
                self.chunk_size,
                u32::MAX
            );
        }
        if self.max_workers == 0 {
            anyhow::bail!("worker pool needs at least one worker");
        }
        if self.api_key.is_empty() {
            anyhow::bail!("api key must not be empty");
        }
        Ok(())
    }

    /// Check that the sync root exists and is a directory.
    pub fn validate_root(&self) -> Result<()> {
        let meta = std::fs::metadata(&self.root)
            .with_context(|| format!("sync root does not exist: {}", self.root.display()))?;
        if !meta.is_dir() {
            anyhow::bail!("sync root is not a directory: {}", self.root.display());
        }
        Ok(())
    }
}

/// Optional settings file, every field may be left out.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub port: Option<u16>,
    pub host: Option<std::net::IpAddr>,
    pub folder: Option<PathBuf>,
    pub api_key: Option<String>,
    pub chunk_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub auth_timeout_ms: Option<u64>,
    pub close_timeout_ms: Option<u64>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.chunk_size, 10_000_000);
        assert_eq!(config.max_workers, 38);
        assert_eq!(config.root, PathBuf::from("mounted-server-folder"));
    }

    #[test]
    fn validation_rejects_unusable_values() {
        assert!(SyncConfig::default().with_chunk_size(0).validate().is_err());
        assert!(SyncConfig::default().with_max_workers(0).validate().is_err());
        assert!(SyncConfig::default().with_api_key("").validate().is_err());
        #[cfg(target_pointer_width = "64")]
        assert!(SyncConfig::default()
            .with_chunk_size(u32::MAX as usize + 1)
            .validate()
            .is_err());
    }

    #[test]
    fn debug_output_hides_key() {
        let config = SyncConfig::default().with_api_key("hunter2");
        let shown = format!("{config:?}");
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("redacted"));
    }

    #[test]
    fn parses_partial_file() {
        let file = FileConfig::parse("port = 9000\nfolder = \"/srv/sync\"\nchunk_size = 4096\n")
            .unwrap();
        assert_eq!(file.port, Some(9000));
        assert_eq!(file.folder, Some(PathBuf::from("/srv/sync")));
        assert_eq!(file.chunk_size, Some(4096));
        assert!(file.api_key.is_none());
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(FileConfig::parse("prot = 1").is_err());
    }

    #[test]
    fn root_must_be_a_directory() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let config = SyncConfig::default().with_root(temp_dir.path());
        config.validate_root().unwrap();
        assert!(config
            .with_root(temp_dir.path().join("missing"))
            .validate_root()
            .is_err());
    }
}
