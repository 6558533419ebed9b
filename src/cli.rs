//! Daemon command line

use crate::config::{FileConfig, SyncConfig};
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Folder synchronization server
#[derive(Clone, Debug, Parser)]
#[command(name = "filesyncd", version, about)]
pub struct DaemonOpts {
    /// TOML settings file, overridden by environment and flags
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Fill missing port, folder and api key with development defaults
    #[arg(long)]
    pub debug: bool,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    pub verbose: bool,

    /// Listen port
    #[arg(long, env = "SERVER_PORT")]
    pub port: Option<u16>,

    /// Sync root directory
    #[arg(long, env = "SERVER_FOLDER")]
    pub folder: Option<PathBuf>,

    /// Pre-shared key clients must present on connect
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// NEW_FILE_PART payload size in bytes
    #[arg(long, env = "CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Worker pool size
    #[arg(long, env = "MAX_WORKERS")]
    pub max_workers: Option<usize>,
}

impl DaemonOpts {
    /// Merge defaults, the settings file and these options into a checked config.
    pub fn resolve(&self) -> Result<SyncConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let port = self.port.or(file.port);
        let folder = self.folder.clone().or(file.folder);
        let api_key = self.api_key.clone().or(file.api_key);

        if !self.debug {
            let mut missing = Vec::new();
            if port.is_none() {
                missing.push("port (--port or SERVER_PORT)");
            }
            if folder.is_none() {
                missing.push("folder (--folder or SERVER_FOLDER)");
            }
            if api_key.is_none() {
                missing.push("api key (--api-key or API_KEY)");
            }
            if !missing.is_empty() {
                anyhow::bail!(
                    "missing required settings: {} (or run with --debug)",
                    missing.join(", ")
                );
            }
        }

        let mut config = SyncConfig::default();
        if let Some(host) = file.host {
            config.bind_addr.set_ip(host);
        }
        if let Some(port) = port {
            config = config.with_port(port);
        }
        if let Some(folder) = folder {
            config = config.with_root(folder);
        }
        if let Some(key) = api_key {
            config = config.with_api_key(key.into_bytes());
        }
        if let Some(chunk_size) = self.chunk_size.or(file.chunk_size) {
            config = config.with_chunk_size(chunk_size);
        }
        if let Some(workers) = self.max_workers.or(file.max_workers) {
            config = config.with_max_workers(workers);
        }
        if let Some(ms) = file.auth_timeout_ms {
            config = config.with_auth_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = file.close_timeout_ms {
            config = config.with_close_timeout(Duration::from_millis(ms));
        }
        config.validate()?;
        Ok(config)
    }
}
