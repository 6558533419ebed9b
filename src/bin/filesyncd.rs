use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use filesync::cli::DaemonOpts;
use filesync::scan::enumerate_sync_root;
use filesync::{FsStorage, SharedSyncState, SyncManager};

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let mut config = opts.resolve()?;
    config.validate_root()?;
    config.root = std::fs::canonicalize(&config.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", config.root.display()))?;

    let files = enumerate_sync_root(&config.root)?;
    info!(
        root = %config.root.display(),
        bind = %config.bind_addr,
        files = files.len(),
        chunk_size = config.chunk_size,
        workers = config.max_workers,
        "starting filesync daemon"
    );
    if opts.debug {
        tracing::warn!("debug mode: development defaults may be in use, do not expose this server");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        let state = Arc::new(SharedSyncState::new(files));
        let storage = Arc::new(FsStorage::new(config.root.clone()));
        let manager = Arc::new(SyncManager::new(state, storage, &config));

        let stop = CancellationToken::new();
        let mut server = tokio::spawn(filesync::server::run(config, manager, stop.clone()));

        let finished = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("shutting down");
                stop.cancel();
                None
            }
            finished = &mut server => Some(finished),
        };
        let finished = match finished {
            Some(finished) => finished,
            None => server.await,
        };
        finished.context("server task panicked")??;
        Ok::<(), anyhow::Error>(())
    })
}
