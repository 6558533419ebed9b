//! TCP accept loop and session establishment.
//!
//! A fresh socket must present the pre-shared key (raw bytes, no framing) within
//! the auth timeout. Only then is it wrapped in a [`Connection`] and handed to the
//! [`SyncManager`].

use crate::config::SyncConfig;
use crate::connection::Connection;
use crate::manager::SyncManager;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

pub struct SyncServer {
    listener: TcpListener,
    manager: Arc<SyncManager>,
    api_key: Arc<[u8]>,
    auth_timeout: Duration,
}

impl SyncServer {
    pub async fn bind(config: &SyncConfig, manager: Arc<SyncManager>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .with_context(|| format!("bind {}", config.bind_addr))?;
        Ok(Self {
            listener,
            manager,
            api_key: Arc::from(config.api_key.as_slice()),
            auth_timeout: config.auth_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("listener has no local address")
    }

    /// Accept until `stop` fires.
    pub async fn run(self, stop: CancellationToken) -> Result<()> {
        info!(addr = %self.local_addr()?, "listening");
        loop {
            let (stream, peer) = tokio::select! {
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // Back off on persistent errors such as fd exhaustion
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }
            let manager = Arc::clone(&self.manager);
            let key = Arc::clone(&self.api_key);
            let auth_timeout = self.auth_timeout;
            tokio::spawn(
                async move {
                    admit(stream, manager, &key, auth_timeout).await;
                }
                .instrument(tracing::debug_span!("accept", peer = %peer)),
            );
        }
        info!("accept loop stopped");
        Ok(())
    }
}

async fn admit(mut stream: TcpStream, manager: Arc<SyncManager>, key: &[u8], limit: Duration) {
    match authenticate(&mut stream, key, limit).await {
        Ok(true) => manager.register(Connection::from_tcp(stream)),
        Ok(false) => {
            warn!("rejected connection: wrong key");
            hang_up(&mut stream).await;
        }
        Err(e) => {
            warn!(error = %e, "rejected connection: handshake failed");
            hang_up(&mut stream).await;
        }
    }
}

async fn hang_up(stream: &mut TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!(error = %e, "shutdown of rejected connection failed");
    }
}

/// Read exactly `key.len()` bytes and compare them with the key.
pub async fn authenticate(stream: &mut TcpStream, key: &[u8], limit: Duration) -> Result<bool> {
    let mut presented = vec![0u8; key.len()];
    timeout(limit, stream.read_exact(&mut presented))
        .await
        .with_context(|| format!("no key within {} ms", limit.as_millis()))?
        .context("stream ended before the key was complete")?;
    Ok(keys_match(&presented, key))
}

fn keys_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    // Constant time over the key length
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Bind, serve and wait for `stop`, then shut the engines down.
pub async fn run(config: SyncConfig, manager: Arc<SyncManager>, stop: CancellationToken) -> Result<()> {
    manager.start();
    let server = SyncServer::bind(&config, Arc::clone(&manager)).await?;
    let result = server.run(stop).await;
    if let Err(e) = &result {
        error!(error = %e, "server stopped with error");
    }
    manager.shutdown().await;
    result
}
