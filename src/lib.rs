//! filesync library
//!
//! Folder synchronization server: clients keep a duplex connection open, the
//! server reconciles its file set with each of them and streams new files both
//! ways for the life of the connection.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod manager;
pub mod paths;
pub mod pool;
pub mod protocol;
pub mod read;
pub mod scan;
pub mod server;
pub mod state;
pub mod storage;
pub mod write;

pub use client::SyncClient;
pub use config::SyncConfig;
pub use connection::{Connection, ConnectionId};
pub use error::{ProtocolError, SyncError, SyncResult};
pub use frame::{Frame, Opcode};
pub use manager::{CloseHook, SyncManager};
pub use server::SyncServer;
pub use state::SharedSyncState;
pub use storage::{FsStorage, MemoryStorage, SyncStorage};
