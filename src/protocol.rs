//! Shared protocol constants for the filesync framed transport
//!
//! Every message on the wire is one frame:
//! `[1 byte opcode][4 bytes payload length, little-endian][payload]`.
//! Frames are self-delimiting and may be pipelined back-to-back.

/// Size of the fixed frame header (opcode + length).
pub const HEADER_LEN: usize = 1 + 4;

/// Default NEW_FILE_PART payload size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 10_000_000;

/// Worker pool size: expected maximum number of clients plus headroom for misc tasks.
pub const DEFAULT_MAX_CLIENTS: usize = 32;
pub const DEFAULT_POOL_HEADROOM: usize = 6;

/// Separator between entries of an INIT path list.
pub const PATH_LIST_SEPARATOR: char = '\n';

// Opcode byte values (keep numeric stable, clients depend on them)
pub mod opcode {
    pub const INIT: u8 = 0x00;
    pub const NEW_FILE_PATH: u8 = 0x01;
    pub const NEW_FILE_PART: u8 = 0x02;
    pub const NEW_FILE_END: u8 = 0x03;
    pub const CLOSE: u8 = 0x04;
}

// Centralized timeout constants
pub mod timeouts {
    // Time a fresh connection gets to present its api key (ms)
    pub const AUTH_MS: u64 = 5_000;

    // Best-effort CLOSE frame + socket shutdown during teardown (ms)
    pub const CLOSE_MS: u64 = 500;

    // Connection attempts from the protocol client (ms)
    pub const CONNECT_MS: u64 = 2_000;
}
