//! Protocol client.
//!
//! Speaks the same framing as the server: presents the key, then exchanges
//! INIT / NEW_FILE_* / CLOSE frames. Used by the end-to-end tests and by anything
//! embedding a sync client.

use crate::connection::Connection;
use crate::error::{ProtocolError, SyncError, SyncResult};
use crate::frame::{Frame, Opcode};
use crate::paths::decode_path;
use crate::protocol::timeouts;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};

pub struct SyncClient {
    conn: Arc<Connection>,
}

impl SyncClient {
    /// Connect and present `api_key`.
    pub async fn connect<A: ToSocketAddrs>(addr: A, api_key: &[u8]) -> Result<Self> {
        let mut stream = tokio::time::timeout(
            Duration::from_millis(timeouts::CONNECT_MS),
            TcpStream::connect(addr),
        )
        .await
        .context("connect timed out")?
        .context("connect failed")?;
        stream.set_nodelay(true).ok();
        stream
            .write_all(api_key)
            .await
            .context("failed to send api key")?;
        Ok(Self {
            conn: Connection::from_tcp(stream),
        })
    }

    /// Wrap an already authenticated stream.
    pub fn from_connection(conn: Arc<Connection>) -> Self {
        Self { conn }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Announce the paths this client already has.
    pub async fn send_init<S: AsRef<str>>(&self, paths: &[S]) -> SyncResult<()> {
        Ok(self.conn.send_frame(&Frame::init(paths)).await?)
    }

    /// Upload one file as NEW_FILE_PATH, `chunk_size` parts, NEW_FILE_END.
    pub async fn upload(&self, path: &str, data: &[u8], chunk_size: usize) -> SyncResult<()> {
        let chunk_size = chunk_size.max(1);
        self.conn.send_frame(&Frame::new_file_path(path)).await?;
        for chunk in data.chunks(chunk_size) {
            self.conn
                .send_frame(&Frame::new_file_part(chunk.to_vec()))
                .await?;
        }
        if data.len() % chunk_size == 0 {
            // Empty or exact multiple: terminate with an empty part like the server does
            self.conn.send_frame(&Frame::new_file_part(Vec::new())).await?;
        }
        self.conn.send_frame(&Frame::new_file_end(path)).await?;
        Ok(())
    }

    pub async fn next_frame(&self) -> SyncResult<Frame> {
        Ok(self.conn.read_frame().await?)
    }

    /// Read one complete file transfer from the server.
    pub async fn receive_file(&self) -> SyncResult<(String, Vec<u8>)> {
        let start = self.next_frame().await?;
        if start.opcode() != Opcode::NewFilePath {
            return Err(ProtocolError::UnexpectedOpcode {
                opcode: start.opcode(),
                expected: "NEW_FILE_PATH",
            }
            .into());
        }
        let path = decode_path(start.payload())?;
        let mut data = Vec::new();
        loop {
            let frame = self.next_frame().await?;
            match frame.opcode() {
                Opcode::NewFilePart => data.extend_from_slice(frame.payload()),
                Opcode::NewFileEnd => return Ok((path, data)),
                opcode => {
                    return Err(ProtocolError::UnexpectedOpcode {
                        opcode,
                        expected: "NEW_FILE_PART or NEW_FILE_END",
                    }
                    .into())
                }
            }
        }
    }

    /// Send CLOSE and shut the write half.
    pub async fn close(&self) -> SyncResult<()> {
        if self.conn.is_closed() {
            return Err(SyncError::ConnectionClosed);
        }
        self.conn.send_frame(&Frame::close()).await?;
        self.conn.shutdown().await?;
        self.conn.mark_closed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::read_frame;

    #[tokio::test]
    async fn upload_frames_are_chunked() {
        let (mut server, client) = tokio::io::duplex(64 * 1024);
        let client = SyncClient::from_connection(Connection::new(client, "server"));
        client.upload("d/f.bin", b"abcdefgh", 3).await.unwrap();

        let mut opcodes = Vec::new();
        let mut data = Vec::new();
        loop {
            let frame = read_frame(&mut server).await.unwrap();
            opcodes.push(frame.opcode());
            if frame.opcode() == Opcode::NewFilePart {
                data.extend_from_slice(frame.payload());
            }
            if frame.opcode() == Opcode::NewFileEnd {
                assert_eq!(frame.payload(), b"d/f.bin");
                break;
            }
        }
        assert_eq!(data, b"abcdefgh");
        assert_eq!(
            opcodes,
            vec![
                Opcode::NewFilePath,
                Opcode::NewFilePart,
                Opcode::NewFilePart,
                Opcode::NewFilePart,
                Opcode::NewFileEnd
            ]
        );
    }

    #[tokio::test]
    async fn close_sends_close_frame_once() {
        let (mut server, client) = tokio::io::duplex(1024);
        let client = SyncClient::from_connection(Connection::new(client, "server"));
        client.close().await.unwrap();
        assert!(client.close().await.is_err());
        assert_eq!(read_frame(&mut server).await.unwrap().opcode(), Opcode::Close);
    }
}
