//! Frame codec for the sync protocol
//!
//! A frame is the atomic unit on the wire: one opcode byte, a 4-byte little-endian
//! payload length, then the payload. The codec enforces no maximum payload size;
//! callers decide how large a NEW_FILE_PART chunk may be.

use crate::error::ProtocolError;
use crate::protocol::{opcode, HEADER_LEN, PATH_LIST_SEPARATOR};
use std::fmt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// Upper bound on the up-front allocation for a payload; larger payloads grow as they arrive
const PREALLOC_LIMIT: usize = 1024 * 1024;

/// The five frame kinds of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Path list exchange (client -> server on connect, server -> client as upload request).
    Init,
    /// Start of a file transfer; payload is the relative path.
    NewFilePath,
    /// One chunk of file content.
    NewFilePart,
    /// End of a file transfer; payload repeats the relative path.
    NewFileEnd,
    /// Orderly shutdown; empty payload.
    Close,
}

impl Opcode {
    /// Wire byte for this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Init => opcode::INIT,
            Opcode::NewFilePath => opcode::NEW_FILE_PATH,
            Opcode::NewFilePart => opcode::NEW_FILE_PART,
            Opcode::NewFileEnd => opcode::NEW_FILE_END,
            Opcode::Close => opcode::CLOSE,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            opcode::INIT => Ok(Opcode::Init),
            opcode::NEW_FILE_PATH => Ok(Opcode::NewFilePath),
            opcode::NEW_FILE_PART => Ok(Opcode::NewFilePart),
            opcode::NEW_FILE_END => Ok(Opcode::NewFileEnd),
            opcode::CLOSE => Ok(Opcode::Close),
            other => Err(ProtocolError::UnknownOpcode(other)),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Init => "INIT",
            Opcode::NewFilePath => "NEW_FILE_PATH",
            Opcode::NewFilePart => "NEW_FILE_PART",
            Opcode::NewFileEnd => "NEW_FILE_END",
            Opcode::Close => "CLOSE",
        };
        f.write_str(name)
    }
}

/// One protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    opcode: Opcode,
    payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    /// INIT frame carrying a newline-joined path list.
    pub fn init<S: AsRef<str>>(paths: &[S]) -> Self {
        let mut payload = String::new();
        for (i, p) in paths.iter().enumerate() {
            if i > 0 {
                payload.push(PATH_LIST_SEPARATOR);
            }
            payload.push_str(p.as_ref());
        }
        Self::new(Opcode::Init, payload.into_bytes())
    }

    pub fn new_file_path(path: &str) -> Self {
        Self::new(Opcode::NewFilePath, path.as_bytes())
    }

    pub fn new_file_part(chunk: Vec<u8>) -> Self {
        Self::new(Opcode::NewFilePart, chunk)
    }

    pub fn new_file_end(path: &str) -> Self {
        Self::new(Opcode::NewFileEnd, path.as_bytes())
    }

    pub fn close() -> Self {
        Self::new(Opcode::Close, Vec::new())
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Encode header and payload into one contiguous buffer.
    ///
    /// Used when the same frame is fanned out to several connections so it is
    /// serialized once.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let len = payload_len(self.payload.len())?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&build_frame_header(self.opcode, len));
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

fn payload_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge(len))
}

/// Build frame header (5 bytes)
/// Format: OPCODE (1) | LENGTH (4, little-endian)
pub fn build_frame_header(opcode: Opcode, payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = opcode.as_u8();
    header[1..5].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (opcode, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(Opcode, u32), ProtocolError> {
    let opcode = Opcode::try_from(header[0])?;
    let payload_len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]);
    Ok((opcode, payload_len))
}

/// Read until `buf` is full or the stream ends. Returns the number of bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Decode exactly one frame from `reader`.
///
/// A stream that ends before the first header byte yields
/// [`ProtocolError::ConnectionClosed`]; one that ends anywhere later is a
/// truncation or length mismatch.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, ProtocolError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; HEADER_LEN];
    let n = read_full(reader, &mut header).await?;
    if n == 0 {
        return Err(ProtocolError::ConnectionClosed);
    }
    if n < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            read: n,
            expected: HEADER_LEN,
        });
    }
    let (opcode, declared) = parse_frame_header(&header)?;

    let mut payload = Vec::with_capacity((declared as usize).min(PREALLOC_LIMIT));
    if declared > 0 {
        let read = (&mut *reader)
            .take(u64::from(declared))
            .read_to_end(&mut payload)
            .await?;
        if read != declared as usize {
            return Err(ProtocolError::PayloadLength { declared, read });
        }
    }
    Ok(Frame { opcode, payload })
}

/// Encode one frame to `writer` and flush.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = payload_len(frame.payload.len())?;
    writer
        .write_all(&build_frame_header(frame.opcode, len))
        .await?;
    if !frame.payload.is_empty() {
        writer.write_all(&frame.payload).await?;
    }
    writer.flush().await?;
    Ok(())
}
