// SPDX-License-Identifier: AGPL-3.0
// CryptPort Core - Wire codec
//
// Every message is one frame: a 4-byte big-endian payload length followed
// by the payload. Requests and responses share the metadata and body
// layout; only the leading fields differ.
//
// The codec is a pure framing layer. It never retries and never interprets
// commands beyond validating their codes.

use crate::types::{SessionError, SessionResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

/// Size of the frame length header
pub const FRAME_HEADER_LEN: usize = 4;

/// Default cap on a single frame payload
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Default transfer chunk size, shared by upload and download
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Payload bytes a chunk frame needs besides the chunk itself (token,
/// metadata and fixed fields). Used to validate chunk/frame size settings.
pub const FRAME_OVERHEAD_ALLOWANCE: usize = 4 * 1024;

/// Metadata keys used by the protocol
pub mod keys {
    pub const NAME: &str = "name";
    pub const SIZE: &str = "size";
    pub const TRANSFER: &str = "transfer";
    pub const OFFSET: &str = "offset";
    pub const CHECKSUM: &str = "checksum";
    pub const END: &str = "end";
}

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Auth,
    List,
    UploadBegin,
    UploadChunk,
    UploadEnd,
    DownloadBegin,
    DownloadChunk,
    Delete,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Self::Auth => 1,
            Self::List => 2,
            Self::UploadBegin => 3,
            Self::UploadChunk => 4,
            Self::UploadEnd => 5,
            Self::DownloadBegin => 6,
            Self::DownloadChunk => 7,
            Self::Delete => 8,
        }
    }

    pub fn from_code(code: u8) -> SessionResult<Self> {
        Ok(match code {
            1 => Self::Auth,
            2 => Self::List,
            3 => Self::UploadBegin,
            4 => Self::UploadChunk,
            5 => Self::UploadEnd,
            6 => Self::DownloadBegin,
            7 => Self::DownloadChunk,
            8 => Self::Delete,
            other => {
                return Err(SessionError::Protocol(format!(
                    "Unknown command code {}",
                    other
                )))
            }
        })
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Auth => "AUTH",
            Self::List => "LIST",
            Self::UploadBegin => "UPLOAD_BEGIN",
            Self::UploadChunk => "UPLOAD_CHUNK",
            Self::UploadEnd => "UPLOAD_END",
            Self::DownloadBegin => "DOWNLOAD_BEGIN",
            Self::DownloadChunk => "DOWNLOAD_CHUNK",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
        }
    }

    fn from_code(code: u8) -> SessionResult<Self> {
        match code {
            0 => Ok(Self::Ok),
            1 => Ok(Self::Error),
            other => Err(SessionError::Protocol(format!(
                "Unknown status code {}",
                other
            ))),
        }
    }
}

/// A client-to-server message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub token: Option<String>,
    pub metadata: Metadata,
    pub body: Bytes,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            token: None,
            metadata: Metadata::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> SessionResult<()> {
        dst.put_u8(self.command.code());
        match &self.token {
            Some(token) => {
                dst.put_u8(1);
                put_short_str(dst, token)?;
            }
            None => dst.put_u8(0),
        }
        put_metadata(dst, &self.metadata)?;
        dst.put_u64(self.body.len() as u64);
        dst.put_slice(&self.body);
        Ok(())
    }

    fn decode_payload(mut src: Bytes) -> SessionResult<Self> {
        let command = Command::from_code(take_u8(&mut src)?)?;
        let token = match take_u8(&mut src)? {
            0 => None,
            1 => Some(take_short_str(&mut src)?),
            other => {
                return Err(SessionError::Protocol(format!(
                    "Invalid token flag {}",
                    other
                )))
            }
        };
        let metadata = take_metadata(&mut src)?;
        let body = take_body(&mut src)?;
        Ok(Self {
            command,
            token,
            metadata,
            body,
        })
    }
}

/// A server-to-client message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub message: String,
    pub metadata: Metadata,
    pub body: Bytes,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: String::new(),
            metadata: Metadata::new(),
            body: Bytes::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: message.into(),
            metadata: Metadata::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Parse a required numeric metadata value
    pub fn meta_u64(&self, key: &str) -> SessionResult<u64> {
        self.meta(key)
            .ok_or_else(|| SessionError::Protocol(format!("Missing '{}' in response", key)))?
            .parse()
            .map_err(|_| SessionError::Protocol(format!("Invalid '{}' in response", key)))
    }

    /// Turn an error response into `ServerRejected`
    pub fn into_result(self) -> SessionResult<Self> {
        match self.status {
            Status::Ok => Ok(self),
            Status::Error => Err(SessionError::ServerRejected(if self.message.is_empty() {
                "Request rejected".to_string()
            } else {
                self.message
            })),
        }
    }

    fn encode_payload(&self, dst: &mut BytesMut) -> SessionResult<()> {
        dst.put_u8(self.status.code());
        put_short_str(dst, &self.message)?;
        put_metadata(dst, &self.metadata)?;
        dst.put_u64(self.body.len() as u64);
        dst.put_slice(&self.body);
        Ok(())
    }

    fn decode_payload(mut src: Bytes) -> SessionResult<Self> {
        let status = Status::from_code(take_u8(&mut src)?)?;
        let message = take_short_str(&mut src)?;
        let metadata = take_metadata(&mut src)?;
        let body = take_body(&mut src)?;
        Ok(Self {
            status,
            message,
            metadata,
            body,
        })
    }
}

/// Client side: encodes requests, decodes responses
#[derive(Debug, Clone)]
pub struct ClientCodec {
    max_frame_len: u32,
}

impl ClientCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Encoder<Request> for ClientCodec {
    type Error = SessionError;

    fn encode(&mut self, item: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(dst, self.max_frame_len, |buf| item.encode_payload(buf))
    }
}

impl Decoder for ClientCodec {
    type Item = Response;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match read_frame(src, self.max_frame_len)? {
            Some(payload) => Response::decode_payload(payload).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(truncated(src.len())),
        }
    }
}

/// Server side: decodes requests, encodes responses
#[derive(Debug, Clone)]
pub struct ServerCodec {
    max_frame_len: u32,
}

impl ServerCodec {
    pub fn new(max_frame_len: u32) -> Self {
        Self { max_frame_len }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl Encoder<Response> for ServerCodec {
    type Error = SessionError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        write_frame(dst, self.max_frame_len, |buf| item.encode_payload(buf))
    }
}

impl Decoder for ServerCodec {
    type Item = Request;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match read_frame(src, self.max_frame_len)? {
            Some(payload) => Request::decode_payload(payload).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(truncated(src.len())),
        }
    }
}

fn truncated(buffered: usize) -> SessionError {
    SessionError::Protocol(format!(
        "Connection closed mid-frame ({} bytes buffered)",
        buffered
    ))
}

/// Reserve the header, encode the payload, then back-fill the length
fn write_frame(
    dst: &mut BytesMut,
    max_frame_len: u32,
    encode: impl FnOnce(&mut BytesMut) -> SessionResult<()>,
) -> SessionResult<()> {
    let start = dst.len();
    dst.put_u32(0);
    if let Err(e) = encode(dst) {
        dst.truncate(start);
        return Err(e);
    }

    let payload_len = dst.len() - start - FRAME_HEADER_LEN;
    if payload_len > max_frame_len as usize {
        dst.truncate(start);
        return Err(SessionError::Protocol(format!(
            "Outgoing frame of {} bytes exceeds maximum {}",
            payload_len, max_frame_len
        )));
    }

    dst[start..start + FRAME_HEADER_LEN].copy_from_slice(&(payload_len as u32).to_be_bytes());
    Ok(())
}

/// Split one complete payload off the buffer, if available
fn read_frame(src: &mut BytesMut, max_frame_len: u32) -> SessionResult<Option<Bytes>> {
    if src.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
    let len = u32::from_be_bytes(header);

    if len == 0 {
        return Err(SessionError::Protocol("Empty frame".to_string()));
    }
    if len > max_frame_len {
        return Err(SessionError::Protocol(format!(
            "Frame length {} exceeds maximum {}",
            len, max_frame_len
        )));
    }

    let total = FRAME_HEADER_LEN + len as usize;
    if src.len() < total {
        src.reserve(total - src.len());
        return Ok(None);
    }

    src.advance(FRAME_HEADER_LEN);
    Ok(Some(src.split_to(len as usize).freeze()))
}

fn put_short_str(dst: &mut BytesMut, value: &str) -> SessionResult<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| SessionError::Protocol(format!("Field too long ({} bytes)", value.len())))?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn put_metadata(dst: &mut BytesMut, metadata: &Metadata) -> SessionResult<()> {
    let count = u16::try_from(metadata.len())
        .map_err(|_| SessionError::Protocol("Too many metadata entries".to_string()))?;
    dst.put_u16(count);
    for (key, value) in metadata {
        put_short_str(dst, key)?;
        put_short_str(dst, value)?;
    }
    Ok(())
}

fn ensure_remaining(src: &Bytes, needed: usize) -> SessionResult<()> {
    if src.remaining() < needed {
        return Err(SessionError::Protocol(format!(
            "Frame payload truncated: needed {} more bytes, {} left",
            needed,
            src.remaining()
        )));
    }
    Ok(())
}

fn take_u8(src: &mut Bytes) -> SessionResult<u8> {
    ensure_remaining(src, 1)?;
    Ok(src.get_u8())
}

fn take_short_str(src: &mut Bytes) -> SessionResult<String> {
    ensure_remaining(src, 2)?;
    let len = src.get_u16() as usize;
    ensure_remaining(src, len)?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| SessionError::Protocol("Invalid UTF-8 in frame".to_string()))
}

fn take_metadata(src: &mut Bytes) -> SessionResult<Metadata> {
    ensure_remaining(src, 2)?;
    let count = src.get_u16();
    let mut metadata = Metadata::new();
    for _ in 0..count {
        let key = take_short_str(src)?;
        let value = take_short_str(src)?;
        metadata.insert(key, value);
    }
    Ok(metadata)
}

fn take_body(src: &mut Bytes) -> SessionResult<Bytes> {
    ensure_remaining(src, 8)?;
    let len = src.get_u64();
    if len != src.remaining() as u64 {
        return Err(SessionError::Protocol(format!(
            "Body length {} does not match {} payload bytes",
            len,
            src.remaining()
        )));
    }
    Ok(src.split_to(len as usize))
}
