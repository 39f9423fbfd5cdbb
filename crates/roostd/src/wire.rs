// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-socket framing and message shapes.
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes
//! of JSON. A connection opens with a `Hello` exchange; after that each
//! request carries a per-connection correlation id which every reply (and
//! every stream frame spawned by a Subscribe) echoes.

use std::collections::HashMap;
use std::io;

use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ErrorKind, SessionError};
use crate::pty::ExitStatus;
use crate::registry::SessionInfo;

/// Explicit protocol number for deliberate breaking changes; day-to-day
/// compatibility is carried by the build fingerprint.
pub const PROTO_VERSION: u32 = 1;

/// Upper bound on a single frame's JSON payload.
pub const MAX_FRAME: usize = 1024 * 1024;

/// First frame in each direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloFrame {
    pub hello: Hello,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub role: Role,
    /// 16-hex build fingerprint of the sender's executable.
    pub build: String,
    pub proto: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Daemon,
}

impl HelloFrame {
    pub fn new(role: Role, build: impl Into<String>) -> Self {
        Self {
            hello: Hello { role, build: build.into(), proto: PROTO_VERSION },
        }
    }
}

/// A request frame: correlation id plus verb.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    #[serde(flatten)]
    pub op: Op,
}

/// Control verbs. The serialized form is `{"op": "...", "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args", rename_all = "snake_case")]
pub enum Op {
    Start(StartArgs),
    Write(WriteArgs),
    Resize(ResizeArgs),
    Stop(IdArgs),
    List,
    Get(IdArgs),
    Tail(TailArgs),
    Subscribe(IdArgs),
    Unsubscribe,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartArgs {
    pub id: String,
    pub argv: Vec<String>,
    pub cwd: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteArgs {
    pub id: String,
    /// Base64 (standard alphabet) payload.
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResizeArgs {
    pub id: String,
    pub rows: u16,
    pub cols: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdArgs {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TailArgs {
    pub id: String,
    /// Maximum bytes to return; defaults to the whole retained ring.
    #[serde(default)]
    pub max: Option<usize>,
}

/// A reply or stream frame: `{"id": N, "ok"|"error"|"stream": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyBody {
    Ok(OkBody),
    Error(WireError),
    Stream(StreamFrame),
}

/// Success payloads, one shape per verb.
///
/// Untagged: variants with more required fields come first so that
/// deserialization never short-circuits into a smaller shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OkBody {
    Info(SessionInfo),
    Sessions { sessions: Vec<SessionInfo> },
    Data { data: String },
    Written { n: usize },
    Started { pid: i32 },
    Empty {},
}

/// Error payload; `build` is set for `incompatible_build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub kind: ErrorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<String>,
}

/// An error frame with no correlation id (handshake failures, unknown
/// verbs): `{"error": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BareError {
    pub error: WireError,
}

impl From<SessionError> for WireError {
    fn from(e: SessionError) -> Self {
        Self { kind: e.kind, msg: Some(e.msg), build: None }
    }
}

impl From<WireError> for SessionError {
    fn from(e: WireError) -> Self {
        SessionError::new(e.kind, e.msg.unwrap_or_default())
    }
}

/// One frame of a subscribe stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamFrame {
    /// Per-subscription frame counter, starting at 1.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eof: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EofReason>,
}

impl StreamFrame {
    pub fn data(seq: u64, payload: &[u8]) -> Self {
        Self { seq, data: Some(encode_data(payload)), eof: None, reason: None }
    }

    pub fn eof(seq: u64, reason: EofReason) -> Self {
        Self { seq, data: None, eof: Some(true), reason: Some(reason) }
    }

    pub fn is_eof(&self) -> bool {
        self.eof == Some(true)
    }
}

/// Why a subscribe stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EofReason {
    Exited,
    Signalled,
    SupervisorShutdown,
}

impl From<ExitStatus> for EofReason {
    fn from(status: ExitStatus) -> Self {
        if status.signal.is_some() {
            Self::Signalled
        } else {
            Self::Exited
        }
    }
}

pub fn encode_data(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

pub fn decode_data(data: &str) -> Result<Vec<u8>, SessionError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SessionError::internal(format!("invalid base64 payload: {e}")))
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(value)?;
    if payload.len() > MAX_FRAME {
        return Err(io::Error::other(format!("frame of {} bytes exceeds cap", payload.len())));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one frame into a typed message.
///
/// A length outside `(0, MAX_FRAME]` or JSON that does not parse is an
/// `InvalidData` error; callers treat that as a malformed frame and close
/// the connection.
pub async fn read_frame<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let value = read_frame_value(reader).await?;
    serde_json::from_value(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Read one frame as loose JSON, for dispatch that must inspect the verb
/// before committing to a shape.
pub async fn read_frame_value<R>(reader: &mut R) -> io::Result<serde_json::Value>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} out of range"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
#[path = "wire_tests.rs"]
mod tests;
