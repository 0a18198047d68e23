//! Wire protocol for the gate service.
//!
//! Events travel as newline-delimited JSON, internally tagged with an
//! `event` name and a `data` payload. Binary fields are base64-encoded.

use crate::dispatch::{MatchResult, MatchStatus};
use crate::error::{GateError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read, Write};

/// Cap used by clients; the server reads its own from configuration.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    KeyExchange { encrypted_symmetric_key: String },
    Frame { data: String, iv: String },
    Disconnect,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    ServerPublicKey { public_key: String },
    KeyExchangeAck {
        status: String,
    },
    Result {
        status: ResultStatus,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uid: Option<String>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn from_match_result(result: &MatchResult) -> Self {
        ServerEvent::Result {
            status: result.status.into(),
            message: result.message.clone(),
            uid: result.uid.clone(),
        }
    }

    pub fn result(status: ResultStatus, message: impl Into<String>) -> Self {
        ServerEvent::Result {
            status,
            message: message.into(),
            uid: None,
        }
    }

    pub fn error(error: &GateError) -> Self {
        ServerEvent::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Wire-level status vocabulary: match outcomes plus the liveness
/// progress statuses that ride the same `result` event.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Found,
    NoMatch,
    Enrolled,
    NoFace,
    DecodeError,
    DuplicateUid,
    DuplicateFace,
    IndexUnavailable,
    InternalError,
    LivenessPending,
    LivenessConfirmed,
    LivenessTimeout,
}

impl From<MatchStatus> for ResultStatus {
    fn from(status: MatchStatus) -> Self {
        match status {
            MatchStatus::Found => ResultStatus::Found,
            MatchStatus::NoMatch => ResultStatus::NoMatch,
            MatchStatus::Enrolled => ResultStatus::Enrolled,
            MatchStatus::NoFace => ResultStatus::NoFace,
            MatchStatus::DecodeError => ResultStatus::DecodeError,
            MatchStatus::DuplicateUid => ResultStatus::DuplicateUid,
            MatchStatus::DuplicateFace => ResultStatus::DuplicateFace,
            MatchStatus::IndexUnavailable => ResultStatus::IndexUnavailable,
            MatchStatus::InternalError => ResultStatus::InternalError,
        }
    }
}

/// Plaintext carried inside an encrypted `frame` event.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FramePayload {
    pub operation: Operation,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// Absent on the wire reads as empty.
    #[serde(default)]
    pub credential: String,
}

impl FramePayload {
    /// Decodes the base64 image field. Browser captures arrive as
    /// `data:image/...;base64,<payload>`; everything before the first
    /// comma is discarded.
    pub fn image_bytes(&self) -> Result<Vec<u8>> {
        let encoded = match self.image.split_once(',') {
            Some((_, rest)) => rest,
            None => self.image.as_str(),
        };
        STANDARD
            .decode(encoded.trim())
            .map_err(|e| GateError::FaceDetection(format!("Failed to decode image: {}", e)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Identify,
    Enroll,
}

/// Reads one `\n`-terminated line, enforcing the size cap. Returns
/// `None` at end of stream. After an oversize error the stream is
/// mid-line and cannot be resynchronized; callers must close it.
pub fn read_line_capped<R: BufRead>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let bytes_read = reader
        .by_ref()
        .take(max_bytes as u64 + 1)
        .read_until(b'\n', &mut line)?;
    if bytes_read == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    } else if line.len() > max_bytes {
        return Err(GateError::Protocol(format!(
            "Event larger than {} bytes",
            max_bytes
        )));
    }
    Ok(Some(line))
}

pub fn parse_event<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line)
        .map_err(|e| GateError::Protocol(format!("Malformed event: {}", e)))
}

pub fn write_event<W: Write, T: Serialize>(writer: &mut W, event: &T) -> Result<()> {
    let mut line = serde_json::to_vec(event)
        .map_err(|e| GateError::Internal(format!("Event serialization failed: {}", e)))?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()?;
    Ok(())
}
