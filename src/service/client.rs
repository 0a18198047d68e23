//! Client side of the gate protocol.
//!
//! Used by the CLI and by integration tests. Performs the key exchange
//! on connect, then seals frame payloads under the negotiated channel
//! key. Liveness challenges are driven by sending successive frames and
//! surfacing the progress events to the caller.

use crate::crypto::{wrap_channel_key, ChannelKey};
use crate::error::{GateError, Result};
use crate::service::protocol::{
    self, ClientEvent, FramePayload, Operation, ResultStatus, ServerEvent, MAX_EVENT_BYTES,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::BufReader;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Terminal outcome of an identify or enroll exchange, or the last
/// liveness progress event if the frame budget ran out first.
#[derive(Debug, Clone)]
pub struct GateResponse {
    pub status: ResultStatus,
    pub message: String,
    pub uid: Option<String>,
}

impl GateResponse {
    pub fn is_liveness_progress(&self) -> bool {
        matches!(
            self.status,
            ResultStatus::LivenessPending
                | ResultStatus::LivenessConfirmed
                | ResultStatus::LivenessTimeout
                | ResultStatus::NoFace
        )
    }
}

pub struct GateClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    key: ChannelKey,
    credential: String,
}

impl GateClient {
    /// Connects and completes the key exchange.
    pub fn connect(addr: impl ToSocketAddrs, credential: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        let mut client = Self {
            reader: BufReader::new(stream.try_clone()?),
            writer: stream,
            key: ChannelKey::generate(),
            credential: credential.to_string(),
        };

        let public_key = match client.next_event()? {
            ServerEvent::ServerPublicKey { public_key } => public_key,
            other => {
                return Err(GateError::Protocol(format!(
                    "Expected server public key, got {:?}",
                    other
                )))
            }
        };
        let wrapped = wrap_channel_key(&public_key, &client.key)?;
        client.write(&ClientEvent::KeyExchange {
            encrypted_symmetric_key: STANDARD.encode(wrapped),
        })?;
        match client.next_event()? {
            ServerEvent::KeyExchangeAck { status } if status == "ok" => Ok(client),
            ServerEvent::Error { code, message } => Err(wire_error(&code, &message)),
            other => Err(GateError::Protocol(format!(
                "Expected key exchange ack, got {:?}",
                other
            ))),
        }
    }

    /// Streams frames until the server returns a match outcome. Frames
    /// consumed by the liveness challenge report progress through the
    /// callback; identify/enroll runs out of frames with the last
    /// progress response if the challenge never completes.
    pub fn identify(
        &mut self,
        frames: &[Vec<u8>],
        on_progress: impl FnMut(&GateResponse),
    ) -> Result<GateResponse> {
        self.run_operation(Operation::Identify, frames, None, on_progress)
    }

    pub fn enroll(
        &mut self,
        frames: &[Vec<u8>],
        uid: &str,
        on_progress: impl FnMut(&GateResponse),
    ) -> Result<GateResponse> {
        self.run_operation(Operation::Enroll, frames, Some(uid), on_progress)
    }

    fn run_operation(
        &mut self,
        operation: Operation,
        frames: &[Vec<u8>],
        uid: Option<&str>,
        mut on_progress: impl FnMut(&GateResponse),
    ) -> Result<GateResponse> {
        if frames.is_empty() {
            return Err(GateError::Validation("No frames to send".to_string()));
        }
        let mut last = None;
        for frame in frames {
            self.send_frame(operation, frame, uid)?;
            let response = self.await_response()?;
            if !response.is_liveness_progress() {
                return Ok(response);
            }
            on_progress(&response);
            last = Some(response);
        }
        // Unreachable None: the loop ran at least once.
        last.ok_or_else(|| GateError::Internal("No response recorded".to_string()))
    }

    /// Encrypts and sends a single frame without reading the reply.
    pub fn send_frame(
        &mut self,
        operation: Operation,
        image: &[u8],
        uid: Option<&str>,
    ) -> Result<()> {
        let payload = FramePayload {
            operation,
            image: STANDARD.encode(image),
            uid: uid.map(str::to_string),
            credential: self.credential.clone(),
        };
        let plaintext = serde_json::to_vec(&payload)
            .map_err(|e| GateError::Internal(format!("Payload serialization failed: {}", e)))?;
        let envelope = self.key.seal(&plaintext)?;
        self.write(&ClientEvent::Frame {
            data: STANDARD.encode(&envelope.data),
            iv: STANDARD.encode(envelope.iv),
        })
    }

    /// Blocks until the next `result` event; error events become errors.
    pub fn await_response(&mut self) -> Result<GateResponse> {
        loop {
            match self.next_event()? {
                ServerEvent::Result {
                    status,
                    message,
                    uid,
                } => {
                    return Ok(GateResponse {
                        status,
                        message,
                        uid,
                    })
                }
                ServerEvent::Error { code, message } => return Err(wire_error(&code, &message)),
                other => {
                    tracing::debug!(event = ?other, "Ignoring out-of-band event");
                }
            }
        }
    }

    fn next_event(&mut self) -> Result<ServerEvent> {
        match protocol::read_line_capped(&mut self.reader, MAX_EVENT_BYTES)? {
            Some(line) => protocol::parse_event(&line),
            None => Err(GateError::Protocol(
                "Connection closed by server".to_string(),
            )),
        }
    }

    fn write(&mut self, event: &ClientEvent) -> Result<()> {
        protocol::write_event(&mut self.writer, event)
    }

    /// Announces the disconnect and closes the socket.
    pub fn close(mut self) {
        let _ = self.write(&ClientEvent::Disconnect);
        let _ = self.writer.shutdown(Shutdown::Both);
    }
}

fn wire_error(code: &str, message: &str) -> GateError {
    match code {
        "protocol_error" => GateError::Protocol(message.to_string()),
        "decryption_error" => GateError::Decryption(message.to_string()),
        "validation_error" => GateError::Validation(message.to_string()),
        "face_detection_error" => GateError::FaceDetection(message.to_string()),
        "index_unavailable" => GateError::IndexUnavailable(message.to_string()),
        _ => GateError::Internal(format!("{} ({})", message, code)),
    }
}
