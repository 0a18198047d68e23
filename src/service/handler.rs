//! Per-connection session handling.
//!
//! Each accepted socket gets its own handler thread plus a reader thread
//! that parses inbound lines into a channel. The handler thread owns the
//! session state and the write half, alternating between inbound events
//! and asynchronous match results until disconnect or idle timeout.

use crate::config::LivenessConfig;
use crate::crypto::{Envelope, ServerKeypair, IV_BYTES};
use crate::credentials::CredentialDirectory;
use crate::dispatch::{JobKind, MatchDispatcher, MatchJob, MatchResult};
use crate::error::{GateError, Result};
use crate::face::LandmarkDetector;
use crate::liveness::{BlinkDetector, LivenessStatus};
use crate::service::protocol::{
    self, ClientEvent, FramePayload, Operation, ResultStatus, ServerEvent,
};
use crate::session::{Session, SessionRegistry, SessionState};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::{BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process-wide collaborators shared by every connection.
pub struct ServerContext {
    pub keypair: ServerKeypair,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: MatchDispatcher,
    pub credentials: Arc<dyn CredentialDirectory>,
    pub landmarks: Arc<dyn LandmarkDetector>,
    pub liveness: LivenessConfig,
    pub idle_timeout: Duration,
    pub max_event_bytes: usize,
}

/// Accept loop. Runs until the listener errors out; each connection is
/// served on its own thread.
pub fn serve(listener: TcpListener, context: Arc<ServerContext>) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "Listening");
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let context = Arc::clone(&context);
                std::thread::spawn(move || {
                    if let Err(e) = handle_connection(stream, context) {
                        tracing::error!(error = %e, "Connection failed");
                    }
                });
            }
            Err(e) => tracing::error!(error = %e, "Accept failed"),
        }
    }
    Ok(())
}

enum Inbound {
    Event(ClientEvent),
    Malformed(GateError),
    Fatal(GateError),
}

enum Flow {
    Continue,
    Close,
}

pub fn handle_connection(stream: TcpStream, context: Arc<ServerContext>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let (session, results) = context.registry.open_session();
    let session_id = session.id().to_string();
    tracing::info!(%peer, session = %session_id, "Connection opened");

    let (inbound_tx, inbound_rx) = mpsc::channel();
    let reader_stream = stream.try_clone()?;
    let max_bytes = context.max_event_bytes;
    let reader =
        std::thread::spawn(move || read_events(reader_stream, max_bytes, inbound_tx));

    let blink = BlinkDetector::new(context.liveness.clone());
    let mut connection = Connection {
        context: Arc::clone(&context),
        session,
        blink,
        liveness_cleared: false,
        writer: stream.try_clone()?,
    };
    let outcome = connection.run(&results, &inbound_rx);

    context.registry.close_session(&session_id);
    connection.session.teardown();
    let _ = stream.shutdown(Shutdown::Both);
    let _ = reader.join();
    tracing::info!(session = %session_id, "Connection closed");
    outcome
}

/// Parses inbound lines off the socket. Blocks on the stream; the
/// handler unblocks it by shutting the socket down.
fn read_events(stream: TcpStream, max_bytes: usize, tx: mpsc::Sender<Inbound>) {
    let mut reader = BufReader::new(stream);
    loop {
        match protocol::read_line_capped(&mut reader, max_bytes) {
            Ok(None) => break,
            Ok(Some(line)) => {
                if line.is_empty() {
                    continue;
                }
                let message = match protocol::parse_event::<ClientEvent>(&line) {
                    Ok(event) => Inbound::Event(event),
                    Err(e) => Inbound::Malformed(e),
                };
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Inbound::Fatal(e));
                break;
            }
        }
    }
}

struct Connection<W: Write> {
    context: Arc<ServerContext>,
    session: Session,
    blink: BlinkDetector,
    liveness_cleared: bool,
    writer: W,
}

impl<W: Write> Connection<W> {
    fn run(
        &mut self,
        results: &mpsc::Receiver<MatchResult>,
        inbound: &mpsc::Receiver<Inbound>,
    ) -> Result<()> {
        self.send(&ServerEvent::ServerPublicKey {
            public_key: self.context.keypair.public_key_pem().to_string(),
        })?;
        self.session.public_key_sent()?;

        let idle_timeout = self.context.idle_timeout;
        let mut last_activity = Instant::now();
        loop {
            while let Ok(result) = results.try_recv() {
                self.send(&ServerEvent::from_match_result(&result))?;
            }
            if last_activity.elapsed() > idle_timeout {
                tracing::info!(session = %self.session.id(), "Idle timeout");
                break;
            }
            match inbound.recv_timeout(POLL_INTERVAL) {
                Ok(Inbound::Event(ClientEvent::Disconnect)) => {
                    tracing::debug!(session = %self.session.id(), "Client disconnect");
                    break;
                }
                Ok(Inbound::Event(event)) => {
                    last_activity = Instant::now();
                    match self.on_event(event)? {
                        Flow::Continue => {}
                        Flow::Close => break,
                    }
                }
                Ok(Inbound::Malformed(e)) => {
                    last_activity = Instant::now();
                    self.report(&e)?;
                }
                Ok(Inbound::Fatal(e)) => {
                    if let GateError::Protocol(_) = &e {
                        self.report(&e)?;
                    } else {
                        tracing::debug!(session = %self.session.id(), error = %e, "Reader failed");
                    }
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn on_event(&mut self, event: ClientEvent) -> Result<Flow> {
        match event {
            ClientEvent::KeyExchange {
                encrypted_symmetric_key,
            } => self.on_key_exchange(&encrypted_symmetric_key),
            ClientEvent::Frame { data, iv } => self.on_frame(&data, &iv),
            ClientEvent::Disconnect => Ok(Flow::Close),
        }
    }

    fn on_key_exchange(&mut self, wrapped: &str) -> Result<Flow> {
        if self.session.state() != SessionState::AwaitingKey {
            let error = GateError::Protocol(
                "Key exchange not allowed in current session state".to_string(),
            );
            self.report(&error)?;
            return Ok(Flow::Continue);
        }
        let blob = match STANDARD.decode(wrapped) {
            Ok(blob) => blob,
            Err(e) => {
                let error = GateError::Decryption(format!("Invalid key blob encoding: {}", e));
                self.report(&error)?;
                return Ok(Flow::Close);
            }
        };
        let key = match self.context.keypair.unwrap_channel_key(&blob) {
            Ok(key) => key,
            Err(e) => {
                self.report(&e)?;
                return Ok(Flow::Close);
            }
        };
        match self.session.install_channel_key(key) {
            Ok(()) => {
                tracing::info!(session = %self.session.id(), "Channel secured");
                self.send(&ServerEvent::KeyExchangeAck {
                    status: "ok".to_string(),
                })?;
                Ok(Flow::Continue)
            }
            Err(e) => {
                self.report(&e)?;
                Ok(Flow::Continue)
            }
        }
    }

    fn on_frame(&mut self, data: &str, iv: &str) -> Result<Flow> {
        // Gate on state before touching any ciphertext.
        if !self.session.is_secured() {
            let error =
                GateError::Protocol("Frame received before key exchange completed".to_string());
            self.report(&error)?;
            return Ok(Flow::Continue);
        }

        let envelope = match decode_envelope(data, iv) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.report(&e)?;
                return Ok(Flow::Close);
            }
        };
        let plaintext = match self.session.open_envelope(&envelope) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(session = %self.session.id(), "Frame decryption failed, closing");
                self.report(&e)?;
                return Ok(Flow::Close);
            }
        };

        // CBC padding can survive a bad key or tamper by chance, so
        // unparseable plaintext counts as a decryption failure.
        let payload: FramePayload = match serde_json::from_slice(&plaintext) {
            Ok(payload) => payload,
            Err(e) => {
                let error = GateError::Decryption(format!("Invalid frame payload: {}", e));
                self.report(&error)?;
                return Ok(Flow::Close);
            }
        };

        // Credential accompanies every frame and is checked every time.
        if !self.context.credentials.is_valid(&payload.credential) {
            let error = GateError::Validation("Invalid credential".to_string());
            self.report(&error)?;
            return Ok(Flow::Continue);
        }

        let image = match payload.image_bytes() {
            Ok(image) => image,
            Err(_) => {
                self.send(&ServerEvent::result(
                    ResultStatus::DecodeError,
                    "Failed to decode image",
                ))?;
                return Ok(Flow::Continue);
            }
        };

        if self.context.liveness.required && !self.liveness_cleared {
            return self.on_liveness_frame(&image);
        }

        let kind = match payload.operation {
            Operation::Identify => JobKind::Identify { image },
            Operation::Enroll => {
                let uid = payload.uid.as_deref().unwrap_or("").trim().to_string();
                if uid.is_empty() {
                    let error = GateError::Validation("Enroll requires a uid".to_string());
                    self.report(&error)?;
                    return Ok(Flow::Continue);
                }
                JobKind::Enroll { image, uid }
            }
        };

        let job = MatchJob::new(self.session.id(), &payload.credential, kind);
        tracing::debug!(session = %self.session.id(), job = %job.id, "Dispatching frame");
        self.context.dispatcher.submit(job);

        // The confirmation is good for exactly one job; the next frame
        // starts a fresh blink challenge.
        if self.context.liveness.required {
            self.liveness_cleared = false;
            self.blink.reset();
        }
        Ok(Flow::Continue)
    }

    fn on_liveness_frame(&mut self, image: &[u8]) -> Result<Flow> {
        let eyes = self.context.landmarks.eye_landmarks(image);
        let event = match self.blink.observe(eyes.as_ref()) {
            LivenessStatus::NoFace => ServerEvent::result(
                ResultStatus::NoFace,
                "No face detected. Please look at the camera.",
            ),
            LivenessStatus::Pending { remaining_secs } => ServerEvent::result(
                ResultStatus::LivenessPending,
                format!("Please blink! Time remaining: {}s", remaining_secs),
            ),
            LivenessStatus::TimedOut => ServerEvent::result(
                ResultStatus::LivenessTimeout,
                "Timeout: No blink detected within time limit",
            ),
            LivenessStatus::BlinkConfirmed => {
                tracing::info!(session = %self.session.id(), "Blink confirmed");
                self.liveness_cleared = true;
                ServerEvent::result(
                    ResultStatus::LivenessConfirmed,
                    "Blink detected! Original human confirmed.",
                )
            }
        };
        self.send(&event)?;
        Ok(Flow::Continue)
    }

    fn report(&mut self, error: &GateError) -> Result<()> {
        tracing::debug!(session = %self.session.id(), code = error.code(), error = %error, "Reporting error");
        self.send(&ServerEvent::error(error))
    }

    fn send(&mut self, event: &ServerEvent) -> Result<()> {
        protocol::write_event(&mut self.writer, event)
    }
}

fn decode_envelope(data: &str, iv: &str) -> Result<Envelope> {
    let data = STANDARD
        .decode(data)
        .map_err(|e| GateError::Decryption(format!("Invalid ciphertext encoding: {}", e)))?;
    let iv = STANDARD
        .decode(iv)
        .map_err(|e| GateError::Decryption(format!("Invalid iv encoding: {}", e)))?;
    let iv: [u8; IV_BYTES] = iv
        .try_into()
        .map_err(|_| GateError::Decryption("Invalid iv length".to_string()))?;
    Ok(Envelope { data, iv })
}
