//! Per-connection session state and the registry that routes results
//! back to live sessions.

use crate::crypto::{ChannelKey, Envelope};
use crate::dispatch::MatchResult;
use crate::error::{GateError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub type SessionId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection open, public key not yet pushed.
    Init,
    /// Public key pushed, waiting for the wrapped channel key.
    AwaitingKey,
    /// Channel key installed, frames accepted.
    Secured,
    /// Torn down. Key purged, nothing further honored.
    Closed,
}

/// Crypto state for one connection. Owned exclusively by the handler
/// driving that connection's events.
pub struct Session {
    id: SessionId,
    state: SessionState,
    channel_key: Option<ChannelKey>,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId) -> Self {
        Self {
            id,
            state: SessionState::Init,
            channel_key: None,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_secured(&self) -> bool {
        self.state == SessionState::Secured
    }

    /// Marks the public key as pushed; the next message must be the
    /// wrapped channel key.
    pub fn public_key_sent(&mut self) -> Result<()> {
        if self.state != SessionState::Init {
            return Err(GateError::Protocol(format!(
                "Public key already issued for session {}",
                self.id
            )));
        }
        self.state = SessionState::AwaitingKey;
        Ok(())
    }

    pub fn install_channel_key(&mut self, key: ChannelKey) -> Result<()> {
        if self.state != SessionState::AwaitingKey {
            return Err(GateError::Protocol(format!(
                "Unexpected key exchange in state {:?}",
                self.state
            )));
        }
        self.channel_key = Some(key);
        self.state = SessionState::Secured;
        Ok(())
    }

    /// Decrypts a frame envelope. Refuses before the handshake completes,
    /// without touching the ciphertext.
    pub fn open_envelope(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        if self.state != SessionState::Secured {
            return Err(GateError::Protocol(
                "Frame received before handshake completed".to_string(),
            ));
        }
        match &self.channel_key {
            Some(key) => key.open(envelope),
            None => Err(GateError::Internal(
                "Secured session has no channel key".to_string(),
            )),
        }
    }

    /// Purges the channel key and closes the session. Idempotent.
    pub fn teardown(&mut self) {
        self.channel_key = None;
        self.state = SessionState::Closed;
    }
}

/// Tracks live sessions and delivers match results to them.
///
/// Delivery is at-most-once and best-effort: results for sessions that
/// have closed, or that close mid-delivery, are dropped without error.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, mpsc::Sender<MatchResult>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a session and registers its result channel. The returned
    /// receiver belongs to the connection handler.
    pub fn open_session(&self) -> (Session, mpsc::Receiver<MatchResult>) {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel();
        self.lock().insert(id.clone(), tx);
        tracing::debug!(session = %id, "Session opened");
        (Session::new(id), rx)
    }

    /// Unregisters a session. Results published afterwards are dropped.
    pub fn close_session(&self, id: &str) {
        if self.lock().remove(id).is_some() {
            tracing::debug!(session = %id, "Session closed");
        }
    }

    /// Routes a result to its originating session. Returns whether the
    /// result was handed to a live channel.
    pub fn publish(&self, result: MatchResult) -> bool {
        let mut sessions = self.lock();
        let Some(sender) = sessions.get(&result.session) else {
            tracing::debug!(session = %result.session, "Dropping result for unknown session");
            return false;
        };
        if let Err(mpsc::SendError(result)) = sender.send(result) {
            // Receiver gone: the handler exited without unregistering yet.
            sessions.remove(&result.session);
            tracing::debug!(session = %result.session, "Dropping result for closed session");
            return false;
        }
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, mpsc::Sender<MatchResult>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
