use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Face detection error: {0}")]
    FaceDetection(String),

    #[error("User with uid {0} already enrolled")]
    DuplicateEnrollment(String),

    #[error("Face already enrolled under uid {0}")]
    DuplicateFace(String),

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl GateError {
    /// Stable wire identifier for error events.
    pub fn code(&self) -> &'static str {
        match self {
            GateError::Protocol(_) => "protocol_error",
            GateError::Decryption(_) => "decryption_error",
            GateError::Validation(_) => "validation_error",
            GateError::FaceDetection(_) => "face_detection_error",
            GateError::DuplicateEnrollment(_) => "duplicate_enrollment",
            GateError::DuplicateFace(_) => "duplicate_face",
            GateError::IndexUnavailable(_) => "index_unavailable",
            GateError::Io(_) => "io_error",
            GateError::Internal(_) => "internal_error",
            GateError::Other(_) => "internal_error",
        }
    }
}

pub type Result<T> = std::result::Result<T, GateError>;
