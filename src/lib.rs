// Core modules
pub mod audit;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod face;
pub mod liveness;
pub mod service;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{DispatchContext, JobKind, MatchDispatcher, MatchJob, MatchResult, MatchStatus};
pub use error::{GateError, Result};
pub use face::{Embedding, EmbeddingExtractor, LandmarkDetector};
pub use service::{GateClient, GateResponse, ServerContext};
pub use session::{Session, SessionRegistry};
pub use storage::VectorIndexStore;
