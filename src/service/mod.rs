pub mod client;
pub mod handler;
pub mod protocol;

pub use client::{GateClient, GateResponse};
pub use handler::{serve, ServerContext};
