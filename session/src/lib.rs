//! Live connection to a pixelcanvas.io-style drawing service: endpoint
//! resolution, a reconnecting websocket read loop, status polling and the
//! authentication handshake.

mod client;
mod errors;
pub mod palette;
pub mod wire;

pub use crate::client::{AuthIdentity, SessionClient, SessionConfig, CHUNK_SIZE};
pub use crate::errors::SessionError;
