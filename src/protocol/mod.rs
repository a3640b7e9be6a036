//! Client for the private photo-library protocol: credential exchange,
//! binary RPC framing, and the fixed numeric endpoints.

pub mod auth;
pub mod client;
pub mod error;
pub mod transport;

pub use auth::{DeviceCredential, TokenCache};
pub use client::ProtocolClient;
pub use error::ProtocolError;
pub use transport::{ByteStream, RpcResponse, StreamResponse, Transport};
