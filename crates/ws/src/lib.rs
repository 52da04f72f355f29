//! WebSocket endpoint.
//!
//! Frame layout per RFC 6455 (`frame`), the HTTP/1.1-style upgrade exchange
//! (`handshake`), and the endpoint state machine (`endpoint`) which runs the
//! same framing over either a TLS/TCP stream or a dedicated QUIC stream of
//! an existing engine session.

pub mod endpoint;
pub mod frame;
pub mod handshake;

pub use endpoint::{WsEndpoint, WsOptions, WsState};
pub use frame::{Frame, FrameDecoder, Opcode};
pub use handshake::accept_key;

use qp_transport::TransportError;

/// Close code used when the peer vanishes without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
/// Largest control-frame payload (RFC 6455 §5.5).
pub const MAX_CONTROL_PAYLOAD: usize = 125;
/// Largest close reason: the two code bytes leave 123 for text.
pub const MAX_CLOSE_REASON: usize = 123;

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame of {got} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { got: usize, limit: usize },

    #[error("connection closed (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("keep-alive pong not received in time")]
    Timeout,

    #[error("operation invalid in state {0:?}")]
    InvalidState(endpoint::WsState),
}
