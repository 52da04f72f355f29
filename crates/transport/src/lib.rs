//! QUIC/HTTP-3 transport engine.
//!
//! Components:
//! - `error`: the transport error taxonomy (`Done` is a backpressure
//!   sentinel, not a failure).
//! - `ticket`: the process-wide lock-free ring of TLS session tickets.
//! - `tls`: rustls client configuration derived from a frozen config object.
//! - `stream`: per-session stream table and the stream state machine.
//! - `engine`: `QuicEngine` / `Session`, a synchronous facade over a
//!   private tokio backend; user code drives progress through `poll`.
//! - `eyeballs`: Happy-Eyeballs racing across protocols and IP families.
//! - `hooks`: pre-handler request gates (CORS).
//! - `stats`: per-connection statistics snapshots.

pub mod engine;
pub mod error;
pub mod eyeballs;
pub mod hooks;
pub mod stats;
pub mod stream;
pub mod ticket;
pub mod tls;

pub use engine::{ConnectOptions, QuicEngine, ResponseView, Session};
pub use error::{TransportError, TransportErrorKind, TransportResult};
pub use eyeballs::{
    IpFamily, NegotiatedProtocol, PreferredFamily, PreferredProtocol, TransportPreference,
};
pub use hooks::{evaluate_cors, CorsOutcome};
pub use stats::SessionStats;
pub use stream::{StreamDirection, StreamPhase};
pub use ticket::{TicketEntry, TicketStore, MAX_TICKET_LEN};
