//! Transport error taxonomy.
//!
//! Every error carries a closed kind, an optional numeric transport code and
//! a human-readable message. quinn's error types are translated here, at the
//! API boundary; codec and policy errors live in their own crates and never
//! pass through this type. `Done` is the one non-error kind: it signals
//! "no more work right now" (send backpressure, empty poll) and callers are
//! expected to retry after a subsequent `poll`.

use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    InvalidStreamState,
    UnknownStream,
    StreamBlocked,
    StreamLimit,
    FinalSize,
    StreamStopped,
    FinExpected,
    InvalidFinState,
    Done,
    CongestionControl,
    TooManyStreams,
    DnsFailure,
    HandshakeFailure,
    TlsTicketRejected,
    Timeout,
    PeerClosed,
}

impl TransportErrorKind {
    /// Stable label, used in logs and surfaced error kinds.
    pub fn label(self) -> &'static str {
        match self {
            Self::InvalidStreamState => "invalid_stream_state",
            Self::UnknownStream => "unknown_stream",
            Self::StreamBlocked => "stream_blocked",
            Self::StreamLimit => "stream_limit",
            Self::FinalSize => "final_size",
            Self::StreamStopped => "stream_stopped",
            Self::FinExpected => "fin_expected",
            Self::InvalidFinState => "invalid_fin_state",
            Self::Done => "done",
            Self::CongestionControl => "congestion_control",
            Self::TooManyStreams => "too_many_streams",
            Self::DnsFailure => "dns_failure",
            Self::HandshakeFailure => "handshake_failure",
            Self::TlsTicketRejected => "tls_ticket_rejected",
            Self::Timeout => "timeout",
            Self::PeerClosed => "peer_closed",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// Peer- or QUIC-level numeric code, when one exists.
    pub code: Option<u64>,
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

pub type TransportResult<T> = Result<T, TransportError>;

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: u64) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Backpressure sentinel. Not a failure: retry after the next `poll`.
    pub fn done() -> Self {
        Self::new(TransportErrorKind::Done, "no more work available right now")
    }

    pub fn is_done(&self) -> bool {
        self.kind == TransportErrorKind::Done
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("operation timed out after {after:?}"),
        )
    }

    pub fn unknown_stream(id: u64) -> Self {
        Self::new(TransportErrorKind::UnknownStream, format!("stream {id} is not known"))
    }

    pub fn invalid_stream_state(id: u64, detail: &str) -> Self {
        Self::new(
            TransportErrorKind::InvalidStreamState,
            format!("stream {id}: {detail}"),
        )
    }

    pub(crate) fn from_connection_error(err: quinn::ConnectionError) -> Self {
        use quinn::ConnectionError::*;
        match err {
            TimedOut => Self::new(TransportErrorKind::Timeout, "connection idle timeout"),
            ApplicationClosed(ref close) => Self::new(
                TransportErrorKind::PeerClosed,
                format!("peer closed the connection: {close}"),
            )
            .with_code(close.error_code.into_inner()),
            ConnectionClosed(ref close) => Self::new(
                TransportErrorKind::PeerClosed,
                format!("connection closed by transport: {close}"),
            ),
            LocallyClosed => Self::new(TransportErrorKind::PeerClosed, "connection closed locally"),
            Reset => Self::new(TransportErrorKind::PeerClosed, "connection reset"),
            VersionMismatch => Self::new(
                TransportErrorKind::HandshakeFailure,
                "no mutually supported QUIC version",
            ),
            TransportError(ref inner) => Self::new(
                TransportErrorKind::HandshakeFailure,
                format!("transport error: {inner}"),
            ),
            CidsExhausted => Self::new(
                TransportErrorKind::TooManyStreams,
                "connection id space exhausted",
            ),
        }
    }

    pub(crate) fn from_write_error(id: u64, err: quinn::WriteError) -> Self {
        use quinn::WriteError::*;
        match err {
            Stopped(code) => Self::new(
                TransportErrorKind::StreamStopped,
                format!("stream {id} stopped by peer"),
            )
            .with_code(code.into_inner()),
            ConnectionLost(inner) => Self::from_connection_error(inner),
            ClosedStream => Self::invalid_stream_state(id, "write on closed stream"),
            ZeroRttRejected => Self::new(
                TransportErrorKind::TlsTicketRejected,
                "0-RTT data rejected by the server",
            ),
        }
    }
}

// The boxed source is not clonable; a clone keeps kind, code and message,
// which is all the stream table stores.
impl Clone for TransportError {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            code: self.code,
            message: self.message.clone(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_is_a_sentinel() {
        let done = TransportError::done();
        assert!(done.is_done());
        assert!(!TransportError::timeout(Duration::from_millis(5)).is_done());
    }

    #[test]
    fn labels_are_unique() {
        use std::collections::HashSet;
        let kinds = [
            TransportErrorKind::InvalidStreamState,
            TransportErrorKind::UnknownStream,
            TransportErrorKind::StreamBlocked,
            TransportErrorKind::StreamLimit,
            TransportErrorKind::FinalSize,
            TransportErrorKind::StreamStopped,
            TransportErrorKind::FinExpected,
            TransportErrorKind::InvalidFinState,
            TransportErrorKind::Done,
            TransportErrorKind::CongestionControl,
            TransportErrorKind::TooManyStreams,
            TransportErrorKind::DnsFailure,
            TransportErrorKind::HandshakeFailure,
            TransportErrorKind::TlsTicketRejected,
            TransportErrorKind::Timeout,
            TransportErrorKind::PeerClosed,
        ];
        let mut seen = HashSet::new();
        for kind in kinds {
            assert!(seen.insert(kind.label()), "duplicate label {}", kind.label());
        }
    }

    #[test]
    fn clone_drops_source_but_keeps_identity() {
        let err = TransportError::new(TransportErrorKind::PeerClosed, "bye")
            .with_code(7)
            .with_source(std::io::Error::new(std::io::ErrorKind::Other, "io"));
        let clone = err.clone();
        assert_eq!(clone.kind, TransportErrorKind::PeerClosed);
        assert_eq!(clone.code, Some(7));
        assert!(clone.source.is_none());
    }
}
