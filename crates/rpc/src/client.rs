//! The synchronous RPC client.

use std::time::{Duration, Instant};

use tracing::debug;

use qp_transport::{Session, StreamDirection, TransportError, TransportErrorKind};

/// Canonical RPC media type.
pub const CONTENT_TYPE_BINARY_RPC: &str = "application/vnd.binary-rpc";
/// Legacy media type, accepted on responses but never emitted.
pub const CONTENT_TYPE_LEGACY: &str = "application/vnd.quicpro.proto";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a backpressured upload sleeps in `poll` before retrying.
const BACKPRESSURE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("server returned status {status}: {detail}")]
    Server { status: u16, detail: String },

    #[error("response carried unsupported content type '{0}'")]
    ContentType(String),
}

impl RpcError {
    /// Stable kind label for surfaced failures.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Transport(err) => err.kind.label(),
            RpcError::Timeout(_) => "timeout",
            RpcError::Server { .. } => "server_error",
            RpcError::ContentType(_) => "content_type",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub timeout: Duration,
    /// Extra request headers, appended after content-type.
    pub headers: Vec<(String, String)>,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            headers: Vec::new(),
        }
    }
}

impl RpcOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

fn rpc_path(service: &str, method: &str) -> String {
    format!("/{service}/{method}")
}

fn request_headers(opts: &RpcOptions) -> Vec<(String, String)> {
    let mut headers = vec![(
        "content-type".to_string(),
        CONTENT_TYPE_BINARY_RPC.to_string(),
    )];
    headers.extend(opts.headers.iter().cloned());
    headers
}

fn content_type_accepted(headers: &[(String, String)]) -> Result<(), RpcError> {
    let Some((_, value)) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
    else {
        // Absent content type is tolerated; the body is opaque bytes.
        return Ok(());
    };
    let media = value.split(';').next().unwrap_or("").trim();
    if media.eq_ignore_ascii_case(CONTENT_TYPE_BINARY_RPC)
        || media.eq_ignore_ascii_case(CONTENT_TYPE_LEGACY)
    {
        Ok(())
    } else {
        Err(RpcError::ContentType(value.clone()))
    }
}

/// Human-readable failure detail from an error response body.
fn error_detail(body: &[u8]) -> String {
    const MAX_DETAIL: usize = 256;
    let text = String::from_utf8_lossy(body);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        "(no detail)".to_string()
    } else {
        trimmed.chars().take(MAX_DETAIL).collect()
    }
}

fn finish_exchange(
    session: &mut Session,
    stream_id: u64,
    timeout: Duration,
) -> Result<Vec<u8>, RpcError> {
    match session.receive_response(stream_id, timeout) {
        Ok(view) => {
            if !(200..300).contains(&view.status) {
                return Err(RpcError::Server {
                    status: view.status,
                    detail: error_detail(&view.body),
                });
            }
            content_type_accepted(&view.headers)?;
            Ok(view.body)
        }
        Err(err) if err.kind == TransportErrorKind::Timeout => {
            // Cancel both directions; the session itself stays usable.
            let _ = session.cancel_stream(stream_id, StreamDirection::Both);
            Err(RpcError::Timeout(timeout))
        }
        Err(err) => Err(err.into()),
    }
}

/// Unary RPC: send the encoded request body with FIN, then block until the
/// server closes the response stream or the timeout elapses.
pub fn request(
    session: &mut Session,
    service: &str,
    method: &str,
    body: &[u8],
    opts: &RpcOptions,
) -> Result<Vec<u8>, RpcError> {
    let path = rpc_path(service, method);
    let headers = request_headers(opts);
    let stream_id = session.send_request("POST", &path, &headers, Some(body), true)?;
    debug!(
        target: "qp::rpc",
        service,
        method,
        stream = stream_id,
        "rpc dispatched"
    );
    finish_exchange(session, stream_id, opts.timeout)
}

/// Client-streaming RPC in progress. Chunks go out as DATA frames; `Done`
/// backpressure from the transport pauses the push until a `poll` made room.
pub struct UploadStream<'a> {
    session: &'a mut Session,
    stream_id: u64,
    timeout: Duration,
    deadline: Instant,
}

/// Open a client-streaming RPC: headers now, body chunks later.
pub fn upload_stream<'a>(
    session: &'a mut Session,
    service: &str,
    method: &str,
    opts: &RpcOptions,
) -> Result<UploadStream<'a>, RpcError> {
    let path = rpc_path(service, method);
    let headers = request_headers(opts);
    let stream_id = session.send_request("POST", &path, &headers, None, false)?;
    Ok(UploadStream {
        session,
        stream_id,
        timeout: opts.timeout,
        deadline: Instant::now() + opts.timeout,
    })
}

impl UploadStream<'_> {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    fn push_chunk(&mut self, chunk: &[u8], fin: bool) -> Result<(), RpcError> {
        loop {
            match self.session.send_body(self.stream_id, chunk, fin) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_done() => {
                    if Instant::now() >= self.deadline {
                        let _ = self
                            .session
                            .cancel_stream(self.stream_id, StreamDirection::Both);
                        return Err(RpcError::Timeout(self.timeout));
                    }
                    self.session.poll(BACKPRESSURE_POLL)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send one chunk, pausing on transport backpressure.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), RpcError> {
        self.push_chunk(chunk, false)
    }

    /// FIN the request and collect the response.
    pub fn finish(mut self) -> Result<Vec<u8>, RpcError> {
        self.push_chunk(&[], true)?;
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        finish_exchange(self.session, self.stream_id, remaining)
    }

    /// Abort the exchange; the stream is reset in both directions.
    pub fn cancel(self) {
        let _ = self
            .session
            .cancel_stream(self.stream_id, StreamDirection::Both);
    }
}

/// Result of a server-streaming download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub bytes: u64,
}

/// Server-streaming RPC: one request body, then every DATA chunk is handed
/// to `sink` until the server FINs the stream.
pub fn download_stream(
    session: &mut Session,
    service: &str,
    method: &str,
    body: &[u8],
    opts: &RpcOptions,
    mut sink: impl FnMut(&[u8]),
) -> Result<DownloadSummary, RpcError> {
    let path = rpc_path(service, method);
    let headers = request_headers(opts);
    let stream_id = session.send_request("POST", &path, &headers, Some(body), true)?;

    let deadline = Instant::now() + opts.timeout;
    let mut response: Option<(u16, Vec<(String, String)>)> = None;
    let mut bytes = 0u64;

    loop {
        if response.is_none() {
            response = session.response_headers(stream_id)?;
            if let Some((status, headers)) = &response {
                if !(200..300).contains(status) {
                    // Collect the error body and fail like the unary path.
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let view = session.receive_response(stream_id, remaining)?;
                    return Err(RpcError::Server {
                        status: view.status,
                        detail: error_detail(&view.body),
                    });
                }
                content_type_accepted(headers)?;
            }
        }

        match session.read_body(stream_id) {
            Ok(Some(chunk)) => {
                bytes += chunk.len() as u64;
                sink(&chunk);
            }
            Ok(None) => {
                let (status, headers) = response.unwrap_or((0, Vec::new()));
                return Ok(DownloadSummary {
                    status,
                    headers,
                    bytes,
                });
            }
            Err(err) if err.is_done() => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    let _ = session.cancel_stream(stream_id, StreamDirection::Both);
                    return Err(RpcError::Timeout(opts.timeout));
                }
                session.poll(remaining)?;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
