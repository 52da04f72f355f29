//! The WebSocket endpoint state machine.
//!
//! CONNECTING → OPEN → CLOSING → CLOSED. One endpoint wraps either a
//! TLS/TCP stream (HTTP/1.1 upgrade) or a dedicated bidirectional stream of
//! an existing QUIC session (same upgrade exchange on the stream); framing
//! is identical on both. The endpoint is a synchronous facade like the
//! engine's sessions: reads run on a private runtime with explicit
//! deadlines, `receive(-1)` blocks, `receive(0)` returns immediately.
//!
//! Keep-alive: a ping goes out after `ping_interval` of send/receive
//! silence; a pong missing for longer than `pong_timeout` closes the
//! endpoint with a timeout error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tracing::debug;

use qp_config::ConfigObject;
use qp_transport::{tls::build_client_tls, Session, TransportError};

use crate::frame::{encode_frame, Frame, FrameDecoder, Opcode};
use crate::handshake::{build_upgrade_request, generate_client_key, verify_upgrade_response};
use crate::{WsError, CLOSE_ABNORMAL, MAX_CLOSE_REASON, MAX_CONTROL_PAYLOAD};

/// Cadence of keep-alive bookkeeping while blocked in `receive(-1)`.
const KEEPALIVE_TICK: Duration = Duration::from_secs(1);

/// Window granted to the peer for its close echo.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsState {
    Connecting,
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub max_frame_bytes: usize,
    pub connect_timeout: Duration,
    /// TLS settings for `wss://` targets; engine defaults when absent.
    pub tls: Option<Arc<ConfigObject>>,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_frame_bytes: 1024 * 1024,
            connect_timeout: Duration::from_secs(10),
            tls: None,
        }
    }
}

trait AsyncRw: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncRw for T {}

enum ReadOutcome {
    Data,
    TimedOut,
    Eof,
}

pub struct WsEndpoint {
    runtime: Arc<Runtime>,
    stream: Box<dyn AsyncRw>,
    state: WsState,
    decoder: FrameDecoder,
    fragments: Option<(Opcode, Vec<u8>)>,
    ping_interval: Duration,
    pong_timeout: Duration,
    max_message_bytes: usize,
    last_traffic: Instant,
    awaiting_pong: Option<Instant>,
    peer_close: Option<(u16, String)>,
}

/// `ws://` / `wss://` target split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WsUrl {
    secure: bool,
    host: String,
    port: u16,
    path: String,
}

fn parse_ws_url(url: &str) -> Result<WsUrl, WsError> {
    let (secure, rest) = if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else {
        return Err(WsError::Handshake(format!(
            "url '{url}' must use the ws:// or wss:// scheme"
        )));
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(WsError::Handshake(format!("url '{url}' names no host")));
    }

    let default_port = if secure { 443 } else { 80 };
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal, optionally followed by :port.
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| WsError::Handshake(format!("unterminated '[' in '{url}'")))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => port
                .parse()
                .map_err(|_| WsError::Handshake(format!("invalid port in '{url}'")))?,
            None => default_port,
        };
        (host.to_string(), port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| WsError::Handshake(format!("invalid port in '{url}'")))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), default_port),
        }
    };

    Ok(WsUrl {
        secure,
        host,
        port,
        path,
    })
}

impl WsEndpoint {
    /// Connect over TCP (and TLS for `wss://`), then upgrade.
    pub fn connect(
        url: &str,
        headers: &[(String, String)],
        opts: WsOptions,
    ) -> Result<Self, WsError> {
        let target = parse_ws_url(url)?;
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?,
        );

        let stream: Box<dyn AsyncRw> = {
            let target = target.clone();
            let tls_config = opts.tls.clone();
            let connect_timeout = opts.connect_timeout;
            runtime.block_on(async move {
                let tcp = tokio::time::timeout(
                    connect_timeout,
                    TcpStream::connect((target.host.as_str(), target.port)),
                )
                .await
                .map_err(|_| WsError::Transport(TransportError::timeout(connect_timeout)))??;

                if target.secure {
                    let config = tls_config.unwrap_or_else(|| Arc::new(ConfigObject::defaults()));
                    let mut tls = build_client_tls(&config)?;
                    tls.alpn_protocols = vec![b"http/1.1".to_vec()];
                    let server_name = rustls::pki_types::ServerName::try_from(
                        target.host.clone(),
                    )
                    .map_err(|_| {
                        WsError::Handshake(format!("'{}' is not a valid server name", target.host))
                    })?;
                    let connector =
                        tokio_rustls::TlsConnector::from(Arc::new(tls));
                    let stream = connector.connect(server_name, tcp).await?;
                    Ok::<Box<dyn AsyncRw>, WsError>(Box::new(stream))
                } else {
                    Ok(Box::new(tcp))
                }
            })?
        };

        let mut endpoint = Self::from_stream(runtime, stream, &opts);
        endpoint.upgrade(&target.host, &target.path, headers, opts.connect_timeout)?;
        Ok(endpoint)
    }

    /// Upgrade on a dedicated stream of an existing QUIC session.
    pub fn connect_over_quic(
        session: &mut Session,
        path: &str,
        headers: &[(String, String)],
        opts: WsOptions,
    ) -> Result<Self, WsError> {
        let host = session.host().to_string();
        let runtime = session.runtime();
        let (send, recv) = session.open_raw_stream()?;
        let stream: Box<dyn AsyncRw> = Box::new(tokio::io::join(recv, send));

        let mut endpoint = Self::from_stream(runtime, stream, &opts);
        endpoint.upgrade(&host, path, headers, opts.connect_timeout)?;
        Ok(endpoint)
    }

    fn from_stream(runtime: Arc<Runtime>, stream: Box<dyn AsyncRw>, opts: &WsOptions) -> Self {
        Self {
            runtime,
            stream,
            state: WsState::Connecting,
            decoder: FrameDecoder::new(opts.max_frame_bytes),
            fragments: None,
            ping_interval: opts.ping_interval,
            pong_timeout: opts.pong_timeout,
            max_message_bytes: opts.max_frame_bytes,
            last_traffic: Instant::now(),
            awaiting_pong: None,
            peer_close: None,
        }
    }

    fn upgrade(
        &mut self,
        host: &str,
        path: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<(), WsError> {
        let client_key = generate_client_key();
        let request = build_upgrade_request(host, path, &client_key, headers);

        let runtime = Arc::clone(&self.runtime);
        let stream = &mut self.stream;
        let head = runtime.block_on(async {
            tokio::time::timeout(timeout, async {
                stream.write_all(request.as_bytes()).await?;
                stream.flush().await?;

                // Read until the end of the response head; whatever follows
                // belongs to the frame layer.
                let mut head = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    let n = stream.read(&mut byte).await?;
                    if n == 0 {
                        return Err(WsError::Handshake(
                            "connection closed during upgrade".into(),
                        ));
                    }
                    head.push(byte[0]);
                    if head.ends_with(b"\r\n\r\n") {
                        head.truncate(head.len() - 4);
                        break;
                    }
                    if head.len() > 16 * 1024 {
                        return Err(WsError::Handshake("response head too large".into()));
                    }
                }
                Ok(head)
            })
            .await
            .map_err(|_| WsError::Transport(TransportError::timeout(timeout)))?
        })?;

        let head = String::from_utf8_lossy(&head).into_owned();
        verify_upgrade_response(&head, &client_key)?;

        self.state = WsState::Open;
        self.last_traffic = Instant::now();
        debug!(target: "qp::ws", host, path, "websocket open");
        Ok(())
    }

    pub fn status(&self) -> WsState {
        self.state
    }

    fn write_frame(&mut self, opcode: Opcode, payload: &[u8], fin: bool) -> Result<(), WsError> {
        let mut encoded = Vec::with_capacity(payload.len() + 14);
        // Clients mask every frame.
        encode_frame(&mut encoded, opcode, payload, fin, Some(rand::random()))?;

        let runtime = Arc::clone(&self.runtime);
        let stream = &mut self.stream;
        runtime.block_on(async {
            stream.write_all(&encoded).await?;
            stream.flush().await?;
            Ok::<(), std::io::Error>(())
        })?;
        self.last_traffic = Instant::now();
        Ok(())
    }

    /// Send one message.
    pub fn send(&mut self, payload: &[u8], is_binary: bool) -> Result<(), WsError> {
        if self.state != WsState::Open {
            return Err(WsError::InvalidState(self.state));
        }
        let opcode = if is_binary {
            Opcode::Binary
        } else {
            Opcode::Text
        };
        self.write_frame(opcode, payload, true)
    }

    /// Send a ping and start the pong clock.
    pub fn ping(&mut self, payload: &[u8]) -> Result<(), WsError> {
        if self.state != WsState::Open {
            return Err(WsError::InvalidState(self.state));
        }
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WsError::Protocol(format!(
                "ping payload of {} bytes exceeds {MAX_CONTROL_PAYLOAD}",
                payload.len()
            )));
        }
        self.write_frame(Opcode::Ping, payload, true)?;
        self.awaiting_pong.get_or_insert_with(Instant::now);
        Ok(())
    }

    fn maintain_keepalive(&mut self) -> Result<(), WsError> {
        if self.state != WsState::Open {
            return Ok(());
        }
        if let Some(since) = self.awaiting_pong {
            if since.elapsed() > self.pong_timeout {
                self.state = WsState::Closed;
                return Err(WsError::Timeout);
            }
        } else if !self.ping_interval.is_zero()
            && self.last_traffic.elapsed() >= self.ping_interval
        {
            self.write_frame(Opcode::Ping, &[], true)?;
            self.awaiting_pong = Some(Instant::now());
        }
        Ok(())
    }

    fn read_some(&mut self, wait: Duration) -> Result<ReadOutcome, WsError> {
        let runtime = Arc::clone(&self.runtime);
        let stream = &mut self.stream;
        let mut chunk = [0u8; 4096];
        let read = runtime
            .block_on(async { tokio::time::timeout(wait, stream.read(&mut chunk)).await });
        match read {
            Ok(Ok(0)) => Ok(ReadOutcome::Eof),
            Ok(Ok(n)) => {
                self.decoder.push_bytes(&chunk[..n]);
                Ok(ReadOutcome::Data)
            }
            Ok(Err(err)) => Err(err.into()),
            Err(_elapsed) => Ok(ReadOutcome::TimedOut),
        }
    }

    /// Process one frame. `Ok(Some(..))` is a complete message for the
    /// caller; control frames and fragments return `Ok(None)`.
    fn handle_frame(&mut self, frame: Frame) -> Result<Option<Vec<u8>>, WsError> {
        self.last_traffic = Instant::now();
        match frame.opcode {
            Opcode::Ping => {
                if self.state == WsState::Open {
                    self.write_frame(Opcode::Pong, &frame.payload, true)?;
                }
                Ok(None)
            }
            Opcode::Pong => {
                self.awaiting_pong = None;
                Ok(None)
            }
            Opcode::Close => {
                let (code, reason) = Frame::parse_close(&frame.payload);
                self.peer_close = Some((code, reason));
                if self.state == WsState::Open {
                    // Echo the close before going down.
                    let payload = Frame::close_payload(code, "");
                    let _ = self.write_frame(Opcode::Close, &payload, true);
                }
                self.state = WsState::Closed;
                Ok(None)
            }
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    return Err(WsError::Protocol(
                        "new data frame while a fragmented message is pending".into(),
                    ));
                }
                if frame.fin {
                    Ok(Some(frame.payload))
                } else {
                    self.fragments = Some((frame.opcode, frame.payload));
                    Ok(None)
                }
            }
            Opcode::Continuation => {
                let Some((opcode, mut assembled)) = self.fragments.take() else {
                    return Err(WsError::Protocol(
                        "continuation frame without a pending message".into(),
                    ));
                };
                assembled.extend_from_slice(&frame.payload);
                // Assembled messages share the single-frame limit.
                if assembled.len() > self.max_message_bytes {
                    return Err(WsError::FrameTooLarge {
                        got: assembled.len(),
                        limit: self.max_message_bytes,
                    });
                }
                if frame.fin {
                    Ok(Some(assembled))
                } else {
                    self.fragments = Some((opcode, assembled));
                    Ok(None)
                }
            }
        }
    }

    /// Receive one message. `timeout_ms < 0` blocks, `0` returns
    /// immediately, otherwise waits up to the given duration. `Ok(None)`
    /// means nothing arrived in time.
    pub fn receive(&mut self, timeout_ms: i64) -> Result<Option<Vec<u8>>, WsError> {
        if self.state == WsState::Closed {
            let (code, reason) = self
                .peer_close
                .clone()
                .unwrap_or((CLOSE_ABNORMAL, "closed".into()));
            return Err(WsError::Closed { code, reason });
        }

        let deadline = match timeout_ms {
            t if t < 0 => None,
            t => Some(Instant::now() + Duration::from_millis(t as u64)),
        };

        loop {
            self.maintain_keepalive()?;

            while let Some(frame) = self.decoder.next_frame()? {
                if let Some(message) = self.handle_frame(frame)? {
                    return Ok(Some(message));
                }
                if self.state == WsState::Closed {
                    let (code, reason) = self
                        .peer_close
                        .clone()
                        .unwrap_or((CLOSE_ABNORMAL, String::new()));
                    return Err(WsError::Closed { code, reason });
                }
            }

            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    remaining.min(KEEPALIVE_TICK)
                }
                None => KEEPALIVE_TICK,
            };

            match self.read_some(wait)? {
                ReadOutcome::Data => continue,
                ReadOutcome::TimedOut => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(None);
                        }
                    }
                }
                ReadOutcome::Eof => {
                    self.state = WsState::Closed;
                    return Err(WsError::Closed {
                        code: CLOSE_ABNORMAL,
                        reason: "connection lost".into(),
                    });
                }
            }
        }
    }

    /// Close the endpoint, waiting briefly for the peer's echo.
    pub fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        if reason.len() > MAX_CLOSE_REASON {
            return Err(WsError::Protocol(format!(
                "close reason of {} bytes exceeds {MAX_CLOSE_REASON}",
                reason.len()
            )));
        }
        match self.state {
            WsState::Closed | WsState::Closing => return Ok(()),
            WsState::Connecting => {
                self.state = WsState::Closed;
                return Ok(());
            }
            WsState::Open => {}
        }

        let payload = Frame::close_payload(code, reason);
        self.write_frame(Opcode::Close, &payload, true)?;
        self.state = WsState::Closing;

        // Grace period for the peer's close echo; a silent peer still ends
        // up closed.
        let deadline = Instant::now() + CLOSE_GRACE;
        while self.state == WsState::Closing && Instant::now() < deadline {
            while let Some(frame) = self.decoder.next_frame()? {
                if frame.opcode == Opcode::Close {
                    self.peer_close = Some(Frame::parse_close(&frame.payload));
                    self.state = WsState::Closed;
                    break;
                }
            }
            if self.state == WsState::Closed {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_some(remaining)? {
                ReadOutcome::Data => continue,
                ReadOutcome::TimedOut | ReadOutcome::Eof => break,
            }
        }
        self.state = WsState::Closed;
        Ok(())
    }
}

impl std::fmt::Debug for WsEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsEndpoint")
            .field("state", &self.state)
            .field("buffered", &self.decoder.buffered_len())
            .field("awaiting_pong", &self.awaiting_pong.is_some())
            .finish()
    }
}
