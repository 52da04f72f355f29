//! The QUIC/H3 session engine.
//!
//! `QuicEngine` owns a private tokio runtime. `connect` races attempts per
//! the Happy-Eyeballs plan and returns a `Session`: a synchronous facade
//! whose async backend (h3 driver task plus one task per request stream)
//! feeds a single event channel. User code drives progress by calling
//! `poll`, which drains ready events into the per-session stream table:
//! one cooperative iteration per call, deadline capped by the connection's
//! idle budget. Per-stream event order is arrival order; ordering across
//! streams is unspecified.
//!
//! Backpressure: `send_body` signals `Done` when the stream's command queue
//! is full; callers retry after a subsequent `poll`. `Done` is never a
//! failure.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use quinn::crypto::rustls::QuicClientConfig;
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use qp_config::{CcAlgorithm, ConfigObject};

use crate::error::{TransportError, TransportErrorKind, TransportResult};
use crate::eyeballs::{
    self, build_attempt_plan, Attempt, IpFamily, NegotiatedProtocol, TransportPreference,
};
use crate::stats::{self, SessionStats};
use crate::stream::{StreamDirection, StreamTable};
use crate::ticket::{TicketStore, MAX_TICKET_LEN};
use crate::tls::build_client_tls;

/// Capacity of each per-stream command queue. A full queue is surfaced to
/// the caller as `Done`.
const STREAM_COMMAND_QUEUE: usize = 32;

type H3SendRequest = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// Options for a single `connect` call.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub preference: TransportPreference,
    /// `SO_BINDTODEVICE`-style binding for the UDP socket (Linux only).
    pub bind_device: Option<String>,
    /// Resumption blob to seed the session buffer and the ticket ring with
    /// before the handshake starts.
    pub session_ticket: Option<Vec<u8>>,
    /// Reason string sent with the connection close frame.
    pub close_reason: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            preference: TransportPreference::default(),
            bind_device: None,
            session_ticket: None,
            close_reason: "client shutdown".into(),
        }
    }
}

/// A completed response for one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseView {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Events flowing from the async backend into the session.
#[derive(Debug)]
pub(crate) enum BackendEvent {
    Headers {
        stream: u64,
        status: u16,
        headers: Vec<(String, String)>,
    },
    Data {
        stream: u64,
        chunk: Bytes,
    },
    Finished {
        stream: u64,
    },
    StreamFailed {
        stream: u64,
        error: TransportError,
    },
    ConnectionLost {
        error: TransportError,
    },
}

/// Commands sent to a request task.
#[derive(Debug)]
enum StreamCommand {
    SendChunk { data: Bytes, fin: bool },
    Finish,
    CancelRead,
    CancelWrite,
    CancelBoth,
}

pub struct QuicEngine {
    runtime: Arc<Runtime>,
}

impl QuicEngine {
    pub fn new() -> TransportResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                TransportError::new(
                    TransportErrorKind::HandshakeFailure,
                    format!("failed to build engine runtime: {err}"),
                )
                .with_source(err)
            })?;
        Ok(Self {
            runtime: Arc::new(runtime),
        })
    }

    /// Resolve, race and attach. On success the config freezes (first
    /// attachment) and the session owns the winning transport; every losing
    /// attempt has been torn down before this returns.
    pub fn connect(
        &self,
        host: &str,
        port: u16,
        config: Arc<ConfigObject>,
        options: ConnectOptions,
    ) -> TransportResult<Session> {
        config.freeze();

        if let Some(ticket) = &options.session_ticket {
            if ticket.len() > MAX_TICKET_LEN {
                return Err(TransportError::new(
                    TransportErrorKind::TlsTicketRejected,
                    format!("session ticket of {} bytes exceeds {MAX_TICKET_LEN}", ticket.len()),
                ));
            }
            // Publish before the race so sibling sessions can resume too.
            TicketStore::global().put(ticket)?;
        }

        let runtime = Arc::clone(&self.runtime);
        let host_owned = host.to_string();
        let config_clone = Arc::clone(&config);
        let options_clone = options.clone();
        let raced = runtime.block_on(async move {
            race_connect(&host_owned, port, &config_clone, &options_clone).await
        })?;

        let mut scid = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut scid[..]);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut session = Session {
            runtime: Arc::clone(&self.runtime),
            config,
            host: host.to_string(),
            scid,
            close_reason: options.close_reason,
            remote: raced.addr(),
            family: IpFamily::of(&raced.addr()),
            protocol: raced.protocol(),
            endpoint: None,
            connection: None,
            send_request: None,
            driver: None,
            fallback_stream: None,
            events_tx,
            events_rx,
            streams: StreamTable::new(),
            commands: std::collections::HashMap::new(),
            ticket: [0u8; MAX_TICKET_LEN],
            ticket_len: 0,
            ticket_epoch: 0,
            stats: SessionStats::default(),
            last_activity: Instant::now(),
            conn_error: None,
            closed: false,
        };

        match raced {
            RacedConnection::H3 {
                endpoint,
                connection,
                ..
            } => {
                let (send_request, driver) = session.attach_h3(connection.clone())?;
                session.endpoint = Some(endpoint);
                session.connection = Some(connection);
                session.send_request = Some(send_request);
                session.driver = Some(driver);
            }
            RacedConnection::Tcp { stream, .. } => {
                session.fallback_stream = Some(stream);
            }
        }

        session.refresh_ticket_buffer();
        debug!(
            target: "qp::transport::engine",
            host = %session.host,
            remote = %session.remote,
            protocol = session.protocol.label(),
            "session established"
        );
        Ok(session)
    }
}

/// Winner of the Happy-Eyeballs race.
enum RacedConnection {
    H3 {
        endpoint: quinn::Endpoint,
        connection: quinn::Connection,
        addr: SocketAddr,
    },
    Tcp {
        stream: TlsStream<TcpStream>,
        protocol: NegotiatedProtocol,
        addr: SocketAddr,
    },
}

impl RacedConnection {
    fn addr(&self) -> SocketAddr {
        match self {
            RacedConnection::H3 { addr, .. } | RacedConnection::Tcp { addr, .. } => *addr,
        }
    }

    fn protocol(&self) -> NegotiatedProtocol {
        match self {
            RacedConnection::H3 { .. } => NegotiatedProtocol::H3,
            RacedConnection::Tcp { protocol, .. } => *protocol,
        }
    }
}

async fn race_connect(
    host: &str,
    port: u16,
    config: &ConfigObject,
    options: &ConnectOptions,
) -> TransportResult<RacedConnection> {
    let addrs = eyeballs::resolve(host, port).await?;
    let plan = build_attempt_plan(&addrs, &options.preference);
    if plan.is_empty() {
        return Err(TransportError::new(
            TransportErrorKind::DnsFailure,
            format!("no usable addresses for '{host}' under the configured preference"),
        ));
    }

    let tls = build_client_tls(config)?;
    let (winner_tx, mut winner_rx) = mpsc::channel::<TransportResult<RacedConnection>>(plan.len());

    let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(plan.len());
    for attempt in plan {
        let winner_tx = winner_tx.clone();
        let tls = tls.clone();
        let host = host.to_string();
        let config = config_snapshot(config);
        let bind_device = options.bind_device.clone();
        tasks.push(tokio::spawn(async move {
            if !attempt.delay.is_zero() {
                tokio::time::sleep(attempt.delay).await;
            }
            let result = run_attempt(&attempt, &host, tls, &config, bind_device.as_deref()).await;
            let _ = winner_tx.send(result).await;
        }));
    }
    drop(winner_tx);

    let mut last_error: Option<TransportError> = None;
    let winner = loop {
        match winner_rx.recv().await {
            Some(Ok(winner)) => break Some(winner),
            Some(Err(err)) => {
                debug!(target: "qp::transport::engine", error = %err, "attempt failed");
                last_error = Some(err);
            }
            None => break None,
        }
    };

    // Tear losers down promptly: no handshake may continue (and no loser may
    // publish TLS state) once a winner exists.
    for task in &tasks {
        task.abort();
    }

    match winner {
        Some(winner) => Ok(winner),
        None => Err(last_error.unwrap_or_else(|| {
            TransportError::new(
                TransportErrorKind::HandshakeFailure,
                format!("every connection attempt to '{host}' failed"),
            )
        })),
    }
}

/// The subset of transport parameters an attempt task needs, detached from
/// the shared config object.
#[derive(Clone)]
struct AttemptConfig {
    idle_timeout: Duration,
    max_udp_payload_size: u16,
    initial_max_data: u64,
    initial_max_streams_bidi: u64,
    initial_max_streams_uni: u64,
    initial_max_stream_data: u64,
    enable_datagrams: bool,
    dgram_recv_queue_len: usize,
    dgram_send_queue_len: usize,
    cc_algorithm: CcAlgorithm,
}

fn config_snapshot(config: &ConfigObject) -> AttemptConfig {
    AttemptConfig {
        idle_timeout: config.quic.max_idle_timeout,
        max_udp_payload_size: config.quic.max_udp_payload_size,
        initial_max_data: config.quic.initial_max_data,
        initial_max_streams_bidi: config.quic.initial_max_streams_bidi,
        initial_max_streams_uni: config.quic.initial_max_streams_uni,
        initial_max_stream_data: config.quic.initial_max_stream_data_bidi_local,
        enable_datagrams: config.quic.enable_datagrams,
        dgram_recv_queue_len: config.quic.dgram_recv_queue_len,
        dgram_send_queue_len: config.quic.dgram_send_queue_len,
        cc_algorithm: config.cc.algorithm,
    }
}

async fn run_attempt(
    attempt: &Attempt,
    host: &str,
    tls: rustls::ClientConfig,
    config: &AttemptConfig,
    bind_device: Option<&str>,
) -> TransportResult<RacedConnection> {
    match attempt.protocol {
        NegotiatedProtocol::H3 => connect_h3(attempt.addr, host, tls, config, bind_device).await,
        protocol => {
            let stream = eyeballs::connect_tcp_tls(attempt.addr, host, tls, protocol).await?;
            Ok(RacedConnection::Tcp {
                stream,
                protocol,
                addr: attempt.addr,
            })
        }
    }
}

fn bind_udp(family: IpFamily, bind_device: Option<&str>) -> TransportResult<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = match family {
        IpFamily::V4 => Domain::IPV4,
        IpFamily::V6 => Domain::IPV6,
    };
    let io_error = |context: &str, err: std::io::Error| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("{context}: {err}"),
        )
        .with_source(err)
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|err| io_error("udp socket", err))?;
    socket
        .set_nonblocking(true)
        .map_err(|err| io_error("set nonblocking", err))?;

    #[cfg(target_os = "linux")]
    if let Some(device) = bind_device {
        socket
            .bind_device(Some(device.as_bytes()))
            .map_err(|err| io_error("bind to device", err))?;
    }
    #[cfg(not(target_os = "linux"))]
    if bind_device.is_some() {
        tracing::warn!(
            target: "qp::transport::engine",
            "bind-to-device is only supported on linux; ignoring"
        );
    }

    let local: SocketAddr = match family {
        IpFamily::V4 => "0.0.0.0:0".parse().expect("literal addr"),
        IpFamily::V6 => "[::]:0".parse().expect("literal addr"),
    };
    socket
        .bind(&local.into())
        .map_err(|err| io_error("bind udp socket", err))?;
    Ok(socket.into())
}

fn build_transport_config(config: &AttemptConfig) -> TransportResult<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();

    let idle = quinn::IdleTimeout::try_from(config.idle_timeout).map_err(|_| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            "idle timeout exceeds the representable range",
        )
    })?;
    transport.max_idle_timeout(Some(idle));
    transport.initial_mtu(config.max_udp_payload_size);
    transport.max_concurrent_bidi_streams(quinn::VarInt::from_u32(
        config.initial_max_streams_bidi.min(u32::MAX as u64) as u32,
    ));
    transport.max_concurrent_uni_streams(quinn::VarInt::from_u32(
        config.initial_max_streams_uni.min(u32::MAX as u64) as u32,
    ));
    transport.receive_window(quinn::VarInt::from_u32(
        config.initial_max_data.min(u32::MAX as u64) as u32,
    ));
    transport.stream_receive_window(quinn::VarInt::from_u32(
        config.initial_max_stream_data.min(u32::MAX as u64) as u32,
    ));
    if config.enable_datagrams {
        transport.datagram_receive_buffer_size(Some(
            config.dgram_recv_queue_len * config.max_udp_payload_size as usize,
        ));
        transport.datagram_send_buffer_size(
            config.dgram_send_queue_len * config.max_udp_payload_size as usize,
        );
    } else {
        transport.datagram_receive_buffer_size(None);
    }

    match config.cc_algorithm {
        CcAlgorithm::Cubic => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::CubicConfig::default(),
            ));
        }
        CcAlgorithm::Reno => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::NewRenoConfig::default(),
            ));
        }
        CcAlgorithm::Bbr => {
            transport.congestion_controller_factory(Arc::new(
                quinn::congestion::BbrConfig::default(),
            ));
        }
    }

    Ok(transport)
}

async fn connect_h3(
    addr: SocketAddr,
    host: &str,
    tls: rustls::ClientConfig,
    config: &AttemptConfig,
    bind_device: Option<&str>,
) -> TransportResult<RacedConnection> {
    let socket = bind_udp(IpFamily::of(&addr), bind_device)?;
    let mut endpoint = quinn::Endpoint::new(
        quinn::EndpointConfig::default(),
        None,
        socket,
        Arc::new(quinn::TokioRuntime),
    )
    .map_err(|err| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("endpoint setup: {err}"),
        )
        .with_source(err)
    })?;

    let crypto = QuicClientConfig::try_from(Arc::new(tls)).map_err(|_| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            "tls config is not usable for QUIC (TLS 1.3 required)",
        )
    })?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(build_transport_config(config)?));
    endpoint.set_default_client_config(client_config);

    let connecting = endpoint.connect(addr, host).map_err(|err| {
        TransportError::new(
            TransportErrorKind::HandshakeFailure,
            format!("connect {addr}: {err}"),
        )
        .with_source(err)
    })?;
    match connecting.await {
        Ok(connection) => Ok(RacedConnection::H3 {
            endpoint,
            connection,
            addr,
        }),
        Err(err) => {
            // Release the endpoint before reporting; a failed handshake must
            // not leak its socket into the race.
            endpoint.close(quinn::VarInt::from_u32(0), b"handshake failed");
            Err(TransportError::from_connection_error(err))
        }
    }
}

pub struct Session {
    runtime: Arc<Runtime>,
    config: Arc<ConfigObject>,
    host: String,
    scid: [u8; 16],
    close_reason: String,
    remote: SocketAddr,
    family: IpFamily,
    protocol: NegotiatedProtocol,
    endpoint: Option<quinn::Endpoint>,
    connection: Option<quinn::Connection>,
    send_request: Option<H3SendRequest>,
    driver: Option<JoinHandle<()>>,
    /// TLS/TCP stream held when the H2/H1 leg won the race; consumed by the
    /// fallback client or a WebSocket upgrade.
    fallback_stream: Option<TlsStream<TcpStream>>,
    events_tx: mpsc::UnboundedSender<BackendEvent>,
    events_rx: mpsc::UnboundedReceiver<BackendEvent>,
    streams: StreamTable,
    commands: std::collections::HashMap<u64, mpsc::Sender<StreamCommand>>,
    ticket: [u8; MAX_TICKET_LEN],
    ticket_len: usize,
    ticket_epoch: u64,
    stats: SessionStats,
    last_activity: Instant,
    conn_error: Option<TransportError>,
    closed: bool,
}

impl Session {
    /// `socket ≥ 0 ⇔ alive`: the session is alive while it still owns its
    /// transport.
    pub fn is_alive(&self) -> bool {
        !self.closed && (self.endpoint.is_some() || self.fallback_stream.is_some())
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn protocol(&self) -> NegotiatedProtocol {
        self.protocol
    }

    pub fn ip_family(&self) -> IpFamily {
        self.family
    }

    pub fn source_connection_id(&self) -> &[u8; 16] {
        &self.scid
    }

    pub fn config(&self) -> &Arc<ConfigObject> {
        &self.config
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.clone()
    }

    /// Take the TLS/TCP stream of a fallback (H2/H1) session. The HTTP/1.1
    /// fallback client and the WebSocket endpoint consume it.
    pub fn take_fallback_stream(&mut self) -> Option<TlsStream<TcpStream>> {
        self.fallback_stream.take()
    }

    /// Runtime handle for endpoints layered on this session (WebSocket
    /// upgrades, fallback clients).
    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.runtime)
    }

    /// Open a raw bidirectional QUIC stream on this session. Used by the
    /// WebSocket upgrade path.
    pub fn open_raw_stream(&mut self) -> TransportResult<(quinn::SendStream, quinn::RecvStream)> {
        let connection = self.require_connection()?.clone();
        self.runtime
            .block_on(async move { connection.open_bi().await })
            .map_err(TransportError::from_connection_error)
    }

    fn require_connection(&self) -> TransportResult<&quinn::Connection> {
        if let Some(err) = &self.conn_error {
            return Err(err.clone());
        }
        self.connection.as_ref().ok_or_else(|| {
            TransportError::invalid_stream_state(
                0,
                "session has no H3 transport (fallback protocol won the race)",
            )
        })
    }

    fn attach_h3(
        &mut self,
        connection: quinn::Connection,
    ) -> TransportResult<(H3SendRequest, JoinHandle<()>)> {
        let events = self.events_tx.clone();
        self.runtime.block_on(async move {
            let h3_conn = h3_quinn::Connection::new(connection);
            let (mut driver, send_request) =
                h3::client::new(h3_conn).await.map_err(|err| {
                    TransportError::new(
                        TransportErrorKind::HandshakeFailure,
                        format!("h3 attach: {err}"),
                    )
                })?;
            let handle = tokio::spawn(async move {
                let closed = std::future::poll_fn(|cx| driver.poll_close(cx)).await;
                let error = match closed {
                    Ok(()) => TransportError::new(
                        TransportErrorKind::PeerClosed,
                        "h3 connection closed",
                    ),
                    Err(err) => TransportError::new(
                        TransportErrorKind::PeerClosed,
                        format!("h3 connection lost: {err}"),
                    ),
                };
                let _ = events.send(BackendEvent::ConnectionLost { error });
            });
            Ok((send_request, handle))
        })
    }

    /// Send request headers (and optionally a body). With `fin` the request
    /// is complete; without it the stream stays open for `send_body`.
    /// Returns the stream id synchronously.
    pub fn send_request(
        &mut self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        fin: bool,
    ) -> TransportResult<u64> {
        if let Some(err) = &self.conn_error {
            return Err(err.clone());
        }
        let send_request = self
            .send_request
            .clone()
            .ok_or_else(|| {
                TransportError::invalid_stream_state(
                    0,
                    "session has no H3 transport (fallback protocol won the race)",
                )
            })?;

        let method = http::Method::from_bytes(method.as_bytes()).map_err(|_| {
            TransportError::new(
                TransportErrorKind::InvalidStreamState,
                format!("'{method}' is not a valid request method"),
            )
        })?;
        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("https://{}{}", self.host, path));
        for (name, value) in headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let request = builder.body(()).map_err(|err| {
            TransportError::new(
                TransportErrorKind::InvalidStreamState,
                format!("invalid request: {err}"),
            )
        })?;

        let id = self.streams.allocate();
        if fin {
            self.streams
                .get_mut(id)
                .expect("freshly allocated stream")
                .note_local_fin()?;
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(STREAM_COMMAND_QUEUE);
        self.commands.insert(id, cmd_tx);
        let events = self.events_tx.clone();
        let initial_body = body.map(Bytes::copy_from_slice);
        self.runtime.spawn(run_request(
            send_request,
            id,
            request,
            initial_body,
            fin,
            cmd_rx,
            events,
        ));

        self.last_activity = Instant::now();
        Ok(id)
    }

    /// Push a body chunk on an open request stream. A full command queue is
    /// reported as `Done`; retry after the next `poll`.
    pub fn send_body(&mut self, stream_id: u64, chunk: &[u8], fin: bool) -> TransportResult<()> {
        let state = self.streams.require_mut(stream_id)?;
        if !state.writable() {
            return Err(TransportError::invalid_stream_state(
                stream_id,
                "write after local FIN",
            ));
        }

        let sender = self
            .commands
            .get(&stream_id)
            .ok_or_else(|| TransportError::unknown_stream(stream_id))?;
        match sender.try_send(StreamCommand::SendChunk {
            data: Bytes::copy_from_slice(chunk),
            fin,
        }) {
            Ok(()) => {
                if fin {
                    self.streams
                        .require_mut(stream_id)?
                        .note_local_fin()?;
                }
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::done()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(
                TransportError::invalid_stream_state(stream_id, "request task is gone"),
            ),
        }
    }

    /// One cooperative iteration: wait up to the deadline for backend
    /// events, drain whatever is ready into the stream table, refresh stats
    /// and the cached ticket. Returns whether progress was made.
    pub fn poll(&mut self, timeout: Duration) -> TransportResult<bool> {
        if self.closed {
            return Err(self.conn_error.clone().unwrap_or_else(|| {
                TransportError::new(TransportErrorKind::PeerClosed, "session is closed")
            }));
        }

        // Effective deadline: the caller's budget capped by the connection's
        // remaining idle allowance.
        let idle_budget = self
            .config
            .quic
            .max_idle_timeout
            .saturating_sub(self.last_activity.elapsed());
        let deadline = timeout.min(idle_budget);

        let runtime = Arc::clone(&self.runtime);
        let events_rx = &mut self.events_rx;
        let first =
            runtime.block_on(async { tokio::time::timeout(deadline, events_rx.recv()).await });

        let mut progressed = false;
        match first {
            Ok(Some(event)) => {
                self.apply_event(event);
                progressed = true;
                while let Ok(event) = self.events_rx.try_recv() {
                    self.apply_event(event);
                }
            }
            Ok(None) => {
                self.conn_error.get_or_insert(TransportError::new(
                    TransportErrorKind::PeerClosed,
                    "backend channel closed",
                ));
            }
            Err(_elapsed) => {
                if idle_budget.is_zero() {
                    let err = TransportError::new(
                        TransportErrorKind::Timeout,
                        "connection idle timeout expired",
                    );
                    self.conn_error = Some(err.clone());
                    return Err(err);
                }
            }
        }

        if let Some(connection) = &self.connection {
            self.stats = stats::from_quinn(&connection.stats());
        }
        self.refresh_ticket_buffer();

        if progressed {
            self.last_activity = Instant::now();
        }
        Ok(progressed)
    }

    fn apply_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Headers {
                stream,
                status,
                headers,
            } => {
                let state = self.streams.entry_for_event(stream);
                state.status = Some(status);
                state.headers = headers;
            }
            BackendEvent::Data { stream, chunk } => {
                let state = self.streams.entry_for_event(stream);
                state.body.extend_from_slice(&chunk);
            }
            BackendEvent::Finished { stream } => {
                self.streams.entry_for_event(stream).note_remote_fin();
                self.commands.remove(&stream);
            }
            BackendEvent::StreamFailed { stream, error } => {
                self.streams.entry_for_event(stream).note_reset(error);
                self.commands.remove(&stream);
            }
            BackendEvent::ConnectionLost { error } => {
                self.conn_error = Some(error);
            }
        }
    }

    /// Block (looping `poll`) until the response on `stream_id` is complete
    /// or the timeout elapses. The response is delivered exactly once.
    pub fn receive_response(
        &mut self,
        stream_id: u64,
        timeout: Duration,
    ) -> TransportResult<ResponseView> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(state) = self.streams.get(stream_id) {
                if let Some(error) = &state.error {
                    let error = error.clone();
                    self.streams.remove(stream_id);
                    return Err(error);
                }
                if state.read_finished {
                    let state = self.streams.remove(stream_id).expect("checked above");
                    self.commands.remove(&stream_id);
                    return Ok(ResponseView {
                        status: state.status.unwrap_or(0),
                        headers: state.headers,
                        body: state.body,
                    });
                }
            } else {
                return Err(TransportError::unknown_stream(stream_id));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::timeout(timeout));
            }
            self.poll(remaining)?;
        }
    }

    /// Drain buffered response data for `stream_id`. `Ok(None)` signals
    /// end-of-stream, delivered exactly once; `Done` means nothing is
    /// buffered yet.
    pub fn read_body(&mut self, stream_id: u64) -> TransportResult<Option<Vec<u8>>> {
        let state = self.streams.require_mut(stream_id)?;
        if let Some(error) = &state.error {
            let error = error.clone();
            self.streams.remove(stream_id);
            return Err(error);
        }
        if !state.body.is_empty() {
            let chunk = std::mem::take(&mut state.body);
            return Ok(Some(chunk));
        }
        if state.read_finished {
            self.streams.remove(stream_id);
            self.commands.remove(&stream_id);
            return Ok(None);
        }
        Err(TransportError::done())
    }

    /// Response status and headers once they arrived, without consuming the
    /// stream.
    pub fn response_headers(
        &self,
        stream_id: u64,
    ) -> TransportResult<Option<(u16, Vec<(String, String)>)>> {
        let state = self
            .streams
            .get(stream_id)
            .ok_or_else(|| TransportError::unknown_stream(stream_id))?;
        Ok(state
            .status
            .map(|status| (status, state.headers.clone())))
    }

    /// Shut a stream down. `Read` halts ingress, `Write` halts egress,
    /// `Both` resets the stream. The stream transitions to CLOSED either
    /// way; later operations fail.
    pub fn cancel_stream(
        &mut self,
        stream_id: u64,
        direction: StreamDirection,
    ) -> TransportResult<()> {
        let state = self.streams.require_mut(stream_id)?;
        if state.is_closed() {
            return Err(TransportError::invalid_stream_state(
                stream_id,
                "stream already closed",
            ));
        }

        let command = match direction {
            StreamDirection::Read => StreamCommand::CancelRead,
            StreamDirection::Write => StreamCommand::CancelWrite,
            StreamDirection::Both => StreamCommand::CancelBoth,
        };
        if let Some(sender) = self.commands.get(&stream_id) {
            // Best effort: a gone task means the stream already terminated.
            let _ = sender.try_send(command);
        }

        let state = self.streams.require_mut(stream_id)?;
        state.note_reset(TransportError::new(
            TransportErrorKind::StreamStopped,
            format!("stream {stream_id} canceled ({direction:?})"),
        ));
        if matches!(direction, StreamDirection::Both) {
            self.commands.remove(&stream_id);
        }
        Ok(())
    }

    /// Copy a resumption ticket into the session buffer. With quinn the
    /// handshake has always progressed past Initial by the time a session
    /// exists, so a live session rejects the import; seed the ticket via
    /// `ConnectOptions::session_ticket` instead.
    pub fn import_ticket(&mut self, ticket: &[u8]) -> TransportResult<()> {
        if ticket.len() > MAX_TICKET_LEN {
            return Err(TransportError::new(
                TransportErrorKind::TlsTicketRejected,
                format!("ticket of {} bytes exceeds {MAX_TICKET_LEN}", ticket.len()),
            ));
        }
        Err(TransportError::new(
            TransportErrorKind::TlsTicketRejected,
            "handshake already progressed beyond Initial; pass the ticket in connect options",
        ))
    }

    /// The cached ticket blob, refreshed from the ring on every `poll`.
    pub fn export_ticket(&self) -> Option<&[u8]> {
        if self.ticket_len == 0 {
            None
        } else {
            Some(&self.ticket[..self.ticket_len])
        }
    }

    fn refresh_ticket_buffer(&mut self) {
        let store = TicketStore::global();
        let epoch = store.latest_epoch();
        if epoch == 0 || epoch == self.ticket_epoch {
            return;
        }
        if let Some(entry) = store.snapshot(epoch) {
            self.ticket[..entry.data.len()].copy_from_slice(&entry.data);
            self.ticket_len = entry.data.len();
            self.ticket_epoch = entry.epoch;
        }
    }

    /// Close the connection with the configured reason. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.close(quinn::VarInt::from_u32(0), self.close_reason.as_bytes());
        }
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(quinn::VarInt::from_u32(0), self.close_reason.as_bytes());
        }
        self.fallback_stream = None;
        self.send_request = None;
        self.conn_error.get_or_insert(TransportError::new(
            TransportErrorKind::PeerClosed,
            "session closed locally",
        ));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("host", &self.host)
            .field("remote", &self.remote)
            .field("protocol", &self.protocol.label())
            .field("alive", &self.is_alive())
            .field("streams", &self.streams.len())
            .finish()
    }
}

/// Per-request backend task: sends the request, relays upload commands, and
/// forwards HEADERS/DATA/FIN into the session event channel. Events for one
/// stream always originate here, in order.
async fn run_request(
    mut send_request: H3SendRequest,
    id: u64,
    request: http::Request<()>,
    initial_body: Option<Bytes>,
    end_after_body: bool,
    mut commands: mpsc::Receiver<StreamCommand>,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let fail = |error: TransportError| {
        let _ = events.send(BackendEvent::StreamFailed { stream: id, error });
    };

    let mut stream = match send_request.send_request(request).await {
        Ok(stream) => stream,
        Err(err) => {
            fail(h3_stream_error(id, &err));
            return;
        }
    };

    if let Some(body) = initial_body {
        if let Err(err) = stream.send_data(body).await {
            fail(h3_stream_error(id, &err));
            return;
        }
    }

    if end_after_body {
        if let Err(err) = stream.finish().await {
            fail(h3_stream_error(id, &err));
            return;
        }
    } else {
        // Upload phase: relay chunks until FIN or cancellation.
        loop {
            match commands.recv().await {
                Some(StreamCommand::SendChunk { data, fin }) => {
                    if !data.is_empty() {
                        if let Err(err) = stream.send_data(data).await {
                            fail(h3_stream_error(id, &err));
                            return;
                        }
                    }
                    if fin {
                        if let Err(err) = stream.finish().await {
                            fail(h3_stream_error(id, &err));
                            return;
                        }
                        break;
                    }
                }
                Some(StreamCommand::Finish) | Some(StreamCommand::CancelWrite) => {
                    if let Err(err) = stream.finish().await {
                        fail(h3_stream_error(id, &err));
                        return;
                    }
                    break;
                }
                Some(StreamCommand::CancelRead) => {
                    stream.stop_sending(h3::error::Code::H3_REQUEST_CANCELLED);
                }
                Some(StreamCommand::CancelBoth) | None => {
                    stream.stop_sending(h3::error::Code::H3_REQUEST_CANCELLED);
                    fail(TransportError::new(
                        TransportErrorKind::StreamStopped,
                        format!("stream {id} canceled locally"),
                    ));
                    return;
                }
            }
        }
    }

    // Response phase.
    let response = loop {
        tokio::select! {
            result = stream.recv_response() => match result {
                Ok(response) => break response,
                Err(err) => {
                    fail(h3_stream_error(id, &err));
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(StreamCommand::CancelRead)
                | Some(StreamCommand::CancelBoth)
                | None => {
                    stream.stop_sending(h3::error::Code::H3_REQUEST_CANCELLED);
                    fail(TransportError::new(
                        TransportErrorKind::StreamStopped,
                        format!("stream {id} canceled locally"),
                    ));
                    return;
                }
                _ => continue,
            },
        }
    };

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let _ = events.send(BackendEvent::Headers {
        stream: id,
        status,
        headers,
    });

    loop {
        tokio::select! {
            result = stream.recv_data() => match result {
                Ok(Some(mut buf)) => {
                    let chunk = buf.copy_to_bytes(buf.remaining());
                    let _ = events.send(BackendEvent::Data { stream: id, chunk });
                }
                Ok(None) => {
                    let _ = events.send(BackendEvent::Finished { stream: id });
                    return;
                }
                Err(err) => {
                    fail(h3_stream_error(id, &err));
                    return;
                }
            },
            command = commands.recv() => match command {
                Some(StreamCommand::CancelRead)
                | Some(StreamCommand::CancelBoth)
                | None => {
                    stream.stop_sending(h3::error::Code::H3_REQUEST_CANCELLED);
                    fail(TransportError::new(
                        TransportErrorKind::StreamStopped,
                        format!("stream {id} canceled locally"),
                    ));
                    return;
                }
                _ => continue,
            },
        }
    }
}

fn h3_stream_error(id: u64, err: &h3::Error) -> TransportError {
    TransportError::new(
        TransportErrorKind::StreamStopped,
        format!("stream {id}: {err}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_options_default_to_auto_racing() {
        let options = ConnectOptions::default();
        assert_eq!(options.preference, TransportPreference::default());
        assert!(options.bind_device.is_none());
        assert!(options.session_ticket.is_none());
    }

    #[test]
    fn transport_config_accepts_defaults() {
        let snapshot = config_snapshot(&ConfigObject::defaults());
        build_transport_config(&snapshot).unwrap();
    }

    #[test]
    fn transport_config_per_cc_algorithm() {
        for algorithm in [CcAlgorithm::Cubic, CcAlgorithm::Reno, CcAlgorithm::Bbr] {
            let mut snapshot = config_snapshot(&ConfigObject::defaults());
            snapshot.cc_algorithm = algorithm;
            build_transport_config(&snapshot).unwrap();
        }
    }

    #[test]
    fn oversized_connect_ticket_is_rejected_before_any_io() {
        let engine = QuicEngine::new().unwrap();
        let options = ConnectOptions {
            session_ticket: Some(vec![0u8; MAX_TICKET_LEN + 1]),
            ..ConnectOptions::default()
        };
        let err = engine
            .connect(
                "localhost",
                4433,
                Arc::new(ConfigObject::defaults()),
                options,
            )
            .unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::TlsTicketRejected);
    }

    #[test]
    fn udp_socket_binds_nonblocking() {
        let socket = bind_udp(IpFamily::V4, None).unwrap();
        assert!(socket.local_addr().unwrap().ip().is_unspecified());
    }
}
