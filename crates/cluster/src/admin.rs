//! The admin API: a privileged, mTLS-only RPC surface.
//!
//! Transport is a TCP listener with rustls requiring a client certificate
//! signed by the configured CA. Messages are length-prefixed
//! (`u32` big-endian) BinCodec envelopes, the same codec the data plane
//! speaks. Operations: live reload of a named configuration group, worker
//! statistics aggregation, and draining.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use qp_codec::{decode, encode, BaseType, CodecError, FieldDef, MessageValue, Registry, Value};
use qp_config::{ActiveConfig, AdminApiOptions, PolicyError};
use qp_transport::tls::{load_certs, load_private_key};

use crate::supervisor::WorkerRecord;

/// Hard cap on one admin frame.
const MAX_ADMIN_FRAME: usize = 64 * 1024;

const OP_RELOAD_CONFIG: i64 = 1;
const OP_WORKER_STATS: i64 = 2;
const OP_DRAIN: i64 = 3;

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("admin api is disabled")]
    Disabled,

    #[error("admin api requires {0} for mtls")]
    MissingMaterial(&'static str),

    #[error("tls: {0}")]
    Tls(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),
}

/// Everything a request handler may touch.
#[derive(Clone)]
pub struct AdminContext {
    pub active: Arc<ActiveConfig>,
    pub roster: Arc<std::sync::RwLock<Vec<WorkerRecord>>>,
    pub drain: Arc<AtomicBool>,
}

/// Worker statistics row as exposed over the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStat {
    pub worker_id: u32,
    pub pid: i32,
    pub restart_count: u32,
    pub is_exiting: bool,
}

impl From<&WorkerRecord> for WorkerStat {
    fn from(record: &WorkerRecord) -> Self {
        Self {
            worker_id: record.worker_id,
            pid: record.pid,
            restart_count: record.restart_count,
            is_exiting: record.is_exiting,
        }
    }
}

/// Define the admin envelope schemas. Safe to call more than once.
pub fn register_admin_schemas(registry: &mut Registry) -> Result<(), CodecError> {
    if registry.contains("qp.AdminRequest") {
        return Ok(());
    }

    registry.define_enum(
        "qp.AdminOp",
        &[
            ("RELOAD_CONFIG", OP_RELOAD_CONFIG as i32),
            ("WORKER_STATS", OP_WORKER_STATS as i32),
            ("DRAIN", OP_DRAIN as i32),
        ],
    )?;
    registry.define_schema(
        "qp.AdminRequest",
        vec![
            FieldDef::required("op", 1, BaseType::Enum).with_type_ref("qp.AdminOp"),
            FieldDef::optional("group", 2, BaseType::String),
            FieldDef::optional("payload", 3, BaseType::Bytes),
        ],
    )?;
    registry.define_schema(
        "qp.WorkerStat",
        vec![
            FieldDef::required("worker_id", 1, BaseType::Uint32),
            FieldDef::required("pid", 2, BaseType::Int32),
            FieldDef::optional("restart_count", 3, BaseType::Uint32),
            FieldDef::optional("is_exiting", 4, BaseType::Bool),
        ],
    )?;
    registry.define_schema(
        "qp.WorkerStats",
        vec![FieldDef::repeated("workers", 1, BaseType::Message).with_type_ref("qp.WorkerStat")],
    )?;
    registry.define_schema(
        "qp.AdminResponse",
        vec![
            FieldDef::required("ok", 1, BaseType::Bool),
            FieldDef::optional("detail", 2, BaseType::String),
            FieldDef::optional("payload", 3, BaseType::Bytes),
        ],
    )?;
    Ok(())
}

fn response(registry: &Registry, ok: bool, detail: Option<String>, payload: Option<Vec<u8>>) -> Vec<u8> {
    let mut msg = MessageValue::new().set("ok", ok);
    if let Some(detail) = detail {
        msg.insert("detail", detail);
    }
    if let Some(payload) = payload {
        msg.insert("payload", payload);
    }
    encode(registry, "qp.AdminResponse", &msg).unwrap_or_default()
}

/// Apply a reload payload (flat `namespace.key = value` TOML text) limited
/// to one configuration group, then swap the active pointer.
fn reload_group(ctx: &AdminContext, group: &str, payload: &[u8]) -> Result<(), PolicyError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| PolicyError::Parse("reload payload is not UTF-8".into()))?;
    let root: toml::Value = text
        .parse()
        .map_err(|err: toml::de::Error| PolicyError::Parse(err.to_string()))?;
    let table = root
        .as_table()
        .ok_or_else(|| PolicyError::Parse("reload payload must be key-value pairs".into()))?;

    let mut next = ctx.active.load().clone_unfrozen();
    for (namespace, entries) in table {
        if namespace != group {
            return Err(PolicyError::PolicyViolation(format!(
                "reload of group '{group}' may not touch '{namespace}'"
            )));
        }
        let entries = entries
            .as_table()
            .ok_or_else(|| PolicyError::UnknownKey(namespace.clone()))?;
        for (option, value) in entries {
            next.apply_key(&format!("{namespace}.{option}"), value)?;
        }
    }

    ctx.active.swap(Arc::new(next));
    info!(target: "qp::cluster::admin", group, "configuration group reloaded");
    Ok(())
}

fn worker_stats_payload(ctx: &AdminContext, registry: &Registry) -> Result<Vec<u8>, CodecError> {
    let roster = ctx
        .roster
        .read()
        .map(|records| records.iter().map(WorkerStat::from).collect::<Vec<_>>())
        .unwrap_or_default();

    let workers: Vec<Value> = roster
        .iter()
        .map(|stat| {
            Value::Message(
                MessageValue::new()
                    .set("worker_id", u64::from(stat.worker_id))
                    .set("pid", i64::from(stat.pid))
                    .set("restart_count", u64::from(stat.restart_count))
                    .set("is_exiting", stat.is_exiting),
            )
        })
        .collect();
    encode(
        registry,
        "qp.WorkerStats",
        &MessageValue::new().set("workers", workers),
    )
}

/// Handle one envelope; always answers with an `qp.AdminResponse`.
pub fn handle_request(ctx: &AdminContext, registry: &Registry, frame: &[u8]) -> Vec<u8> {
    let request = match decode(registry, "qp.AdminRequest", frame) {
        Ok(request) => request,
        Err(err) => return response(registry, false, Some(err.to_string()), None),
    };

    let op = request.get("op").and_then(Value::as_i64).unwrap_or(0);
    match op {
        OP_RELOAD_CONFIG => {
            let Some(group) = request.get("group").and_then(Value::as_str) else {
                return response(
                    registry,
                    false,
                    Some("reload requires a group name".into()),
                    None,
                );
            };
            let payload = request
                .get("payload")
                .and_then(Value::as_bytes)
                .unwrap_or_default();
            match reload_group(ctx, group, payload) {
                Ok(()) => response(registry, true, None, None),
                Err(err) => response(registry, false, Some(err.to_string()), None),
            }
        }
        OP_WORKER_STATS => match worker_stats_payload(ctx, registry) {
            Ok(payload) => response(registry, true, None, Some(payload)),
            Err(err) => response(registry, false, Some(err.to_string()), None),
        },
        OP_DRAIN => {
            ctx.drain.store(true, Ordering::Release);
            response(registry, true, None, None)
        }
        other => response(
            registry,
            false,
            Some(format!("unknown admin operation {other}")),
            None,
        ),
    }
}

pub struct AdminServer {
    runtime: Runtime,
    acceptor_task: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl AdminServer {
    /// Bind the listener and start serving. mTLS is the only supported
    /// authentication mode; all three PEM paths are required.
    pub fn start(options: &AdminApiOptions, ctx: AdminContext) -> Result<Self, AdminError> {
        if !options.enabled {
            return Err(AdminError::Disabled);
        }
        let ca_file = options
            .ca_file
            .as_ref()
            .ok_or(AdminError::MissingMaterial("admin_api.ca_file"))?;
        let cert_file = options
            .cert_file
            .as_ref()
            .ok_or(AdminError::MissingMaterial("admin_api.cert_file"))?;
        let key_file = options
            .key_file
            .as_ref()
            .ok_or(AdminError::MissingMaterial("admin_api.key_file"))?;

        {
            let mut registry = qp_codec::global().write().expect("codec registry poisoned");
            register_admin_schemas(&mut registry)?;
        }

        let mut roots = rustls::RootCertStore::empty();
        for cert in load_certs(ca_file).map_err(|err| AdminError::Tls(err.to_string()))? {
            roots
                .add(cert)
                .map_err(|err| AdminError::Tls(format!("ca cert: {err}")))?;
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| AdminError::Tls(format!("client verifier: {err}")))?;

        let certs = load_certs(cert_file).map_err(|err| AdminError::Tls(err.to_string()))?;
        let key = load_private_key(key_file).map_err(|err| AdminError::Tls(err.to_string()))?;
        let tls = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|err| AdminError::Tls(format!("server identity: {err}")))?;
        let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls));

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind((
            options.bind_host.as_str(),
            options.port,
        )))?;
        let local_addr = listener.local_addr()?;

        let acceptor_task = runtime.spawn(async move {
            loop {
                let Ok((socket, peer)) = listener.accept().await else {
                    return;
                };
                let acceptor = acceptor.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    match acceptor.accept(socket).await {
                        Ok(stream) => {
                            if let Err(err) = serve_connection(ctx, stream).await {
                                warn!(
                                    target: "qp::cluster::admin",
                                    peer = %peer,
                                    error = %err,
                                    "admin connection ended with error"
                                );
                            }
                        }
                        Err(err) => {
                            warn!(
                                target: "qp::cluster::admin",
                                peer = %peer,
                                error = %err,
                                "mtls handshake rejected"
                            );
                        }
                    }
                });
            }
        });

        info!(
            target: "qp::cluster::admin",
            addr = %local_addr,
            "admin api listening (mtls)"
        );
        Ok(Self {
            runtime,
            acceptor_task,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.acceptor_task.abort();
        self.runtime.shutdown_background();
    }
}

async fn serve_connection<S>(ctx: AdminContext, mut stream: S) -> Result<(), AdminError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    loop {
        let mut len_bytes = [0u8; 4];
        match stream.read_exact(&mut len_bytes).await {
            Ok(_) => {}
            // Clean end of the command stream.
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_ADMIN_FRAME {
            return Err(AdminError::Tls(format!(
                "admin frame of {len} bytes exceeds {MAX_ADMIN_FRAME}"
            )));
        }
        let mut frame = vec![0u8; len];
        stream.read_exact(&mut frame).await?;

        let reply = {
            let registry = qp_codec::global().read().expect("codec registry poisoned");
            handle_request(&ctx, &registry, &frame)
        };
        stream.write_all(&(reply.len() as u32).to_be_bytes()).await?;
        stream.write_all(&reply).await?;
        stream.flush().await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_ctx() -> (AdminContext, Arc<ActiveConfig>) {
        let active = Arc::new(ActiveConfig::new(Arc::new(
            qp_config::ConfigObject::defaults(),
        )));
        let ctx = AdminContext {
            active: Arc::clone(&active),
            roster: Arc::new(std::sync::RwLock::new(vec![WorkerRecord {
                pid: 4242,
                worker_id: 0,
                started_at: Instant::now(),
                restart_count: 1,
                last_restart_at: None,
                is_exiting: false,
            }])),
            drain: Arc::new(AtomicBool::new(false)),
        };
        (ctx, active)
    }

    fn test_registry() -> Registry {
        let mut registry = Registry::new();
        register_admin_schemas(&mut registry).unwrap();
        // A second call must be a no-op, not a duplicate error.
        register_admin_schemas(&mut registry).unwrap();
        registry
    }

    fn roundtrip(ctx: &AdminContext, registry: &Registry, request: MessageValue) -> MessageValue {
        let frame = encode(registry, "qp.AdminRequest", &request).unwrap();
        let reply = handle_request(ctx, registry, &frame);
        decode(registry, "qp.AdminResponse", &reply).unwrap()
    }

    #[test]
    fn drain_sets_the_flag() {
        let (ctx, _) = test_ctx();
        let registry = test_registry();
        let reply = roundtrip(&ctx, &registry, MessageValue::new().set("op", OP_DRAIN));
        assert_eq!(reply.get("ok").and_then(Value::as_bool), Some(true));
        assert!(ctx.drain.load(Ordering::Acquire));
    }

    #[test]
    fn worker_stats_are_encoded() {
        let (ctx, _) = test_ctx();
        let registry = test_registry();
        let reply = roundtrip(
            &ctx,
            &registry,
            MessageValue::new().set("op", OP_WORKER_STATS),
        );
        assert_eq!(reply.get("ok").and_then(Value::as_bool), Some(true));

        let payload = reply.get("payload").and_then(Value::as_bytes).unwrap();
        let stats = decode(&registry, "qp.WorkerStats", payload).unwrap();
        let workers = stats.get("workers").and_then(Value::as_list).unwrap();
        assert_eq!(workers.len(), 1);
        let row = workers[0].as_message().unwrap();
        assert_eq!(row.get("pid").and_then(Value::as_i64), Some(4242));
        assert_eq!(row.get("restart_count").and_then(Value::as_i64), Some(1));
    }

    #[test]
    fn reload_swaps_the_active_config() {
        let (ctx, active) = test_ctx();
        let registry = test_registry();
        let reply = roundtrip(
            &ctx,
            &registry,
            MessageValue::new()
                .set("op", OP_RELOAD_CONFIG)
                .set("group", "quic")
                .set("payload", b"quic.max_idle_timeout_ms = 5000\n".to_vec()),
        );
        assert_eq!(
            reply.get("ok").and_then(Value::as_bool),
            Some(true),
            "detail: {:?}",
            reply.get("detail")
        );
        assert_eq!(
            active.load().quic.max_idle_timeout,
            std::time::Duration::from_millis(5_000)
        );
    }

    #[test]
    fn reload_outside_the_named_group_is_refused() {
        let (ctx, active) = test_ctx();
        let registry = test_registry();
        let reply = roundtrip(
            &ctx,
            &registry,
            MessageValue::new()
                .set("op", OP_RELOAD_CONFIG)
                .set("group", "quic")
                .set("payload", b"tls.verify_peer = false\n".to_vec()),
        );
        assert_eq!(reply.get("ok").and_then(Value::as_bool), Some(false));
        assert!(active.load().tls.verify_peer);
    }

    #[test]
    fn unknown_operation_is_answered_not_dropped() {
        let (ctx, _) = test_ctx();
        let registry = test_registry();
        let reply = roundtrip(&ctx, &registry, MessageValue::new().set("op", 99));
        assert_eq!(reply.get("ok").and_then(Value::as_bool), Some(false));
    }

    #[test]
    fn malformed_frame_is_answered_with_an_error() {
        let (ctx, _) = test_ctx();
        let registry = test_registry();
        let reply_bytes = handle_request(&ctx, &registry, &[0xff, 0xff, 0xff]);
        let reply = decode(&registry, "qp.AdminResponse", &reply_bytes).unwrap();
        assert_eq!(reply.get("ok").and_then(Value::as_bool), Some(false));
    }
}
