//! The effective configuration object.
//!
//! Layering (later wins): hardcoded defaults, administrator file, caller
//! overlay. The caller overlay is admitted only when the administrator set
//! `admin.allow_caller_override`; otherwise a non-empty overlay fails with
//! `PolicyViolation` and nothing is constructed. `freeze()` is monotonic:
//! once set, every `apply_key` fails with `ConfigFrozen`. Hot reload never
//! mutates a live object; it builds a fresh one and swaps the active
//! pointer, so in-flight sessions keep the configuration they started with.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::caller::CallerOptions;
use crate::error::PolicyError;
use crate::file;
use crate::groups::{
    default_app_protocols, AdminApiOptions, CcOptions, ClusterOptions, CorsOptions, H3Options,
    OriginPolicy, QuicOptions, TlsOptions,
};

#[derive(Debug)]
pub struct ConfigObject {
    pub tls: TlsOptions,
    pub quic: QuicOptions,
    pub cc: CcOptions,
    pub h3: H3Options,
    pub app_protocols: Vec<String>,
    pub cors: CorsOptions,
    pub cluster: ClusterOptions,
    pub admin_api: AdminApiOptions,
    allow_caller_override: bool,
    frozen: AtomicBool,
}

impl Default for ConfigObject {
    fn default() -> Self {
        Self {
            tls: TlsOptions::default(),
            quic: QuicOptions::default(),
            cc: CcOptions::default(),
            h3: H3Options::default(),
            app_protocols: default_app_protocols(),
            cors: CorsOptions::default(),
            cluster: ClusterOptions::default(),
            admin_api: AdminApiOptions::default(),
            allow_caller_override: false,
            frozen: AtomicBool::new(false),
        }
    }
}

impl ConfigObject {
    /// Hardcoded safe defaults, nothing layered on top.
    pub fn defaults() -> Self {
        Self::default()
    }

    /// Assemble the effective configuration from all three layers.
    pub fn build(
        admin_file: Option<&Path>,
        caller: &CallerOptions,
    ) -> Result<Self, PolicyError> {
        let mut cfg = Self::defaults();
        if let Some(path) = admin_file {
            file::apply_admin_file(&mut cfg, path)?;
        }
        cfg.apply_caller(caller)?;
        Ok(cfg)
    }

    fn apply_caller(&mut self, caller: &CallerOptions) -> Result<(), PolicyError> {
        if caller.is_empty() {
            return Ok(());
        }
        if !self.allow_caller_override {
            return Err(PolicyError::PolicyViolation(
                "caller options are not permitted (admin.allow_caller_override is off)".into(),
            ));
        }

        if let Some(ms) = caller.max_idle_timeout_ms {
            self.quic.max_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = caller.max_udp_payload_size {
            self.quic.max_udp_payload_size = size;
        }
        if let Some(protocols) = &caller.app_protocols {
            self.app_protocols = protocols.clone();
        }
        if let Some(verify) = caller.verify_peer {
            self.tls.verify_peer = verify;
        }
        if let Some(ca) = &caller.ca_file {
            self.tls.ca_file = Some(ca.clone());
        }
        if let Some(early) = caller.enable_early_data {
            self.tls.enable_early_data = early;
        }
        if let Some(algorithm) = caller.cc_algorithm {
            self.cc.algorithm = algorithm;
        }
        if let Some(size) = caller.max_header_list_size {
            self.h3.max_header_list_size = size;
        }
        Ok(())
    }

    /// Copy of this configuration with the frozen flag cleared. Reload
    /// starts from the running values, applies the new layer, then freezes
    /// and swaps the copy; the original stays frozen throughout.
    pub fn clone_unfrozen(&self) -> Self {
        Self {
            tls: self.tls.clone(),
            quic: self.quic.clone(),
            cc: self.cc.clone(),
            h3: self.h3.clone(),
            app_protocols: self.app_protocols.clone(),
            cors: self.cors.clone(),
            cluster: self.cluster.clone(),
            admin_api: self.admin_api.clone(),
            allow_caller_override: self.allow_caller_override,
            frozen: AtomicBool::new(false),
        }
    }

    /// Make the object read-only. Idempotent, never reversed.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn allow_caller_override(&self) -> bool {
        self.allow_caller_override
    }

    /// Apply one flat `namespace.key = value` pair. Used by the file loader
    /// and by admin-API reloads; both run before the object is frozen.
    pub fn apply_key(&mut self, key: &str, value: &toml::Value) -> Result<(), PolicyError> {
        if self.is_frozen() {
            return Err(PolicyError::ConfigFrozen);
        }

        let (namespace, option) = key
            .split_once('.')
            .ok_or_else(|| PolicyError::UnknownKey(key.to_string()))?;

        match namespace {
            "admin" => match option {
                "allow_caller_override" => {
                    self.allow_caller_override = expect_bool(key, value)?;
                }
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "tls" => match option {
                "verify_peer" => self.tls.verify_peer = expect_bool(key, value)?,
                "verify_depth" => self.tls.verify_depth = expect_u64(key, value)? as u32,
                "ca_file" => self.tls.ca_file = Some(expect_path(key, value)?),
                "cert_file" => self.tls.cert_file = Some(expect_path(key, value)?),
                "key_file" => self.tls.key_file = Some(expect_path(key, value)?),
                "ticket_key_file" => self.tls.ticket_key_file = Some(expect_path(key, value)?),
                "ciphers_tls13" => self.tls.ciphers_tls13 = Some(expect_str(key, value)?),
                "curves" => self.tls.curves = Some(expect_str(key, value)?),
                "enable_early_data" => self.tls.enable_early_data = expect_bool(key, value)?,
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "quic" => match option {
                "max_idle_timeout_ms" => {
                    self.quic.max_idle_timeout = Duration::from_millis(expect_u64(key, value)?);
                }
                "max_udp_payload_size" => {
                    self.quic.max_udp_payload_size = expect_u64(key, value)? as u16;
                }
                "initial_max_data" => self.quic.initial_max_data = expect_u64(key, value)?,
                "initial_max_streams_bidi" => {
                    self.quic.initial_max_streams_bidi = expect_u64(key, value)?;
                }
                "initial_max_streams_uni" => {
                    self.quic.initial_max_streams_uni = expect_u64(key, value)?;
                }
                "initial_max_stream_data_bidi_local" => {
                    self.quic.initial_max_stream_data_bidi_local = expect_u64(key, value)?;
                }
                "initial_max_stream_data_bidi_remote" => {
                    self.quic.initial_max_stream_data_bidi_remote = expect_u64(key, value)?;
                }
                "initial_max_stream_data_uni" => {
                    self.quic.initial_max_stream_data_uni = expect_u64(key, value)?;
                }
                "ack_delay_exponent" => {
                    self.quic.ack_delay_exponent = expect_u64(key, value)? as u8;
                }
                "max_ack_delay_ms" => {
                    self.quic.max_ack_delay = Duration::from_millis(expect_u64(key, value)?);
                }
                "active_connection_id_limit" => {
                    self.quic.active_connection_id_limit = expect_u64(key, value)?;
                }
                "stateless_retry" => self.quic.stateless_retry = expect_bool(key, value)?,
                "grease_level" => self.quic.grease_level = expect_u64(key, value)? as u8,
                "enable_datagrams" => self.quic.enable_datagrams = expect_bool(key, value)?,
                "dgram_recv_queue_len" => {
                    self.quic.dgram_recv_queue_len = expect_u64(key, value)? as usize;
                }
                "dgram_send_queue_len" => {
                    self.quic.dgram_send_queue_len = expect_u64(key, value)? as usize;
                }
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "cc" => match option {
                "algorithm" => {
                    self.cc.algorithm = expect_str(key, value)?.parse().map_err(|detail| {
                        PolicyError::InvalidValue {
                            key: key.to_string(),
                            detail,
                        }
                    })?;
                }
                "enable_hystart" => self.cc.enable_hystart = expect_bool(key, value)?,
                "enable_pacing" => self.cc.enable_pacing = expect_bool(key, value)?,
                "max_pacing_rate_bps" => {
                    self.cc.max_pacing_rate_bps = Some(expect_u64(key, value)?);
                }
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "h3" => match option {
                "max_header_list_size" => {
                    self.h3.max_header_list_size = expect_u64(key, value)?;
                }
                "qpack_max_table_capacity" => {
                    self.h3.qpack_max_table_capacity = expect_u64(key, value)?;
                }
                "qpack_blocked_streams" => {
                    self.h3.qpack_blocked_streams = expect_u64(key, value)?;
                }
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "app" => match option {
                "protocols" => self.app_protocols = expect_str_list(key, value)?,
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "cors" => match option {
                "allowed_origins" => self.cors.allowed_origins = parse_origins(key, value)?,
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "cluster" => match option {
                "workers" => self.cluster.workers = expect_u64(key, value)? as u32,
                "pid_file" => self.cluster.pid_file = Some(expect_path(key, value)?),
                "graceful_timeout_s" => {
                    self.cluster.graceful_timeout = Duration::from_secs(expect_u64(key, value)?);
                }
                "restart_crashed" => {
                    self.cluster.restart_policy.restart_crashed = expect_bool(key, value)?;
                }
                "max_restarts" => {
                    self.cluster.restart_policy.max_restarts = expect_u64(key, value)? as u32;
                }
                "restart_interval_s" => {
                    self.cluster.restart_policy.interval =
                        Duration::from_secs(expect_u64(key, value)?);
                }
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            "admin_api" => match option {
                "enabled" => self.admin_api.enabled = expect_bool(key, value)?,
                "bind_host" => self.admin_api.bind_host = expect_str(key, value)?,
                "port" => self.admin_api.port = expect_u64(key, value)? as u16,
                "auth_mode" => {
                    let mode = expect_str(key, value)?;
                    if mode != "mtls" {
                        return Err(PolicyError::InvalidValue {
                            key: key.to_string(),
                            detail: format!("unsupported auth mode '{mode}' (only mtls)"),
                        });
                    }
                }
                "ca_file" => self.admin_api.ca_file = Some(expect_path(key, value)?),
                "cert_file" => self.admin_api.cert_file = Some(expect_path(key, value)?),
                "key_file" => self.admin_api.key_file = Some(expect_path(key, value)?),
                _ => return Err(PolicyError::UnknownKey(key.to_string())),
            },
            _ => return Err(PolicyError::UnknownKey(key.to_string())),
        }
        Ok(())
    }
}

fn expect_bool(key: &str, value: &toml::Value) -> Result<bool, PolicyError> {
    value.as_bool().ok_or_else(|| PolicyError::InvalidValue {
        key: key.to_string(),
        detail: "expected a boolean".into(),
    })
}

fn expect_u64(key: &str, value: &toml::Value) -> Result<u64, PolicyError> {
    value
        .as_integer()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
        .ok_or_else(|| PolicyError::InvalidValue {
            key: key.to_string(),
            detail: "expected a non-negative integer".into(),
        })
}

fn expect_str(key: &str, value: &toml::Value) -> Result<String, PolicyError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PolicyError::InvalidValue {
            key: key.to_string(),
            detail: "expected a string".into(),
        })
}

fn expect_path(key: &str, value: &toml::Value) -> Result<PathBuf, PolicyError> {
    expect_str(key, value).map(PathBuf::from)
}

fn expect_str_list(key: &str, value: &toml::Value) -> Result<Vec<String>, PolicyError> {
    let items = value.as_array().ok_or_else(|| PolicyError::InvalidValue {
        key: key.to_string(),
        detail: "expected a list of strings".into(),
    })?;
    items
        .iter()
        .map(|item| expect_str(key, item))
        .collect()
}

/// `cors.allowed_origins` accepts `false`, `"*"` or a list of origins.
fn parse_origins(key: &str, value: &toml::Value) -> Result<OriginPolicy, PolicyError> {
    match value {
        toml::Value::Boolean(false) => Ok(OriginPolicy::Disabled),
        toml::Value::String(s) if s == "*" => Ok(OriginPolicy::Any),
        toml::Value::Array(_) => Ok(OriginPolicy::List(expect_str_list(key, value)?)),
        _ => Err(PolicyError::InvalidValue {
            key: key.to_string(),
            detail: "expected false, \"*\" or a list of origins".into(),
        }),
    }
}

/// The daemon's active configuration pointer. Reload builds a fresh frozen
/// object and swaps it in; readers clone the `Arc` and are unaffected by
/// later swaps.
#[derive(Debug)]
pub struct ActiveConfig {
    inner: RwLock<Arc<ConfigObject>>,
}

impl ActiveConfig {
    pub fn new(config: Arc<ConfigObject>) -> Self {
        config.freeze();
        Self {
            inner: RwLock::new(config),
        }
    }

    pub fn load(&self) -> Arc<ConfigObject> {
        self.inner.read().expect("active config lock poisoned").clone()
    }

    /// Swap in a replacement and return the previous object.
    pub fn swap(&self, next: Arc<ConfigObject>) -> Arc<ConfigObject> {
        next.freeze();
        let mut guard = self.inner.write().expect("active config lock poisoned");
        std::mem::replace(&mut *guard, next)
    }
}
