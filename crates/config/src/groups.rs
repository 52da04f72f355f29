//! Typed option groups. Defaults here are the bottom configuration layer and
//! are chosen to be safe rather than fast: peer verification on, no early
//! data, conservative idle timeout, supervisor and admin surface disabled.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TLS identity and verification knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub verify_peer: bool,
    pub verify_depth: u32,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ticket_key_file: Option<PathBuf>,
    pub ciphers_tls13: Option<String>,
    pub curves: Option<String>,
    pub enable_early_data: bool,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            verify_peer: true,
            verify_depth: 9,
            ca_file: None,
            cert_file: None,
            key_file: None,
            ticket_key_file: None,
            ciphers_tls13: None,
            curves: None,
            enable_early_data: false,
        }
    }
}

/// QUIC transport parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuicOptions {
    pub max_idle_timeout: Duration,
    pub max_udp_payload_size: u16,
    pub initial_max_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: Duration,
    pub active_connection_id_limit: u64,
    pub stateless_retry: bool,
    pub grease_level: u8,
    pub enable_datagrams: bool,
    pub dgram_recv_queue_len: usize,
    pub dgram_send_queue_len: usize,
}

impl Default for QuicOptions {
    fn default() -> Self {
        Self {
            max_idle_timeout: Duration::from_secs(30),
            max_udp_payload_size: 1350,
            initial_max_data: 10 * 1024 * 1024,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            initial_max_stream_data_bidi_local: 1024 * 1024,
            initial_max_stream_data_bidi_remote: 1024 * 1024,
            initial_max_stream_data_uni: 1024 * 1024,
            ack_delay_exponent: 3,
            max_ack_delay: Duration::from_millis(25),
            active_connection_id_limit: 2,
            stateless_retry: false,
            grease_level: 1,
            enable_datagrams: false,
            dgram_recv_queue_len: 64,
            dgram_send_queue_len: 64,
        }
    }
}

/// Congestion control selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CcAlgorithm {
    Cubic,
    Reno,
    Bbr,
}

impl FromStr for CcAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cubic" => Ok(CcAlgorithm::Cubic),
            "reno" => Ok(CcAlgorithm::Reno),
            "bbr" => Ok(CcAlgorithm::Bbr),
            other => Err(format!("unknown congestion control algorithm '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CcOptions {
    pub algorithm: CcAlgorithm,
    pub enable_hystart: bool,
    pub enable_pacing: bool,
    pub max_pacing_rate_bps: Option<u64>,
}

impl Default for CcOptions {
    fn default() -> Self {
        Self {
            algorithm: CcAlgorithm::Cubic,
            enable_hystart: true,
            enable_pacing: true,
            max_pacing_rate_bps: None,
        }
    }
}

/// HTTP/3 layer limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct H3Options {
    pub max_header_list_size: u64,
    pub qpack_max_table_capacity: u64,
    pub qpack_blocked_streams: u64,
}

impl Default for H3Options {
    fn default() -> Self {
        Self {
            max_header_list_size: 16 * 1024,
            qpack_max_table_capacity: 4096,
            qpack_blocked_streams: 16,
        }
    }
}

/// Origin admission policy for the CORS gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginPolicy {
    /// The gate is off; every request passes through untouched.
    Disabled,
    /// Any origin is admitted (`"*"`).
    Any,
    /// Only the listed origins are admitted.
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorsOptions {
    pub allowed_origins: OriginPolicy,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origins: OriginPolicy::Disabled,
        }
    }
}

/// Restart policy applied by the supervisor to unexpectedly exiting workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub restart_crashed: bool,
    pub max_restarts: u32,
    pub interval: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            restart_crashed: true,
            max_restarts: 5,
            interval: Duration::from_secs(60),
        }
    }
}

/// Pre-forking supervisor options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOptions {
    /// Worker count; zero disables the supervisor.
    pub workers: u32,
    pub pid_file: Option<PathBuf>,
    pub graceful_timeout: Duration,
    pub restart_policy: RestartPolicy,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            workers: 0,
            pid_file: None,
            graceful_timeout: Duration::from_secs(30),
            restart_policy: RestartPolicy::default(),
        }
    }
}

/// Admin API authentication. mTLS is the only supported mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminAuthMode {
    Mtls,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminApiOptions {
    pub enabled: bool,
    pub bind_host: String,
    pub port: u16,
    pub auth_mode: AdminAuthMode,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for AdminApiOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_host: "127.0.0.1".into(),
            port: 9443,
            auth_mode: AdminAuthMode::Mtls,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

/// Default application protocol list offered during ALPN.
pub fn default_app_protocols() -> Vec<String> {
    vec!["h3".into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_defaults() {
        let tls = TlsOptions::default();
        assert!(tls.verify_peer);
        assert!(!tls.enable_early_data);

        let quic = QuicOptions::default();
        assert_eq!(quic.max_idle_timeout, Duration::from_secs(30));
        assert_eq!(quic.max_udp_payload_size, 1350);

        assert_eq!(CcOptions::default().algorithm, CcAlgorithm::Cubic);
        assert_eq!(default_app_protocols(), vec!["h3".to_string()]);
        assert_eq!(ClusterOptions::default().workers, 0);
        assert!(!AdminApiOptions::default().enabled);
    }

    #[test]
    fn cc_algorithm_parses() {
        assert_eq!("bbr".parse::<CcAlgorithm>().unwrap(), CcAlgorithm::Bbr);
        assert!("vegas".parse::<CcAlgorithm>().is_err());
    }
}
