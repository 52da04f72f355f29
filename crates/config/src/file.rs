//! Administrator configuration file.
//!
//! The file is flat `namespace.key = value` pairs (TOML dotted keys and
//! `[namespace]` tables both parse to the same shape). Unrecognized keys are
//! rejected at startup rather than ignored, so a typo never silently runs
//! with defaults.

use std::path::Path;

use tracing::debug;

use crate::error::PolicyError;
use crate::object::ConfigObject;

/// Load the file and apply every pair onto `cfg`.
pub fn apply_admin_file(cfg: &mut ConfigObject, path: &Path) -> Result<(), PolicyError> {
    let text = std::fs::read_to_string(path).map_err(|err| PolicyError::Io {
        path: path.to_path_buf(),
        detail: err.to_string(),
    })?;
    let root: toml::Value = text
        .parse()
        .map_err(|err: toml::de::Error| PolicyError::Parse(err.to_string()))?;

    let table = root.as_table().ok_or_else(|| {
        PolicyError::Parse("top level of the config file must be key-value pairs".into())
    })?;

    let mut applied = 0usize;
    for (namespace, group) in table {
        let group_table = group.as_table().ok_or_else(|| {
            PolicyError::UnknownKey(namespace.clone())
        })?;
        for (option, value) in group_table {
            cfg.apply_key(&format!("{namespace}.{option}"), value)?;
            applied += 1;
        }
    }

    debug!(
        target: "qp::config",
        path = %path.display(),
        keys = applied,
        "administrator configuration applied"
    );
    Ok(())
}

/// Convenience wrapper: defaults plus the admin file.
pub fn load_admin_file(path: &Path) -> Result<ConfigObject, PolicyError> {
    let mut cfg = ConfigObject::defaults();
    apply_admin_file(&mut cfg, path)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    use crate::groups::{CcAlgorithm, OriginPolicy};

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp config file");
        file.write_all(contents.as_bytes()).expect("write config");
        file
    }

    #[test]
    fn flat_keys_and_tables_both_load() {
        let file = write_config(
            r#"
            quic.max_idle_timeout_ms = 12000
            cc.algorithm = "bbr"

            [tls]
            verify_peer = false

            [cors]
            allowed_origins = ["https://app.example"]
            "#,
        );
        let cfg = load_admin_file(file.path()).unwrap();
        assert_eq!(cfg.quic.max_idle_timeout, Duration::from_millis(12_000));
        assert_eq!(cfg.cc.algorithm, CcAlgorithm::Bbr);
        assert!(!cfg.tls.verify_peer);
        assert_eq!(
            cfg.cors.allowed_origins,
            OriginPolicy::List(vec!["https://app.example".into()])
        );
    }

    #[test]
    fn unknown_key_rejected_at_startup() {
        let file = write_config("quic.max_idle_tiemout_ms = 12000\n");
        let err = load_admin_file(file.path()).unwrap_err();
        assert_eq!(
            err,
            PolicyError::UnknownKey("quic.max_idle_tiemout_ms".into())
        );
    }

    #[test]
    fn mistyped_value_rejected() {
        let file = write_config("quic.max_idle_timeout_ms = \"soon\"\n");
        let err = load_admin_file(file.path()).unwrap_err();
        assert!(matches!(err, PolicyError::InvalidValue { .. }));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_admin_file(Path::new("/nonexistent/quicport.toml")).unwrap_err();
        assert!(matches!(err, PolicyError::Io { .. }));
    }

    #[test]
    fn cluster_and_admin_groups_load() {
        let file = write_config(
            r#"
            cluster.workers = 4
            cluster.graceful_timeout_s = 10
            cluster.max_restarts = 2
            cluster.restart_interval_s = 60
            admin.allow_caller_override = true
            admin_api.enabled = true
            admin_api.port = 9901
            admin_api.auth_mode = "mtls"
            "#,
        );
        let cfg = load_admin_file(file.path()).unwrap();
        assert_eq!(cfg.cluster.workers, 4);
        assert_eq!(cfg.cluster.graceful_timeout, Duration::from_secs(10));
        assert_eq!(cfg.cluster.restart_policy.max_restarts, 2);
        assert!(cfg.allow_caller_override());
        assert!(cfg.admin_api.enabled);
        assert_eq!(cfg.admin_api.port, 9901);
    }
}
