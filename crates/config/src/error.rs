//! Policy and configuration errors. Raised before any side effect: a failed
//! construction or mutation leaves no partially-applied object behind.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("configuration is frozen")]
    ConfigFrozen,

    #[error("origin '{0}' is not permitted")]
    ForbiddenOrigin(String),

    #[error("unrecognized configuration key '{0}'")]
    UnknownKey(String),

    #[error("invalid value for '{key}': {detail}")]
    InvalidValue { key: String, detail: String },

    #[error("cannot read configuration file '{path}': {detail}")]
    Io { path: PathBuf, detail: String },

    #[error("configuration file is not valid: {0}")]
    Parse(String),
}
