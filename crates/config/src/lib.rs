//! Layered runtime configuration.
//!
//! A `ConfigObject` is assembled from three layers, later wins:
//! hardcoded safe defaults, administrator overrides (the flat key-value file
//! named by `QP_CONFIG_PATH`), and per-call options. The caller layer only
//! applies when the administrator has set `admin.allow_caller_override`;
//! otherwise any non-empty caller overlay fails with `PolicyViolation`
//! before an object exists. After `freeze()` every mutation fails with
//! `ConfigFrozen`; sessions and servers freeze the object on first
//! attachment.

pub mod caller;
pub mod error;
pub mod file;
pub mod groups;
pub mod object;

pub use caller::CallerOptions;
pub use error::PolicyError;
pub use file::load_admin_file;
pub use groups::{
    AdminApiOptions, AdminAuthMode, CcAlgorithm, CcOptions, ClusterOptions, CorsOptions,
    H3Options, OriginPolicy, QuicOptions, RestartPolicy, TlsOptions,
};
pub use object::{ActiveConfig, ConfigObject};

/// Environment variable naming the administrator config file.
pub const ENV_CONFIG_PATH: &str = "QP_CONFIG_PATH";
