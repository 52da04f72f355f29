//! Per-call configuration overlay.
//!
//! The binding layer hands these in per connect/request. They only apply
//! when the administrator has enabled `admin.allow_caller_override`; the
//! check happens before construction so a denied overlay never produces a
//! half-configured object.

use std::path::PathBuf;

use crate::groups::CcAlgorithm;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallerOptions {
    pub max_idle_timeout_ms: Option<u64>,
    pub max_udp_payload_size: Option<u16>,
    pub app_protocols: Option<Vec<String>>,
    pub verify_peer: Option<bool>,
    pub ca_file: Option<PathBuf>,
    pub enable_early_data: Option<bool>,
    pub cc_algorithm: Option<CcAlgorithm>,
    pub max_header_list_size: Option<u64>,
}

impl CallerOptions {
    pub fn is_empty(&self) -> bool {
        self == &CallerOptions::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_overlay_is_empty() {
        assert!(CallerOptions::default().is_empty());
        let overlay = CallerOptions {
            max_idle_timeout_ms: Some(5_000),
            ..CallerOptions::default()
        };
        assert!(!overlay.is_empty());
    }
}
