//! Pre-handler request gates.
//!
//! The CORS gate runs before any handler sees the request. It only inspects
//! the Origin header and the configured policy; it never buffers bodies.

use qp_config::OriginPolicy;

/// Outcome of the CORS gate for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOutcome {
    /// Not a CORS request, or the gate is disabled: continue untouched.
    Passthrough,
    /// Admitted: stage these headers on the eventual response.
    Allowed { headers: Vec<(String, String)> },
    /// Preflight answered in full; send 204 with the headers and close.
    HandledAndFinished {
        status: u16,
        headers: Vec<(String, String)>,
    },
    /// Origin not admitted; send 403 and close.
    Forbidden { status: u16 },
}

const ALLOW_METHODS: &str = "GET, POST, OPTIONS";
const ALLOW_HEADERS: &str = "content-type, authorization";

/// Evaluate the gate for a request with the given method and Origin header.
pub fn evaluate_cors(policy: &OriginPolicy, method: &str, origin: Option<&str>) -> CorsOutcome {
    if matches!(policy, OriginPolicy::Disabled) {
        return CorsOutcome::Passthrough;
    }
    let Some(origin) = origin else {
        // No Origin header: not a CORS request.
        return CorsOutcome::Passthrough;
    };

    let allowed_value = match policy {
        OriginPolicy::Disabled => unreachable!("handled above"),
        OriginPolicy::Any => Some("*".to_string()),
        OriginPolicy::List(origins) => origins
            .iter()
            .find(|candidate| candidate.eq_ignore_ascii_case(origin))
            .map(|_| origin.to_string()),
    };

    let Some(allowed_value) = allowed_value else {
        return CorsOutcome::Forbidden { status: 403 };
    };

    let mut headers = vec![(
        "access-control-allow-origin".to_string(),
        allowed_value.clone(),
    )];
    if allowed_value != "*" {
        headers.push(("vary".to_string(), "origin".to_string()));
    }

    if method.eq_ignore_ascii_case("OPTIONS") {
        headers.push((
            "access-control-allow-methods".to_string(),
            ALLOW_METHODS.to_string(),
        ));
        headers.push((
            "access-control-allow-headers".to_string(),
            ALLOW_HEADERS.to_string(),
        ));
        return CorsOutcome::HandledAndFinished {
            status: 204,
            headers,
        };
    }

    CorsOutcome::Allowed { headers }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(origins: &[&str]) -> OriginPolicy {
        OriginPolicy::List(origins.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn disabled_gate_passes_everything_through() {
        assert_eq!(
            evaluate_cors(&OriginPolicy::Disabled, "GET", Some("https://evil.example")),
            CorsOutcome::Passthrough
        );
    }

    #[test]
    fn non_cors_request_passes_through() {
        assert_eq!(
            evaluate_cors(&list(&["https://app.example"]), "GET", None),
            CorsOutcome::Passthrough
        );
    }

    #[test]
    fn listed_origin_is_allowed_with_staged_headers() {
        let outcome = evaluate_cors(&list(&["https://app.example"]), "GET", Some("https://app.example"));
        let CorsOutcome::Allowed { headers } = outcome else {
            panic!("expected Allowed, got {outcome:?}");
        };
        assert!(headers.contains(&(
            "access-control-allow-origin".into(),
            "https://app.example".into()
        )));
        assert!(headers.contains(&("vary".into(), "origin".into())));
    }

    #[test]
    fn wildcard_policy_admits_any_origin() {
        let outcome = evaluate_cors(&OriginPolicy::Any, "POST", Some("https://anywhere.example"));
        let CorsOutcome::Allowed { headers } = outcome else {
            panic!("expected Allowed, got {outcome:?}");
        };
        assert!(headers.contains(&("access-control-allow-origin".into(), "*".into())));
    }

    #[test]
    fn preflight_is_answered_and_finished() {
        let outcome = evaluate_cors(
            &list(&["https://app.example"]),
            "OPTIONS",
            Some("https://app.example"),
        );
        let CorsOutcome::HandledAndFinished { status, headers } = outcome else {
            panic!("expected HandledAndFinished, got {outcome:?}");
        };
        assert_eq!(status, 204);
        assert!(headers
            .iter()
            .any(|(name, _)| name == "access-control-allow-methods"));
    }

    #[test]
    fn unlisted_origin_is_forbidden() {
        assert_eq!(
            evaluate_cors(&list(&["https://app.example"]), "GET", Some("https://evil.example")),
            CorsOutcome::Forbidden { status: 403 }
        );
    }
}
