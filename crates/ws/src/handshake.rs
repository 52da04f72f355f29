//! Upgrade handshake: the HTTP/1.1-style exchange used on both the TLS/TCP
//! path and the dedicated QUIC stream path.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::WsError;

/// Fixed GUID appended to the client key before hashing (RFC 6455 §1.3).
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the `Sec-WebSocket-Accept` value for a client key.
pub fn accept_key(client_key: &str) -> String {
    let mut input = String::with_capacity(client_key.len() + ACCEPT_GUID.len());
    input.push_str(client_key);
    input.push_str(ACCEPT_GUID);
    let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, input.as_bytes());
    BASE64.encode(digest.as_ref())
}

/// Generate a fresh 16-byte client nonce, base64-encoded.
pub fn generate_client_key() -> String {
    let nonce: [u8; 16] = rand::random();
    BASE64.encode(nonce)
}

/// Serialize the upgrade request.
pub fn build_upgrade_request(
    host: &str,
    path: &str,
    client_key: &str,
    extra_headers: &[(String, String)],
) -> String {
    let mut request = String::new();
    request.push_str(&format!("GET {path} HTTP/1.1\r\n"));
    request.push_str(&format!("host: {host}\r\n"));
    request.push_str("upgrade: websocket\r\n");
    request.push_str("connection: Upgrade\r\n");
    request.push_str(&format!("sec-websocket-key: {client_key}\r\n"));
    request.push_str("sec-websocket-version: 13\r\n");
    for (name, value) in extra_headers {
        request.push_str(&format!("{name}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Parse the upgrade response head and verify status plus accept key.
/// `head` is everything up to (not including) the terminating CRLFCRLF.
pub fn verify_upgrade_response(head: &str, client_key: &str) -> Result<(), WsError> {
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| WsError::Handshake("empty response".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or("");
    let status = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/1.1") || status != "101" {
        return Err(WsError::Handshake(format!(
            "expected '101 Switching Protocols', got '{status_line}'"
        )));
    }

    let mut accept: Option<&str> = None;
    let mut upgraded = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        match name.as_str() {
            "sec-websocket-accept" => accept = Some(value),
            "upgrade" => upgraded = value.eq_ignore_ascii_case("websocket"),
            _ => {}
        }
    }

    if !upgraded {
        return Err(WsError::Handshake("missing 'upgrade: websocket'".into()));
    }
    let accept = accept.ok_or_else(|| WsError::Handshake("missing sec-websocket-accept".into()))?;
    let expected = accept_key(client_key);
    if accept != expected {
        return Err(WsError::Handshake(format!(
            "accept key mismatch (expected {expected}, got {accept})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // RFC 6455 §1.3 worked example.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn client_keys_are_unique_base64() {
        let a = generate_client_key();
        let b = generate_client_key();
        assert_ne!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 16);
    }

    #[test]
    fn request_carries_required_headers() {
        let request =
            build_upgrade_request("example.com", "/live", "client-key", &[("origin".into(), "https://app".into())]);
        assert!(request.starts_with("GET /live HTTP/1.1\r\n"));
        assert!(request.contains("sec-websocket-key: client-key\r\n"));
        assert!(request.contains("sec-websocket-version: 13\r\n"));
        assert!(request.contains("origin: https://app\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
    }

    #[test]
    fn valid_response_passes() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}",
            accept_key(key)
        );
        verify_upgrade_response(&head, key).unwrap();
    }

    #[test]
    fn wrong_status_fails() {
        let err = verify_upgrade_response("HTTP/1.1 200 OK\r\n", "key").unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }

    #[test]
    fn wrong_accept_key_fails() {
        let head =
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: bogus";
        let err = verify_upgrade_response(head, "key").unwrap_err();
        assert!(matches!(err, WsError::Handshake(_)));
    }
}
