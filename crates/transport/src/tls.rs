//! Client TLS configuration derived from a frozen config object.
//!
//! The root store is the platform trust store plus an optional `ca_file`;
//! `verify_peer = false` swaps in a verifier that accepts anything (useful
//! against self-signed development servers, never the default). All engine
//! configs share one process-wide rustls session cache so resumption
//! tickets survive across sessions.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use rustls::client::ClientSessionMemoryCache;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::RootCertStore;

use qp_config::ConfigObject;

use crate::error::{TransportError, TransportErrorKind, TransportResult};

/// Shared resumption cache: one per process, installed into every client
/// config built here.
fn shared_session_cache() -> Arc<ClientSessionMemoryCache> {
    static CACHE: OnceLock<Arc<ClientSessionMemoryCache>> = OnceLock::new();
    CACHE
        .get_or_init(|| Arc::new(ClientSessionMemoryCache::new(256)))
        .clone()
}

fn tls_error(detail: impl Into<String>) -> TransportError {
    TransportError::new(TransportErrorKind::HandshakeFailure, detail.into())
}

/// Parse a PEM certificate chain.
pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|err| tls_error(format!("certificate file {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| tls_error(format!("parse certificates {}: {err}", path.display())))?;
    if certs.is_empty() {
        return Err(tls_error(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Parse a PEM private key (PKCS#8, SEC1 or RSA).
pub fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|err| tls_error(format!("private key file {}: {err}", path.display())))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|err| tls_error(format!("parse private key {}: {err}", path.display())))?
        .ok_or_else(|| tls_error(format!("no private key found in {}", path.display())))
}

/// Build the rustls client config the engine attaches to every attempt.
pub fn build_client_tls(config: &ConfigObject) -> TransportResult<rustls::ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let builder = if config.tls.verify_peer {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            // A single unparseable platform cert should not take the whole
            // store down.
            let _ = roots.add(cert);
        }
        if let Some(ca_file) = &config.tls.ca_file {
            for cert in load_certs(ca_file)? {
                roots
                    .add(cert)
                    .map_err(|err| tls_error(format!("add ca cert: {err}")))?;
            }
        }
        if roots.is_empty() {
            return Err(tls_error("no trust roots available"));
        }
        rustls::ClientConfig::builder().with_root_certificates(roots)
    } else {
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
    };

    let mut client = match (&config.tls.cert_file, &config.tls.key_file) {
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_private_key(key_file)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|err| tls_error(format!("client identity: {err}")))?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => {
            return Err(tls_error(
                "tls.cert_file and tls.key_file must be set together",
            ));
        }
    };

    client.alpn_protocols = config
        .app_protocols
        .iter()
        .map(|proto| proto.as_bytes().to_vec())
        .collect();
    client.enable_early_data = config.tls.enable_early_data;
    client.resumption = rustls::client::Resumption::store(shared_session_cache());

    Ok(client)
}

/// Verifier used when `tls.verify_peer` is off.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn self_signed_pem() -> (String, String) {
        let key = rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
        (key.cert.pem(), key.signing_key.serialize_pem())
    }

    #[test]
    fn default_config_carries_h3_alpn_and_verification() {
        let config = ConfigObject::defaults();
        let tls = build_client_tls(&config).unwrap();
        assert_eq!(tls.alpn_protocols, vec![b"h3".to_vec()]);
        assert!(!tls.enable_early_data);
    }

    #[test]
    fn verify_peer_off_builds_without_roots() {
        let mut config = ConfigObject::defaults();
        config
            .apply_key("tls.verify_peer", &toml::Value::Boolean(false))
            .unwrap();
        config
            .apply_key("tls.enable_early_data", &toml::Value::Boolean(true))
            .unwrap();
        let tls = build_client_tls(&config).unwrap();
        assert!(tls.enable_early_data);
    }

    #[test]
    fn ca_file_is_loaded_into_the_root_store() {
        let (cert_pem, _) = self_signed_pem();
        let mut ca = tempfile::NamedTempFile::new().unwrap();
        ca.write_all(cert_pem.as_bytes()).unwrap();

        let mut config = ConfigObject::defaults();
        config
            .apply_key(
                "tls.ca_file",
                &toml::Value::String(ca.path().display().to_string()),
            )
            .unwrap();
        build_client_tls(&config).unwrap();
    }

    #[test]
    fn cert_without_key_is_rejected() {
        let (cert_pem, _) = self_signed_pem();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(cert_pem.as_bytes()).unwrap();

        let mut config = ConfigObject::defaults();
        config
            .apply_key(
                "tls.cert_file",
                &toml::Value::String(cert.path().display().to_string()),
            )
            .unwrap();
        let err = build_client_tls(&config).unwrap_err();
        assert_eq!(err.kind, TransportErrorKind::HandshakeFailure);
    }

    #[test]
    fn key_material_roundtrips_through_pem_loaders() {
        let (cert_pem, key_pem) = self_signed_pem();
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        cert.write_all(cert_pem.as_bytes()).unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        key.write_all(key_pem.as_bytes()).unwrap();

        assert_eq!(load_certs(cert.path()).unwrap().len(), 1);
        load_private_key(key.path()).unwrap();
    }
}
