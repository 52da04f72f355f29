//! Loopback integration: a real quinn/h3 server pair on 127.0.0.1.
//!
//! Covers the connect → request → response path, the RPC timeout behavior
//! (stream canceled, session still usable) and protocol reporting.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use qp_config::ConfigObject;
use qp_rpc::{request, RpcError, RpcOptions};
use qp_transport::{
    ConnectOptions, NegotiatedProtocol, PreferredFamily, PreferredProtocol, QuicEngine,
    TransportPreference,
};

/// Spawn an h3 echo server on an ephemeral loopback port. Requests to
/// `/echo/*` are answered with their own body; requests to `/slow/*` are
/// accepted and never answered.
async fn spawn_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let signing = rcgen::generate_simple_self_signed(["localhost".to_string()]).unwrap();
    let cert = rustls::pki_types::CertificateDer::from(signing.cert);
    let key = rustls::pki_types::PrivateKeyDer::Pkcs8(
        rustls::pki_types::PrivatePkcs8KeyDer::from(signing.signing_key.serialize_der()),
    );

    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .unwrap();
    tls.alpn_protocols = vec![b"h3".to_vec()];

    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(Arc::new(tls)).unwrap();
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    let endpoint =
        quinn::Endpoint::server(server_config, "127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = endpoint.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        while let Some(incoming) = endpoint.accept().await {
            tokio::spawn(async move {
                let Ok(connection) = incoming.await else {
                    return;
                };
                let Ok(mut h3_conn) = h3::server::Connection::new(h3_quinn::Connection::new(
                    connection,
                ))
                .await
                else {
                    return;
                };
                while let Ok(Some((req, mut stream))) = h3_conn.accept().await {
                    tokio::spawn(async move {
                        let path = req.uri().path().to_string();
                        let mut body = Vec::new();
                        while let Ok(Some(mut chunk)) = stream.recv_data().await {
                            use bytes::Buf;
                            while chunk.has_remaining() {
                                let part = chunk.chunk();
                                body.extend_from_slice(part);
                                let consumed = part.len();
                                chunk.advance(consumed);
                            }
                        }

                        if path.starts_with("/slow/") {
                            // Hold the stream open without ever responding.
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            return;
                        }

                        let response = http::Response::builder()
                            .status(200)
                            .header("content-type", "application/vnd.binary-rpc")
                            .body(())
                            .unwrap();
                        if stream.send_response(response).await.is_err() {
                            return;
                        }
                        let _ = stream.send_data(Bytes::from(body)).await;
                        let _ = stream.finish().await;
                    });
                }
            });
        }
    });

    (addr, handle)
}

fn loopback_preference() -> TransportPreference {
    TransportPreference {
        protocol: PreferredProtocol::H3,
        family: PreferredFamily::V4,
        ..TransportPreference::default()
    }
}

fn insecure_config() -> Arc<ConfigObject> {
    let mut config = ConfigObject::defaults();
    config
        .apply_key("tls.verify_peer", &toml::Value::Boolean(false))
        .unwrap();
    Arc::new(config)
}

#[test]
fn unary_rpc_roundtrips_over_loopback() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (addr, server) = runtime.block_on(spawn_server());

    let engine = QuicEngine::new().unwrap();
    let options = ConnectOptions {
        preference: loopback_preference(),
        ..ConnectOptions::default()
    };
    let mut session = engine
        .connect("localhost", addr.port(), insecure_config(), options)
        .unwrap();

    assert!(session.is_alive());
    assert_eq!(session.protocol(), NegotiatedProtocol::H3);

    let reply = request(
        &mut session,
        "echo",
        "Ping",
        b"payload-bytes",
        &RpcOptions::with_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(reply, b"payload-bytes");

    session.close();
    assert!(!session.is_alive());
    server.abort();
}

#[test]
fn rpc_timeout_cancels_stream_but_keeps_session() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (addr, server) = runtime.block_on(spawn_server());

    let engine = QuicEngine::new().unwrap();
    let options = ConnectOptions {
        preference: loopback_preference(),
        ..ConnectOptions::default()
    };
    let mut session = engine
        .connect("localhost", addr.port(), insecure_config(), options)
        .unwrap();

    let started = Instant::now();
    let err = request(
        &mut session,
        "slow",
        "Wait",
        b"anything",
        &RpcOptions::with_timeout(Duration::from_millis(250)),
    )
    .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, RpcError::Timeout(_)), "got {err:?}");
    assert!(elapsed >= Duration::from_millis(250), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "elapsed {elapsed:?}");

    // The session survives the canceled exchange.
    let reply = request(
        &mut session,
        "echo",
        "Again",
        b"second-request",
        &RpcOptions::with_timeout(Duration::from_secs(5)),
    )
    .unwrap();
    assert_eq!(reply, b"second-request");

    server.abort();
}
