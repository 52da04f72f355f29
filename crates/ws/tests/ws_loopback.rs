//! Loopback integration for the WebSocket endpoint over plain TCP.
//!
//! The test server speaks just enough of the server side: it answers the
//! upgrade with a computed accept key, echoes data frames unmasked, answers
//! pings with pongs and echoes close frames.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use qp_ws::{accept_key, Frame, FrameDecoder, Opcode, WsEndpoint, WsError, WsOptions, WsState};

async fn run_server(listener: TcpListener) {
    loop {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        tokio::spawn(async move {
            // Upgrade request.
            let mut head = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match socket.read(&mut byte).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => head.push(byte[0]),
                }
                if head.ends_with(b"\r\n\r\n") {
                    break;
                }
            }
            let head = String::from_utf8_lossy(&head);
            let key = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.trim()
                        .eq_ignore_ascii_case("sec-websocket-key")
                        .then(|| value.trim().to_string())
                })
                .expect("client sent a key");

            let response = format!(
                "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
                accept_key(&key)
            );
            if socket.write_all(response.as_bytes()).await.is_err() {
                return;
            }

            // Frame loop: echo data, pong pings, echo close.
            let mut decoder = FrameDecoder::new(1 << 20);
            let mut chunk = [0u8; 4096];
            loop {
                while let Ok(Some(frame)) = decoder.next_frame() {
                    let reply = match frame.opcode {
                        Opcode::Text | Opcode::Binary => Some((frame.opcode, frame.payload)),
                        Opcode::Ping => Some((Opcode::Pong, frame.payload)),
                        Opcode::Close => {
                            let mut out = Vec::new();
                            qp_ws::frame::encode_frame(
                                &mut out,
                                Opcode::Close,
                                &frame.payload,
                                true,
                                None,
                            )
                            .unwrap();
                            let _ = socket.write_all(&out).await;
                            return;
                        }
                        _ => None,
                    };
                    if let Some((opcode, payload)) = reply {
                        let mut out = Vec::new();
                        qp_ws::frame::encode_frame(&mut out, opcode, &payload, true, None)
                            .unwrap();
                        if socket.write_all(&out).await.is_err() {
                            return;
                        }
                    }
                }
                match socket.read(&mut chunk).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => decoder.push_bytes(&chunk[..n]),
                }
            }
        });
    }
}

fn spawn_echo_server() -> (std::net::SocketAddr, tokio::runtime::Runtime) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let listener = runtime.block_on(TcpListener::bind("127.0.0.1:0")).unwrap();
    let addr = listener.local_addr().unwrap();
    runtime.spawn(run_server(listener));
    (addr, runtime)
}

#[test]
fn upgrade_send_receive_and_close() {
    let (addr, _server) = spawn_echo_server();

    let mut endpoint = WsEndpoint::connect(
        &format!("ws://127.0.0.1:{}/live", addr.port()),
        &[],
        WsOptions::default(),
    )
    .unwrap();
    assert_eq!(endpoint.status(), WsState::Open);

    endpoint.send(b"round and round", true).unwrap();
    let echoed = endpoint.receive(5_000).unwrap().expect("echo reply");
    assert_eq!(echoed, b"round and round");

    // Zero timeout returns immediately when nothing is buffered.
    assert!(endpoint.receive(0).unwrap().is_none());

    endpoint.close(1000, "done").unwrap();
    assert_eq!(endpoint.status(), WsState::Closed);
    assert!(matches!(
        endpoint.receive(0),
        Err(WsError::Closed { .. })
    ));
}

#[test]
fn ping_is_answered_by_pong() {
    let (addr, _server) = spawn_echo_server();

    let mut endpoint = WsEndpoint::connect(
        &format!("ws://127.0.0.1:{}/", addr.port()),
        &[],
        WsOptions {
            ping_interval: Duration::from_millis(50),
            pong_timeout: Duration::from_secs(5),
            ..WsOptions::default()
        },
    )
    .unwrap();

    endpoint.ping(b"probe").unwrap();
    // No data message arrives, but the pong must keep the endpoint open
    // through several keep-alive rounds.
    assert!(endpoint.receive(300).unwrap().is_none());
    assert_eq!(endpoint.status(), WsState::Open);

    endpoint.send(b"after-ping", false).unwrap();
    assert_eq!(
        endpoint.receive(5_000).unwrap().expect("echo"),
        b"after-ping"
    );
}

#[test]
fn oversized_ping_payload_is_rejected() {
    let (addr, _server) = spawn_echo_server();
    let mut endpoint = WsEndpoint::connect(
        &format!("ws://127.0.0.1:{}/", addr.port()),
        &[],
        WsOptions::default(),
    )
    .unwrap();
    let err = endpoint.ping(&[0u8; 126]).unwrap_err();
    assert!(matches!(err, WsError::Protocol(_)));
}
