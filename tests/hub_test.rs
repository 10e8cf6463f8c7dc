//! Integration tests for the hub gateway: WebSocket connect/auth, the
//! frame dispatch loop, SSE delivery, and per-frame rejection of bad
//! signatures.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use linehub::auth;
use linehub::dispatch::{self, MSG_ECHO, MSG_PING, STATUS_OK, STATUS_UNSUPPORTED};
use linehub::hub::{BoundedPool, Hub, HubConfig, HubEvents};
use linehub::packet::{HmacSha256Signer, Marshaler, PacketProtocol};
use linehub::routes;
use linehub::state::AppState;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    hub: Hub,
    secret: Vec<u8>,
    protocol: PacketProtocol,
}

impl TestServer {
    fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/ws?token={}", self.addr, token)
    }

    fn sse_url(&self, token: &str) -> String {
        format!("http://{}/events?token={}", self.addr, token)
    }

    fn token(&self, user: &str, line: &str, platform: &str) -> String {
        auth::issue_session_token(&self.secret, user, line, platform)
            .expect("Failed to issue session token")
    }
}

/// Start a hub gateway on a random port with the given frame codec.
async fn start_test_server(protocol: PacketProtocol) -> TestServer {
    let secret: Vec<u8> = (0u8..32).collect();

    let cfg = HubConfig {
        sse_heartbeat: Duration::from_secs(1),
        ..HubConfig::default()
    };
    let pool = BoundedPool::new(256);
    let (hub, events) = Hub::new(cfg, pool).expect("Failed to build hub");
    let HubEvents {
        messages,
        mut registered,
        mut unregistered,
        mut errors,
    } = events;

    // Business-logic side: frame dispatcher plus an event drain.
    tokio::spawn(dispatch::run_dispatcher(
        hub.clone(),
        protocol.clone(),
        messages,
    ));
    tokio::spawn(async move {
        loop {
            tokio::select! {
                r = registered.recv() => if r.is_none() { break },
                u = unregistered.recv() => if u.is_none() { break },
                e = errors.recv() => if e.is_none() { break },
            }
        }
    });

    let state = AppState {
        hub: hub.clone(),
        protocol: protocol.clone(),
        session_secret: secret.clone(),
    };
    let app = routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        hub,
        secret,
        protocol,
    }
}

fn msgpack_protocol() -> PacketProtocol {
    PacketProtocol::new(Some(Marshaler::MessagePack))
}

/// Read binary frames until one arrives, skipping control messages.
async fn next_binary<S>(ws: &mut S) -> Vec<u8>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match timeout(WAIT, ws.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => return data.to_vec(),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            other => panic!("expected a binary frame, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_ws_ping_and_echo() {
    let server = start_test_server(msgpack_protocol()).await;
    let token = server.token("alice", "phone", "ios");

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&token))
        .await
        .expect("WebSocket connect failed");

    // Ping: empty payload, status OK comes back with the same request id.
    let ping = server
        .protocol
        .encode_request::<()>(MSG_PING, 7, None)
        .unwrap();
    ws.send(Message::Binary(ping.to_vec().into())).await.unwrap();

    let reply = next_binary(&mut ws).await;
    let packet = server.protocol.decode_response(&reply).unwrap();
    assert_eq!(packet.meta.msg_type, MSG_PING);
    assert_eq!(packet.meta.request_id, 7);
    assert_eq!(packet.status, STATUS_OK);

    // Echo: payload comes back unchanged.
    let payload = json!({"text": "hello", "seq": 1});
    let echo = server
        .protocol
        .encode_request(MSG_ECHO, 8, Some(&payload))
        .unwrap();
    ws.send(Message::Binary(echo.to_vec().into())).await.unwrap();

    let reply = next_binary(&mut ws).await;
    let packet = server.protocol.decode_response(&reply).unwrap();
    assert_eq!(packet.meta.request_id, 8);
    assert_eq!(packet.status, STATUS_OK);
    assert_eq!(packet.payload::<serde_json::Value>().unwrap(), payload);
}

#[tokio::test]
async fn test_ws_unsupported_message_type() {
    let server = start_test_server(msgpack_protocol()).await;
    let token = server.token("alice", "phone", "ios");

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&token))
        .await
        .unwrap();

    let frame = server.protocol.encode_request::<()>(200, 1, None).unwrap();
    ws.send(Message::Binary(frame.to_vec().into())).await.unwrap();

    let reply = next_binary(&mut ws).await;
    let packet = server.protocol.decode_response(&reply).unwrap();
    assert_eq!(packet.meta.msg_type, 200);
    assert_eq!(packet.status, STATUS_UNSUPPORTED);
}

#[tokio::test]
async fn test_ws_invalid_token_closes_with_4002() {
    let server = start_test_server(msgpack_protocol()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url("garbage"))
        .await
        .expect("upgrade should succeed before the close frame");

    match timeout(WAIT, ws.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => {
            assert_eq!(u16::from(frame.code), 4002);
        }
        other => panic!("expected close frame, got {:?}", other),
    }
}

#[tokio::test]
async fn test_ws_text_frame_is_protocol_violation() {
    let server = start_test_server(msgpack_protocol()).await;
    let token = server.token("alice", "phone", "ios");

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&token))
        .await
        .unwrap();

    ws.send(Message::Text("not binary".into())).await.unwrap();

    // The line closes: expect a close frame or the stream ending.
    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(_)) => break,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "connection was not closed on a text frame");
}

#[tokio::test]
async fn test_bad_signature_rejected_without_closing_line() {
    let signed = msgpack_protocol()
        .with_signer(Arc::new(HmacSha256Signer::new(b"server-key".to_vec())));
    let server = start_test_server(signed).await;
    let token = server.token("alice", "phone", "ios");

    let (mut ws, _) = tokio_tungstenite::connect_async(server.ws_url(&token))
        .await
        .unwrap();

    // Frame signed with the wrong key: silently rejected, no reply.
    let mallory = msgpack_protocol()
        .with_signer(Arc::new(HmacSha256Signer::new(b"wrong-key".to_vec())));
    let bad = mallory.encode_request::<()>(MSG_PING, 1, None).unwrap();
    ws.send(Message::Binary(bad.to_vec().into())).await.unwrap();

    // The line survives: a correctly signed ping still gets its reply.
    let good = server
        .protocol
        .encode_request::<()>(MSG_PING, 2, None)
        .unwrap();
    ws.send(Message::Binary(good.to_vec().into())).await.unwrap();

    let reply = next_binary(&mut ws).await;
    let packet = server.protocol.decode_response(&reply).unwrap();
    assert_eq!(packet.meta.request_id, 2);
    assert_eq!(packet.status, STATUS_OK);
}

#[tokio::test]
async fn test_ws_connection_tracked_in_registry() {
    let server = start_test_server(msgpack_protocol()).await;
    let token = server.token("bob", "laptop", "desktop");

    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url(&token))
        .await
        .unwrap();

    // Registration is asynchronous; poll until the registry reflects it.
    timeout(WAIT, async {
        while server.hub.get_user_line("bob", "laptop").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("line never registered");
    assert_eq!(server.hub.connection_count(), 1);

    drop(ws);
    timeout(WAIT, async {
        while server.hub.get_user_lines("bob").is_some() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("line never unregistered");
    assert_eq!(server.hub.connection_count(), 0);
}

#[tokio::test]
async fn test_sse_receives_pushed_frames() {
    let server = start_test_server(msgpack_protocol()).await;
    let token = server.token("carol", "tab-1", "web");

    let response = reqwest::get(server.sse_url(&token)).await.unwrap();
    assert!(response.status().is_success());
    let mut body = response.bytes_stream();

    // Wait until the SSE line is live, then push to it.
    timeout(WAIT, async {
        while server.hub.get_user_line("carol", "tab-1").is_none() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("SSE line never registered");

    server
        .hub
        .push_message(
            vec!["carol".to_string()],
            bytes::Bytes::from_static(b"hello stream"),
        )
        .unwrap();

    let received = timeout(WAIT, async {
        let mut text = String::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.unwrap();
            text.push_str(&String::from_utf8_lossy(&chunk));
            if text.contains("data: hello stream") {
                return text;
            }
        }
        text
    })
    .await
    .expect("never received the pushed SSE event");
    assert!(received.contains("data: hello stream"));
}

#[tokio::test]
async fn test_sse_invalid_token_is_unauthorized() {
    let server = start_test_server(msgpack_protocol()).await;
    let response = reqwest::get(server.sse_url("garbage")).await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_healthz_reports_connections() {
    let server = start_test_server(msgpack_protocol()).await;
    let response = reqwest::get(format!("http://{}/healthz", server.addr))
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 0);
}
