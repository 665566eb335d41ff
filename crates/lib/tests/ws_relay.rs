//! Integration tests over real WebSockets: relay, fanout, proxy tunnel, re-registration.

mod common;

use common::{connect, connect_registered, recv, send, silent_for, start_hub};
use futures_util::{SinkExt, StreamExt};
use junction::config::{Config, HubAuthMode};
use junction::EnvelopeKind;
use serde_json::json;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn relays_between_two_sockets_and_reports_missing_target() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;
    let mut browser = connect_registered(port, "browser", "browser").await;

    send(
        &mut browser,
        json!({"type": "ice_candidate", "target": "pi-1", "sender": "spoofed", "payload": {"candidate": "c1"}}),
    )
    .await;
    let got = recv(&mut device).await;
    assert_eq!(got.kind(), EnvelopeKind::IceCandidate);
    assert_eq!(got.sender.as_deref(), Some("browser"));
    assert_eq!(got.payload["candidate"], "c1");

    send(
        &mut browser,
        json!({"type": "offer", "target": "pi-9", "payload": "v=0"}),
    )
    .await;
    let err = recv(&mut browser).await;
    assert_eq!(err.kind(), EnvelopeKind::Error);
    assert_eq!(err.payload["code"], "target_not_found");
    assert_eq!(err.payload["target"], "pi-9");
    assert!(silent_for(&mut device, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn device_offer_over_ws_is_readable_over_http() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;

    send(&mut device, json!({"type": "offer", "payload": "v=0..."})).await;

    let client = reqwest::Client::new();
    let url = format!("http://127.0.0.1:{}/offer/pi-1", port);
    for _ in 0..50 {
        let resp = client.get(&url).send().await.unwrap();
        if resp.status().is_success() {
            let offer: serde_json::Value = resp.json().await.unwrap();
            assert_eq!(offer, json!("v=0..."));

            client
                .post(format!("http://127.0.0.1:{}/answer/pi-1", port))
                .body("v=0-answer")
                .send()
                .await
                .unwrap();
            let answer = recv(&mut device).await;
            assert_eq!(answer.kind(), EnvelopeKind::Answer);
            assert_eq!(answer.payload, json!("v=0-answer"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("offer from device never reached the store");
}

#[tokio::test]
async fn http_proxy_is_answered_by_ws_device() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;

    let call = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/proxy/pi-1", port))
            .json(&json!({"path": "/status"}))
            .send()
            .await
            .unwrap()
    });

    let request = recv(&mut device).await;
    assert_eq!(request.kind(), EnvelopeKind::ProxyRequest);
    assert_eq!(request.payload["path"], "/status");
    let token = request.correlation_id.expect("correlation id");
    send(
        &mut device,
        json!({"type": "proxy_response", "correlationId": token, "payload": {"x": 1}}),
    )
    .await;

    let resp = call.await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body, json!({"x": 1}));
}

#[tokio::test]
async fn http_proxy_times_out_on_silent_device() {
    let port = start_hub(Config::default()).await;
    let _device = connect_registered(port, "device", "pi-1").await;

    let started = std::time::Instant::now();
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/proxy/pi-1?timeoutMs=200", port))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 504);
    assert!(started.elapsed() >= Duration::from_millis(200));
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "timeout");
}

#[tokio::test]
async fn device_disconnect_fails_pending_proxy_promptly() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;

    let call = tokio::spawn(async move {
        reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/proxy/pi-1", port))
            .json(&json!({}))
            .send()
            .await
            .unwrap()
    });
    recv(&mut device).await;
    device.close(None).await.unwrap();

    let resp = tokio::time::timeout(Duration::from_secs(3), call)
        .await
        .expect("proxy fails well before its 30s deadline")
        .unwrap();
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "connection_lost");
}

#[tokio::test]
async fn video_frames_reach_every_viewer_but_not_the_device() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;
    let mut v1 = connect_registered(port, "viewer", "v1").await;
    let mut v2 = connect_registered(port, "viewer", "v2").await;

    for seq in 0..3 {
        send(
            &mut device,
            json!({"type": "video_frame", "payload": {"seq": seq}}),
        )
        .await;
    }
    for viewer in [&mut v1, &mut v2] {
        for seq in 0..3 {
            let frame = recv(viewer).await;
            assert_eq!(frame.kind(), EnvelopeKind::VideoFrame);
            assert_eq!(frame.sender.as_deref(), Some("pi-1"));
            assert_eq!(frame.payload["seq"], seq);
        }
    }
    assert!(silent_for(&mut device, Duration::from_millis(200)).await);
}

#[tokio::test]
async fn proxy_client_socket_round_trip() {
    let port = start_hub(Config::default()).await;
    let mut device = connect_registered(port, "device", "pi-1").await;
    let mut cli = connect_registered(port, "proxy", "cli").await;

    send(
        &mut cli,
        json!({"type": "proxy_request", "target": "pi-1", "correlationId": "mine-1", "payload": {"op": "ls"}}),
    )
    .await;
    let request = recv(&mut device).await;
    assert_eq!(request.sender.as_deref(), Some("cli"));
    let token = request.correlation_id.unwrap();
    assert_ne!(token, "mine-1");

    send(
        &mut device,
        json!({"type": "file_chunk", "correlationId": token, "payload": {"chunk": 0, "data": "aGk="}}),
    )
    .await;
    let reply = recv(&mut cli).await;
    assert_eq!(reply.kind(), EnvelopeKind::ProxyResponse);
    assert_eq!(reply.correlation_id.as_deref(), Some("mine-1"));
    assert_eq!(reply.payload["data"], "aGk=");
}

#[tokio::test]
async fn reconnecting_with_same_id_closes_the_old_socket() {
    let port = start_hub(Config::default()).await;
    let mut old = connect_registered(port, "device", "pi-1").await;
    let mut new = connect(port, "device", "pi-1").await;

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match old.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "old socket was not closed");

    // The new registration still works after the old one's cleanup ran.
    let mut browser = connect_registered(port, "viewer", "browser").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send(
        &mut browser,
        json!({"type": "ice_candidate", "target": "pi-1", "payload": {}}),
    )
    .await;
    assert_eq!(recv(&mut new).await.sender.as_deref(), Some("browser"));
    let _ = new.send(Message::Close(None)).await;
}

#[tokio::test]
async fn malformed_frame_gets_error_and_socket_stays_open() {
    let port = start_hub(Config::default()).await;
    let mut viewer = connect_registered(port, "viewer", "browser").await;

    viewer
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    let err = recv(&mut viewer).await;
    assert_eq!(err.payload["code"], "malformed_message");

    send(&mut viewer, json!({"type": "status"})).await;
    let status = recv(&mut viewer).await;
    assert_eq!(status.kind(), EnvelopeKind::Status);
    assert_eq!(status.payload["connections"]["viewer"], json!(["browser"]));
}

#[tokio::test]
async fn binary_frame_gets_error_and_socket_stays_open() {
    let port = start_hub(Config::default()).await;
    let mut viewer = connect_registered(port, "viewer", "browser").await;

    viewer
        .send(Message::Binary(vec![0xde, 0xad, 0xbe, 0xef]))
        .await
        .unwrap();
    let err = recv(&mut viewer).await;
    assert_eq!(err.kind(), EnvelopeKind::Error);
    assert_eq!(err.payload["code"], "malformed_message");

    send(&mut viewer, json!({"type": "status"})).await;
    let status = recv(&mut viewer).await;
    assert_eq!(status.kind(), EnvelopeKind::Status);
    assert_eq!(status.payload["connections"]["viewer"], json!(["browser"]));
}

#[tokio::test]
async fn bearer_token_with_reserved_characters_authorizes_upgrade() {
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};

    let mut config = Config::default();
    config.hub.auth.mode = HubAuthMode::Token;
    config.hub.auth.token = Some("a&b#c+d".to_string());
    let port = start_hub(config).await;

    let url = format!("ws://127.0.0.1:{}/ws/proxy/cli", port);
    let mut request = url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert(AUTHORIZATION, HeaderValue::from_static("Bearer a&b#c+d"));
    let (mut cli, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    send(&mut cli, json!({"type": "status"})).await;
    let status = recv(&mut cli).await;
    assert_eq!(status.payload["connections"]["proxyClient"], json!(["cli"]));

    // The same token pasted raw into the query string is cut at '&' and rejected.
    let raw = format!("ws://127.0.0.1:{}/ws/proxy/cli2?token=a&b#c+d", port);
    assert!(tokio_tungstenite::connect_async(raw.as_str()).await.is_err());
}
