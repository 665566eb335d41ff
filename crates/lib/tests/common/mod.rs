//! Shared helpers: start the hub on a free port and wait until it answers GET /.
//! The server task is left running when the test ends.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use junction::config::Config;
use junction::gateway;
use junction::Envelope;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

pub type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Start a hub with `config` (port and bind overridden) and return its port once healthy.
pub async fn start_hub(mut config: Config) -> u16 {
    let port = free_port();
    config.hub.port = port;
    config.hub.bind = "127.0.0.1".to_string();
    tokio::spawn(async move {
        let _ = gateway::run_hub(config).await;
    });

    let url = format!("http://127.0.0.1:{}/", port);
    let client = reqwest::Client::new();
    let mut last_err = None;
    for _ in 0..100 {
        match client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => return port,
            Ok(_) => {}
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "GET {} did not return 200 within 5s; last error: {:?}",
        url, last_err
    );
}

pub async fn connect(port: u16, role: &str, id: &str) -> WsClient {
    let url = format!("ws://127.0.0.1:{}/ws/{}/{}", port, role, id);
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .unwrap_or_else(|e| panic!("connect {}: {}", url, e));
    ws
}

/// Connect and wait until the hub lists `id` as registered.
pub async fn connect_registered(port: u16, role: &str, id: &str) -> WsClient {
    let ws = connect(port, role, id).await;
    wait_until_registered(port, id).await;
    ws
}

pub async fn wait_until_registered(port: u16, id: &str) {
    let url = format!("http://127.0.0.1:{}/status", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            if let Ok(status) = resp.json::<serde_json::Value>().await {
                let connections = &status["connections"];
                let listed = ["device", "viewer", "proxyClient"].iter().any(|role| {
                    connections[*role]
                        .as_array()
                        .map_or(false, |ids| ids.iter().any(|v| v == id))
                });
                if listed {
                    return;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{} was not registered within 2s", id);
}

pub async fn send(ws: &mut WsClient, envelope: serde_json::Value) {
    ws.send(Message::Text(envelope.to_string()))
        .await
        .expect("send frame");
}

/// Next text frame as an envelope, within 2s.
pub async fn recv(ws: &mut WsClient) -> Envelope {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within 2s")
            .expect("socket open")
            .expect("frame ok");
        if let Message::Text(text) = msg {
            return Envelope::decode(&text).expect("envelope");
        }
    }
}

/// True if no text frame arrives within `wait`.
pub async fn silent_for(ws: &mut WsClient, wait: Duration) -> bool {
    loop {
        match tokio::time::timeout(wait, ws.next()).await {
            Err(_) => return true,
            Ok(Some(Ok(Message::Text(_)))) => return false,
            Ok(Some(Ok(_))) => continue,
            Ok(_) => return true,
        }
    }
}
