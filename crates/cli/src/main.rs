use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use junction::envelope::{Envelope, EnvelopeKind};
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "junction")]
#[command(about = "Junction relay hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and a default config file.
    Init {
        /// Config file path (default: JUNCTION_CONFIG_PATH or ~/.junction/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the hub (HTTP + WebSocket on one port).
    Serve {
        /// Config file path (default: JUNCTION_CONFIG_PATH or ~/.junction/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// WebSocket and HTTP port (default from config or 8080)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Print the status snapshot of a running hub.
    Status {
        /// Config file path (default: JUNCTION_CONFIG_PATH or ~/.junction/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Send one proxy request to a device through a running hub and print the response.
    Proxy {
        /// Config file path (default: JUNCTION_CONFIG_PATH or ~/.junction/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Target device id
        #[arg(long, short)]
        device: String,

        /// Request payload as JSON (default: {})
        #[arg(value_name = "JSON")]
        payload: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("junction {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("hub failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Status { config }) => {
            if let Err(e) = run_status(config).await {
                log::error!("status failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Proxy {
            config,
            device,
            payload,
        }) => {
            if let Err(e) = run_proxy(config, device, payload).await {
                log::error!("proxy failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(junction::config::default_config_path);
    let dir = junction::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = junction::config::load_config(config_path)?;
    if let Some(p) = port {
        config.hub.port = p;
    }
    log::info!(
        "starting hub on {}:{} (config {})",
        config.hub.bind,
        config.hub.port,
        path.display()
    );
    junction::gateway::run_hub(config).await
}

/// A WebSocket session with the hub as a proxy client.
struct HubClient {
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

impl HubClient {
    async fn connect(config_path: Option<std::path::PathBuf>) -> anyhow::Result<Self> {
        let (config, _) = junction::config::load_config(config_path)?;
        let request = hub_request(&config, &format!("cli-{}", std::process::id()))?;
        let (ws, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("connecting to hub on port {}: {}", config.hub.port, e))?;
        Ok(Self { ws })
    }

    async fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        self.ws.send(Message::Text(envelope.encode()?)).await?;
        Ok(())
    }

    /// Wait for the first envelope of one of `kinds`.
    async fn recv(&mut self, kinds: &[EnvelopeKind]) -> anyhow::Result<Envelope> {
        while let Some(msg) = self.ws.next().await {
            let Message::Text(text) = msg? else { continue };
            let envelope = Envelope::decode(&text)?;
            if kinds.contains(&envelope.kind()) {
                return Ok(envelope);
            }
            if envelope.kind() == EnvelopeKind::Shutdown {
                anyhow::bail!("hub is shutting down");
            }
        }
        anyhow::bail!("hub closed the connection")
    }
}

/// Upgrade request for `/ws/proxy/{client_id}`. The token travels in `Authorization: Bearer`
/// so it never needs URL encoding.
fn hub_request(config: &junction::config::Config, client_id: &str) -> anyhow::Result<Request> {
    let bind = config.hub.bind.trim();
    let host = if bind == "0.0.0.0" || bind == "::" {
        "127.0.0.1"
    } else {
        bind
    };
    let url = format!("ws://{}:{}/ws/proxy/{}", host, config.hub.port, client_id);
    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = junction::config::resolve_hub_token(config) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| anyhow::anyhow!("hub token contains characters not allowed in a header"))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }
    Ok(request)
}

async fn run_status(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let mut client = HubClient::connect(config_path).await?;
    client
        .send(&Envelope::new(EnvelopeKind::Status, serde_json::Value::Null))
        .await?;
    let reply = tokio::time::timeout(
        Duration::from_secs(5),
        client.recv(&[EnvelopeKind::Status, EnvelopeKind::Error]),
    )
    .await
    .map_err(|_| anyhow::anyhow!("no status reply within 5s"))??;
    println!("{}", serde_json::to_string_pretty(&reply.payload)?);
    Ok(())
}

async fn run_proxy(
    config_path: Option<std::path::PathBuf>,
    device: String,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload: serde_json::Value = match payload {
        Some(text) => serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?,
        None => serde_json::json!({}),
    };
    let mut client = HubClient::connect(config_path).await?;
    let request = Envelope::new(EnvelopeKind::ProxyRequest, payload)
        .with_target(device.as_str())
        .with_correlation_id(Some("cli-1".to_string()));
    client.send(&request).await?;

    let reply = client
        .recv(&[EnvelopeKind::ProxyResponse, EnvelopeKind::Error])
        .await?;
    if reply.kind() == EnvelopeKind::Error {
        let message = reply
            .payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("proxy request failed");
        anyhow::bail!("{}", message);
    }
    println!("{}", serde_json::to_string_pretty(&reply.payload)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction::config::{Config, HubAuthMode};

    #[test]
    fn token_goes_in_bearer_header_not_url() {
        let mut config = Config::default();
        config.hub.port = 9001;
        config.hub.auth.mode = HubAuthMode::Token;
        config.hub.auth.token = Some("a&b#c+d".to_string());

        let request = hub_request(&config, "cli-1").unwrap();
        assert_eq!(request.uri().to_string(), "ws://127.0.0.1:9001/ws/proxy/cli-1");
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer a&b#c+d");
    }

    #[test]
    fn wildcard_bind_connects_to_loopback_without_token() {
        let mut config = Config::default();
        config.hub.bind = "0.0.0.0".to_string();

        let request = hub_request(&config, "cli-2").unwrap();
        assert_eq!(request.uri().host(), Some("127.0.0.1"));
        assert!(request.headers().get(AUTHORIZATION).is_none());
    }
}
