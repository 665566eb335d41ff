//! The hub: owns the registry, router, fanout, correlator and handshake store, runs the
//! connect/disconnect lifecycle and classifies every inbound envelope.
//!
//! ```text
//!   offer / answer / ice_candidate ──► Router (offer/answer also recorded in the store)
//!   video_frame ─────────────────────► Fanout (all viewers but the sender)
//!   proxy_request (proxy client) ────► Correlator::issue ──► proxy_response back to client
//!   proxy_request (anyone else) ─────► Router
//!   proxy_response / file_chunk ─────► Correlator::resolve
//!   status ──────────────────────────► status snapshot back to sender
//!   anything else with a target ─────► Router
//! ```

use crate::channels::{ChannelHandle, Connection, ConnectionRegistry, Role};
use crate::config::RelayConfig;
use crate::correlator::Correlator;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::HubError;
use crate::fanout::Fanout;
use crate::handshake::HandshakeStore;
use crate::routing::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Connected ids grouped by role.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsByRole {
    pub device: Vec<String>,
    pub viewer: Vec<String>,
    pub proxy_client: Vec<String>,
}

/// Read-only diagnostic snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub connections: ConnectionsByRole,
    /// Live connection count per role (`device`, `viewer`, `proxy_client`).
    pub counts: BTreeMap<Role, usize>,
    pub pending_correlations: usize,
    pub handshake_slots: usize,
}

pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    router: Arc<Router>,
    fanout: Fanout,
    correlator: Correlator,
    handshakes: HandshakeStore,
    relay: RelayConfig,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Hub {
    pub fn new(relay: RelayConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(Router::new(registry.clone(), relay.send_timeout()));
        Self {
            fanout: Fanout::new(registry.clone(), relay.send_timeout()),
            correlator: Correlator::new(router.clone()),
            handshakes: HandshakeStore::new(),
            registry,
            router,
            relay,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn handshakes(&self) -> &HandshakeStore {
        &self.handshakes
    }

    pub fn relay_config(&self) -> &RelayConfig {
        &self.relay
    }

    /// Register an endpoint. Any previous connection under the same id is closed.
    pub async fn connect(
        &self,
        id: impl Into<String>,
        role: Role,
        channel: Arc<dyn ChannelHandle>,
    ) -> Arc<Connection> {
        let conn = self.registry.register(id, role, channel).await;
        log::info!("{} {} connected", conn.role(), conn.id());
        conn
    }

    /// Tear down one connection instance: unregister it (if still current), close its channel
    /// and abort the correlations it was part of. Safe to call more than once.
    pub async fn disconnect(&self, conn: &Connection) {
        let removed = self
            .registry
            .unregister(conn.id(), conn.token())
            .await
            .is_some();
        conn.close();
        let aborted = self.correlator.abort_all_for(&conn.tag());
        if removed {
            log::info!(
                "{} {} disconnected ({} pending request(s) aborted)",
                conn.role(),
                conn.id(),
                aborted
            );
        }
    }

    /// Handle one inbound frame from `conn`. Errors are reported to `conn` only.
    pub async fn dispatch(self: &Arc<Self>, conn: &Connection, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("dropping message from {}: {}", conn.id(), e);
                self.router.report_error(conn.id(), &e, None, None, None).await;
                return;
            }
        };
        log::debug!("{} from {} -> {:?}", envelope.typ, conn.id(), envelope.target);

        match envelope.kind() {
            EnvelopeKind::Offer | EnvelopeKind::Answer => self.on_handshake(conn, envelope).await,
            EnvelopeKind::VideoFrame => self.on_video_frame(conn, envelope).await,
            EnvelopeKind::ProxyRequest if conn.role() == Role::ProxyClient => {
                self.on_proxy_request(conn, envelope).await
            }
            EnvelopeKind::ProxyResponse | EnvelopeKind::FileChunk => {
                self.on_proxy_response(conn, envelope).await
            }
            EnvelopeKind::Status => self.on_status(conn).await,
            _ => {
                let _ = self.router.route(envelope, conn.id()).await;
            }
        }
    }

    /// Offers and answers are recorded under the device the negotiation belongs to (the sender
    /// when it is a device, otherwise the target) and relayed when they carry a target.
    async fn on_handshake(&self, conn: &Connection, envelope: Envelope) {
        let device_id = if conn.role() == Role::Device {
            Some(conn.id().to_string())
        } else {
            envelope.target.clone()
        };
        if let Some(ref device_id) = device_id {
            match envelope.kind() {
                EnvelopeKind::Offer => {
                    self.handshakes
                        .set_offer(device_id.as_str(), envelope.payload.clone())
                        .await
                }
                _ => {
                    self.handshakes
                        .set_answer(device_id.as_str(), envelope.payload.clone())
                        .await
                }
            }
        }
        if envelope.target.is_some() || device_id.is_none() {
            let _ = self.router.route(envelope, conn.id()).await;
        }
    }

    async fn on_video_frame(&self, conn: &Connection, mut envelope: Envelope) {
        envelope.sender = Some(conn.id().to_string());
        if let Err(e) = self.fanout.broadcast(&envelope, Some(conn.id())).await {
            log::warn!("video frame from {} not broadcast: {}", conn.id(), e);
        }
    }

    /// Runs the correlated request in its own task so the client's receive loop keeps going.
    /// The reply echoes the client's own `correlationId`; the hub's token never leaves the hub.
    async fn on_proxy_request(self: &Arc<Self>, conn: &Connection, envelope: Envelope) {
        let Some(target) = envelope.target.clone() else {
            let e = HubError::MalformedMessage("proxy_request has no target".to_string());
            self.router
                .report_error(conn.id(), &e, Some(&envelope.typ), None, envelope.correlation_id)
                .await;
            return;
        };
        let hub = self.clone();
        let origin = conn.tag();
        let client_ref = envelope.correlation_id;
        let payload = envelope.payload;
        let timeout = self.relay.proxy_timeout();
        tokio::spawn(async move {
            let reply = match hub
                .correlator
                .issue(Some(origin.clone()), &target, payload, timeout)
                .await
            {
                Ok(response) => Envelope::new(EnvelopeKind::ProxyResponse, response)
                    .with_sender(target.as_str())
                    .with_correlation_id(client_ref),
                Err(e) => {
                    log::debug!("proxy request from {} to {} failed: {}", origin.id, target, e);
                    Envelope::error(&e, Some("proxy_request"), Some(&target), client_ref)
                }
            }
            .with_target(origin.id.as_str());
            match hub.registry.lookup(&origin.id).await {
                Some(client) if client.is(&origin) => {
                    if let Err(e) = hub.router.forward(&reply, &client).await {
                        log::debug!("proxy reply to {} not delivered: {}", origin.id, e);
                    }
                }
                _ => log::debug!("proxy client {} gone before its reply", origin.id),
            }
        });
    }

    async fn on_proxy_response(&self, conn: &Connection, envelope: Envelope) {
        match envelope.correlation_id {
            Some(ref id) => {
                self.correlator.resolve(id, envelope.payload);
            }
            None => {
                let e = HubError::MalformedMessage(format!(
                    "{} has no correlationId",
                    envelope.typ
                ));
                self.router
                    .report_error(conn.id(), &e, Some(&envelope.typ), None, None)
                    .await;
            }
        }
    }

    async fn on_status(&self, conn: &Connection) {
        let status = self.status().await;
        let payload = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
        let reply = Envelope::new(EnvelopeKind::Status, payload).with_target(conn.id());
        if let Err(e) = self.router.forward(&reply, conn).await {
            log::debug!("status reply to {} not delivered: {}", conn.id(), e);
        }
    }

    /// Proxy a request on behalf of a caller that has no connection (e.g. an HTTP client).
    pub async fn proxy(
        &self,
        device_id: &str,
        request: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, HubError> {
        let timeout = timeout.unwrap_or_else(|| self.relay.proxy_timeout());
        self.correlator.issue(None, device_id, request, timeout).await
    }

    /// Store a device's offer (HTTP surface).
    pub async fn publish_offer(&self, device_id: &str, sdp: Value) {
        self.handshakes.set_offer(device_id, sdp).await;
    }

    /// Store an answer for a device and push it to the device if it is connected.
    /// Returns whether it was pushed.
    pub async fn publish_answer(&self, device_id: &str, sdp: Value) -> bool {
        self.handshakes.set_answer(device_id, sdp.clone()).await;
        let Some(device) = self.registry.lookup(device_id).await else {
            return false;
        };
        let envelope = Envelope::new(EnvelopeKind::Answer, sdp).with_target(device_id);
        self.router.forward(&envelope, &device).await.is_ok()
    }

    pub async fn status(&self) -> HubStatus {
        HubStatus {
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            connections: ConnectionsByRole {
                device: self.registry.list_ids(Some(Role::Device)).await,
                viewer: self.registry.list_ids(Some(Role::Viewer)).await,
                proxy_client: self.registry.list_ids(Some(Role::ProxyClient)).await,
            },
            counts: self.registry.counts().await.into_iter().collect(),
            pending_correlations: self.correlator.pending_count(),
            handshake_slots: self.handshakes.len().await,
        }
    }

    /// Tell every endpoint the hub is going away, then close all channels.
    pub async fn shutdown(&self) {
        let all = self.registry.snapshot(None).await;
        let notice = Envelope::new(EnvelopeKind::Shutdown, json!({}));
        match self.fanout.broadcast_to(&notice, all.clone()).await {
            Ok(report) => log::info!("shutdown notice delivered to {} endpoint(s)", report.delivered),
            Err(e) => log::debug!("shutdown notice failed: {}", e),
        }
        self.registry.evict_all(&all).await;
        for conn in &all {
            self.correlator.abort_all_for(&conn.tag());
        }
    }
}
