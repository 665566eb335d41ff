//! Message router: delivers an envelope to the connection named by its `target`.
//!
//! The router performs no identity policy (self-targeting is fine); it only stamps `sender`,
//! delivers, and reports failures back to the sender as `error` envelopes.

use crate::channels::{Connection, ConnectionRegistry};
use crate::envelope::Envelope;
use crate::error::HubError;
use std::sync::Arc;
use std::time::Duration;

pub struct Router {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Router {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Route `envelope` from `sender_id` to its target.
    ///
    /// On failure the sender gets exactly one `error` envelope and the error is returned for
    /// logging; the caller never has to report it again.
    pub async fn route(&self, mut envelope: Envelope, sender_id: &str) -> Result<(), HubError> {
        envelope.sender = Some(sender_id.to_string());
        let result = match envelope.target.as_deref() {
            None => Err(HubError::MalformedMessage(format!(
                "{} envelope has no target",
                envelope.typ
            ))),
            Some(target) => match self.registry.lookup(target).await {
                None => Err(HubError::TargetNotFound(target.to_string())),
                Some(conn) => self.forward(&envelope, &conn).await,
            },
        };
        if let Err(ref e) = result {
            log::debug!("route {} from {} failed: {}", envelope.typ, sender_id, e);
            self.report_error(
                sender_id,
                e,
                Some(&envelope.typ),
                envelope.target.as_deref(),
                envelope.correlation_id.clone(),
            )
            .await;
        }
        result
    }

    /// Serialize and send `envelope` to `conn` as-is. A connection that fails the send is evicted.
    pub async fn forward(&self, envelope: &Envelope, conn: &Connection) -> Result<(), HubError> {
        let text = envelope.encode()?;
        match conn.send_within(&text, self.send_timeout).await {
            Ok(()) => Ok(()),
            Err(e) => {
                log::warn!("send to {} failed ({}), evicting", conn.id(), e);
                self.registry.evict(conn).await;
                Err(HubError::ConnectionLost(conn.id().to_string()))
            }
        }
    }

    /// Best-effort delivery of an `error` envelope to `recipient_id`. Failures are only logged.
    pub async fn report_error(
        &self,
        recipient_id: &str,
        err: &HubError,
        original_type: Option<&str>,
        target: Option<&str>,
        correlation_id: Option<String>,
    ) {
        let Some(conn) = self.registry.lookup(recipient_id).await else {
            log::debug!("error for {} dropped, sender already gone: {}", recipient_id, err);
            return;
        };
        let envelope = Envelope::error(err, original_type, target, correlation_id)
            .with_target(recipient_id);
        if let Err(e) = self.forward(&envelope, &conn).await {
            log::debug!("could not report error to {}: {}", recipient_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{MemoryChannel, Role};
    use crate::envelope::EnvelopeKind;
    use serde_json::json;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn attach(
        registry: &ConnectionRegistry,
        id: &str,
        role: Role,
    ) -> UnboundedReceiver<String> {
        let (ch, rx) = MemoryChannel::new();
        registry.register(id, role, Arc::new(ch)).await;
        rx
    }

    fn router(registry: &Arc<ConnectionRegistry>) -> Router {
        Router::new(registry.clone(), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn delivers_once_with_sender_stamped() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut browser = attach(&registry, "browser", Role::Viewer).await;
        let mut device = attach(&registry, "pi-1", Role::Device).await;
        let router = router(&registry);

        let env = Envelope::new(EnvelopeKind::IceCandidate, json!({"candidate": "c1"}))
            .with_target("pi-1")
            .with_sender("spoofed");
        router.route(env, "browser").await.unwrap();

        let got = Envelope::decode(&device.try_recv().unwrap()).unwrap();
        assert_eq!(got.sender.as_deref(), Some("browser"));
        assert_eq!(got.payload, json!({"candidate": "c1"}));
        assert!(device.try_recv().is_err());
        assert!(browser.try_recv().is_err());
    }

    #[tokio::test]
    async fn absent_target_yields_one_error_to_sender_only() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut browser = attach(&registry, "browser", Role::Viewer).await;
        let mut bystander = attach(&registry, "pi-2", Role::Device).await;
        let router = router(&registry);

        let env = Envelope::new(EnvelopeKind::Offer, json!("v=0")).with_target("pi-1");
        let err = router.route(env, "browser").await.unwrap_err();
        assert_eq!(err, HubError::TargetNotFound("pi-1".into()));

        let reply = Envelope::decode(&browser.try_recv().unwrap()).unwrap();
        assert_eq!(reply.kind(), EnvelopeKind::Error);
        assert_eq!(reply.payload["code"], "target_not_found");
        assert!(browser.try_recv().is_err());
        assert!(bystander.try_recv().is_err());
    }

    #[tokio::test]
    async fn self_targeting_is_delivered() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut me = attach(&registry, "loop", Role::ProxyClient).await;
        let router = router(&registry);

        let env = Envelope::new(EnvelopeKind::Other, json!(1)).with_target("loop");
        router.route(env, "loop").await.unwrap();
        let got = Envelope::decode(&me.try_recv().unwrap()).unwrap();
        assert_eq!(got.sender.as_deref(), Some("loop"));
    }

    #[tokio::test]
    async fn failed_send_evicts_target_and_reports() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut browser = attach(&registry, "browser", Role::Viewer).await;
        registry
            .register("pi-1", Role::Device, Arc::new(MemoryChannel::failing()))
            .await;
        let router = router(&registry);

        let env = Envelope::new(EnvelopeKind::Offer, json!("v=0")).with_target("pi-1");
        assert!(router.route(env, "browser").await.is_err());
        assert!(registry.lookup("pi-1").await.is_none());
        let reply = Envelope::decode(&browser.try_recv().unwrap()).unwrap();
        assert_eq!(reply.payload["code"], "connection_lost");
    }

    #[tokio::test]
    async fn stalled_target_times_out() {
        let registry = Arc::new(ConnectionRegistry::new());
        let _browser = attach(&registry, "browser", Role::Viewer).await;
        registry
            .register("pi-1", Role::Device, Arc::new(MemoryChannel::stalled()))
            .await;
        let router = Router::new(registry.clone(), Duration::from_millis(50));

        let env = Envelope::new(EnvelopeKind::Offer, json!("v=0")).with_target("pi-1");
        let err = router.route(env, "browser").await.unwrap_err();
        assert_eq!(err, HubError::ConnectionLost("pi-1".into()));
    }

    #[tokio::test]
    async fn missing_target_is_reported_as_malformed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut browser = attach(&registry, "browser", Role::Viewer).await;
        let router = router(&registry);

        let env = Envelope::new(EnvelopeKind::IceCandidate, json!({}));
        assert!(matches!(
            router.route(env, "browser").await,
            Err(HubError::MalformedMessage(_))
        ));
        let reply = Envelope::decode(&browser.try_recv().unwrap()).unwrap();
        assert_eq!(reply.payload["code"], "malformed_message");
    }
}
