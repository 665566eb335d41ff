//! One-to-many delivery of a single envelope (device → viewers streaming).
//!
//! Sends to all recipients run concurrently, each bounded by the send timeout, so one slow
//! viewer never holds up the others. Recipients whose send fails are evicted in one batch
//! after the pass; partial delivery is the normal outcome under churn.

use crate::channels::{Connection, ConnectionRegistry, Role};
use crate::envelope::Envelope;
use crate::error::HubError;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of one broadcast pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Ids removed from the registry because their send failed.
    pub evicted: Vec<String>,
}

pub struct Fanout {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Fanout {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Send `envelope` to every Viewer currently registered, except `exclude_id`.
    pub async fn broadcast(
        &self,
        envelope: &Envelope,
        exclude_id: Option<&str>,
    ) -> Result<BroadcastReport, HubError> {
        let recipients: Vec<Arc<Connection>> = self
            .registry
            .snapshot(Some(Role::Viewer))
            .await
            .into_iter()
            .filter(|c| exclude_id != Some(c.id()))
            .collect();
        self.broadcast_to(envelope, recipients).await
    }

    /// Send `envelope` to an explicit recipient set.
    pub async fn broadcast_to(
        &self,
        envelope: &Envelope,
        recipients: Vec<Arc<Connection>>,
    ) -> Result<BroadcastReport, HubError> {
        if recipients.is_empty() {
            return Ok(BroadcastReport::default());
        }
        let text = envelope.encode()?;
        let timeout = self.send_timeout;
        let results = join_all(recipients.iter().map(|conn| {
            let text = text.as_str();
            async move { conn.send_within(text, timeout).await }
        }))
        .await;

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (conn, result) in recipients.into_iter().zip(results) {
            match result {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("broadcast {} to {} failed: {}", envelope.typ, conn.id(), e);
                    failed.push(conn);
                }
            }
        }
        let evicted = self.registry.evict_all(&failed).await;
        if !evicted.is_empty() {
            log::info!("broadcast evicted {} viewer(s): {:?}", evicted.len(), evicted);
        }
        Ok(BroadcastReport { delivered, evicted })
    }
}
