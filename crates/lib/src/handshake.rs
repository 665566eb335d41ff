//! Offer/answer store for the two-phase SDP handshake, keyed by device id.
//!
//! A new offer starts a new negotiation and clears any answer left from the previous one.
//! Slots never expire on their own.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Offer and answer for one device; either may be empty.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandshakeSlot {
    pub offer: Option<Value>,
    pub answer: Option<Value>,
}

/// In-memory store of handshake slots (set, get, clear).
pub struct HandshakeStore {
    inner: Arc<RwLock<HashMap<String, HandshakeSlot>>>,
}

impl Default for HandshakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Store `sdp` as the device's offer and drop any previous answer.
    pub async fn set_offer(&self, device_id: impl Into<String>, sdp: Value) {
        let mut g = self.inner.write().await;
        let slot = g.entry(device_id.into()).or_default();
        slot.offer = Some(sdp);
        slot.answer = None;
    }

    pub async fn set_answer(&self, device_id: impl Into<String>, sdp: Value) {
        let mut g = self.inner.write().await;
        g.entry(device_id.into()).or_default().answer = Some(sdp);
    }

    pub async fn get_offer(&self, device_id: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .get(device_id)
            .and_then(|s| s.offer.clone())
    }

    pub async fn get_answer(&self, device_id: &str) -> Option<Value> {
        self.inner
            .read()
            .await
            .get(device_id)
            .and_then(|s| s.answer.clone())
    }

    pub async fn slot(&self, device_id: &str) -> Option<HandshakeSlot> {
        self.inner.read().await.get(device_id).cloned()
    }

    /// Forget the device's slot entirely. Returns whether one existed.
    pub async fn clear(&self, device_id: &str) -> bool {
        self.inner.write().await.remove(device_id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}
