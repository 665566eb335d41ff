//! Proxy tunnel correlator: request/response over a fire-and-forget channel.
//!
//! `issue` registers a pending waiter under a fresh random token, forwards a `proxy_request`
//! carrying that token to the device, and suspends. The first of three events wins:
//! a matching `proxy_response` (`resolve`), the deadline, or the abort cascade when either
//! end disconnects (`abort_all_for`). Every path removes the pending entry exactly once.

use crate::channels::ConnectionTag;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::error::HubError;
use crate::routing::Router;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationState {
    Waiting,
    Resolved,
    TimedOut,
    Aborted,
}

/// What `resolve` did with a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Woke the waiting caller.
    Delivered,
    /// Unknown or already finished correlation; the response was discarded.
    Stale,
}

type Outcome = Result<Value, HubError>;

struct PendingCorrelation {
    origin: Option<ConnectionTag>,
    target: ConnectionTag,
    created_at: Instant,
    deadline: Instant,
    state: CorrelationState,
    waker: oneshot::Sender<Outcome>,
}

impl PendingCorrelation {
    fn involves(&self, tag: &ConnectionTag) -> bool {
        self.target == *tag || self.origin.as_ref() == Some(tag)
    }
}

pub struct Correlator {
    router: Arc<Router>,
    pending: Mutex<HashMap<String, PendingCorrelation>>,
}

/// Removes the entry if the issuing future is dropped before it finishes.
struct PendingGuard<'a> {
    correlator: &'a Correlator,
    correlation_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self
            .correlator
            .take(self.correlation_id, CorrelationState::Aborted)
            .is_some()
        {
            log::debug!("correlation {} cancelled by its caller", self.correlation_id);
        }
    }
}

impl Correlator {
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCorrelation>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a Waiting entry, moving it to `state`.
    fn take(&self, correlation_id: &str, state: CorrelationState) -> Option<PendingCorrelation> {
        let mut entry = self.lock().remove(correlation_id)?;
        log::debug!(
            "correlation {} for {}: {:?} -> {:?} after {:?}",
            correlation_id,
            entry.target.id,
            entry.state,
            state,
            entry.created_at.elapsed()
        );
        entry.state = state;
        Some(entry)
    }

    /// Send `request` to `target_device_id` and wait up to `timeout` for its response payload.
    pub async fn issue(
        &self,
        origin: Option<ConnectionTag>,
        target_device_id: &str,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, HubError> {
        let target = self
            .router
            .registry()
            .lookup(target_device_id)
            .await
            .ok_or_else(|| HubError::TargetNotFound(target_device_id.to_string()))?;

        let correlation_id = new_correlation_id()?;
        let (tx, mut rx) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = created_at + timeout;
        let sender = origin.as_ref().map(|o| o.id.clone());
        let origin_tag = origin.clone();
        self.lock().insert(
            correlation_id.clone(),
            PendingCorrelation {
                origin,
                target: target.tag(),
                created_at,
                deadline,
                state: CorrelationState::Waiting,
                waker: tx,
            },
        );
        let _guard = PendingGuard {
            correlator: self,
            correlation_id: &correlation_id,
        };

        // The origin may have disconnected before the entry existed; its abort cascade then
        // found nothing, so check again now that the entry is visible to it.
        if let Some(ref origin) = origin_tag {
            let current = match self.router.registry().lookup(&origin.id).await {
                Some(conn) => conn.is(origin),
                None => false,
            };
            if !current {
                if self.take(&correlation_id, CorrelationState::Aborted).is_some() {
                    log::debug!(
                        "proxy request to {} dropped, {} already gone",
                        target_device_id,
                        origin.id
                    );
                }
                return Err(HubError::ConnectionLost(origin.id.clone()));
            }
        }

        let mut envelope = Envelope::new(EnvelopeKind::ProxyRequest, request)
            .with_target(target_device_id)
            .with_correlation_id(Some(correlation_id.clone()));
        envelope.sender = sender;
        if let Err(e) = self.router.forward(&envelope, &target).await {
            self.take(&correlation_id, CorrelationState::Aborted);
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(HubError::ConnectionLost(target_device_id.to_string())),
            Err(_) => {
                if self.take(&correlation_id, CorrelationState::TimedOut).is_some() {
                    log::info!(
                        "proxy request {} to {} timed out after {:?}",
                        correlation_id,
                        target_device_id,
                        timeout
                    );
                    Err(HubError::Timeout(target_device_id.to_string()))
                } else {
                    // Resolved or aborted between the deadline firing and us taking the entry.
                    rx.try_recv()
                        .unwrap_or_else(|_| Err(HubError::Timeout(target_device_id.to_string())))
                }
            }
        }
    }

    /// Deliver a response. Never fails towards the responder; stale responses are logged and dropped.
    pub fn resolve(&self, correlation_id: &str, response: Value) -> Resolution {
        match self.take(correlation_id, CorrelationState::Resolved) {
            Some(entry) => {
                if entry.waker.send(Ok(response)).is_err() {
                    log::debug!("caller for correlation {} already gone", correlation_id);
                }
                Resolution::Delivered
            }
            None => {
                log::warn!("{}", HubError::StaleResponse(correlation_id.to_string()));
                Resolution::Stale
            }
        }
    }

    /// Abort every Waiting correlation whose origin or target is `tag`. Returns how many were woken.
    pub fn abort_all_for(&self, tag: &ConnectionTag) -> usize {
        let aborted: Vec<(String, PendingCorrelation)> = {
            let mut g = self.lock();
            let ids: Vec<String> = g
                .iter()
                .filter(|(_, p)| p.involves(tag))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| g.remove(&id).map(|p| (id, p)))
                .collect()
        };
        let count = aborted.len();
        for (id, mut entry) in aborted {
            entry.state = CorrelationState::Aborted;
            log::debug!(
                "correlation {} aborted ({} left, {:?} before deadline)",
                id,
                tag.id,
                entry.deadline.saturating_duration_since(Instant::now())
            );
            let _ = entry
                .waker
                .send(Err(HubError::ConnectionLost(tag.id.clone())));
        }
        if count > 0 {
            log::info!("aborted {} pending request(s) involving {}", count, tag.id);
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }
}

/// 128 random bits from the OS CSPRNG, hex encoded.
fn new_correlation_id() -> Result<String, HubError> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| HubError::Internal(format!("getrandom: {}", e)))?;
    Ok(bytes.iter().map(|b| format!("{:02x}", b)).collect())
}
