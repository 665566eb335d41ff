//! Channel capability: send one frame, close, observe closure.
//!
//! The receive side stays with whoever owns the transport (the per-connection task);
//! the hub only needs to push frames and to close.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::watch;

/// Failure to hand a frame to a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Send handle to one remote endpoint.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Queue one text frame for the remote endpoint. Frames on one channel are delivered in order.
    async fn send(&self, text: &str) -> Result<(), ChannelError>;

    /// Close the channel. Idempotent; wakes every [`ClosedSignal`] of this channel.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Resolves once the owning channel has been closed (or dropped).
pub struct ClosedSignal(watch::Receiver<bool>);

impl ClosedSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self(rx)
    }

    pub async fn wait(&mut self) {
        let _ = self.0.wait_for(|closed| *closed).await;
    }
}
