//! In-process channel: frames land in an unbounded queue the embedder reads from.
//! Used to attach endpoints living in the same process, and throughout the tests.

use crate::channels::handle::{ChannelError, ChannelHandle, ClosedSignal};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Open,
    /// Every send fails as if the peer had gone away.
    Failing,
    /// Every send blocks forever, like a peer that stopped reading.
    Stalled,
}

pub struct MemoryChannel {
    tx: mpsc::UnboundedSender<String>,
    closed: watch::Sender<bool>,
    mode: Mode,
}

impl MemoryChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        Self::with_mode(Mode::Open)
    }

    pub fn failing() -> Self {
        Self::with_mode(Mode::Failing).0
    }

    pub fn stalled() -> Self {
        Self::with_mode(Mode::Stalled).0
    }

    fn with_mode(mode: Mode) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        (Self { tx, closed, mode }, rx)
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal::new(self.closed.subscribe())
    }
}

#[async_trait]
impl ChannelHandle for MemoryChannel {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        match self.mode {
            Mode::Open => self
                .tx
                .send(text.to_string())
                .map_err(|_| ChannelError::Closed),
            Mode::Failing => Err(ChannelError::Closed),
            Mode::Stalled => std::future::pending().await,
        }
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
