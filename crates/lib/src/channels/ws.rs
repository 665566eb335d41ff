//! WebSocket-backed channel: frames go into a bounded queue drained by the socket's writer task.

use crate::channels::handle::{ChannelError, ChannelHandle, ClosedSignal};
use async_trait::async_trait;
use axum::extract::ws::Message;
use tokio::sync::{mpsc, watch};

pub struct WsChannel {
    outbound: mpsc::Sender<Message>,
    closed: watch::Sender<bool>,
}

impl WsChannel {
    /// Create the channel and the receiving end of its outbound queue (`buffer` frames deep).
    /// The caller owns the socket sink and forwards everything from the receiver into it.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        (Self { outbound, closed }, rx)
    }

    pub fn closed_signal(&self) -> ClosedSignal {
        ClosedSignal::new(self.closed.subscribe())
    }
}

#[async_trait]
impl ChannelHandle for WsChannel {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        self.outbound
            .send(Message::Text(text.to_string()))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow() || self.outbound.is_closed()
    }
}
