//! Inbound queue between a transport's receive path and the dispatcher.

use std::time::Duration;

use tokio::sync::{Mutex, mpsc, watch};

use crate::ports::TransportMessage;

/// Unbounded FIFO of inbound messages that keeps broker delivery order.
///
/// [`close`](Self::close) wakes every pending [`next`](Self::next) call.
pub struct Inbox {
    sender: mpsc::UnboundedSender<TransportMessage>,
    receiver: Mutex<mpsc::UnboundedReceiver<TransportMessage>>,
    closed: watch::Sender<bool>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            closed,
        }
    }

    /// Queue a message. Returns `false` once the inbox is closed.
    pub fn push(&self, message: TransportMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.send(message).is_ok()
    }

    /// Wait up to `timeout` for the next message.
    pub async fn next(&self, timeout: Duration) -> Option<TransportMessage> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        let wait = async {
            let mut receiver = self.receiver.lock().await;
            tokio::select! {
                message = receiver.recv() => message,
                _ = closed.changed() => None,
            }
        };
        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Stop accepting messages and wake every waiter.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
