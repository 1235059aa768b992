use crossbeam::channel::{self, Receiver, Sender, TryRecvError};

use crate::message::ClockMessage;

/// Unbounded FIFO of received messages, shared between the network listener
/// (producer) and the machine's tick loop (consumer).
///
/// Order is arrival order at this machine; there is no ordering across senders
/// beyond that. Every operation is atomic on its own.
#[derive(Clone)]
pub struct InboundQueue {
    tx: Sender<ClockMessage>,
    rx: Receiver<ClockMessage>,
}

impl InboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self { tx, rx }
    }

    /// Appends to the tail. Never blocks and never rejects.
    pub fn enqueue(&self, msg: ClockMessage) {
        // both halves live in `self`, the channel can't be disconnected here
        if let Err(err) = self.tx.send(msg) {
            tracing::error!(sender = %err.0.sender_id, "Inbound queue disconnected");
        }
    }

    /// Removes the head of the queue without blocking.
    pub fn try_dequeue(&self) -> Option<ClockMessage> {
        match self.rx.try_recv() {
            Ok(msg) => Some(msg),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundQueue")
            .field("len", &self.len())
            .finish()
    }
}
