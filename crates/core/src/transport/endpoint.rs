use crate::{
    message::{Ack, ClockMessage, DeliverClockMessage, MachineId},
    node::InboundQueue,
};

/// Server side of `DeliverClockMessage` for one machine.
///
/// Validates the request and deposits it into the machine's inbound queue. It never
/// touches the logical clock; the clock only moves when the tick loop dequeues.
#[derive(Clone, Debug)]
pub struct NetworkEndpoint {
    owner: MachineId,
    queue: InboundQueue,
}

impl NetworkEndpoint {
    pub fn new(owner: MachineId, queue: InboundQueue) -> Self {
        Self { owner, queue }
    }

    pub fn owner(&self) -> &MachineId {
        &self.owner
    }

    pub fn deliver(&self, request: DeliverClockMessage) -> Ack {
        match ClockMessage::try_from(request) {
            Ok(msg) => {
                tracing::trace!(
                    machine = %self.owner,
                    from = %msg.sender_id,
                    clock = msg.logical_clock,
                    "Message enqueued"
                );
                self.queue.enqueue(msg);
                Ack::received()
            }
            Err(err) => {
                tracing::warn!(machine = %self.owner, error = %err, "Rejected malformed message");
                Ack::rejected()
            }
        }
    }
}
