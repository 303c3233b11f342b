use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use crate::dispatch::{DispatchRegistry, RecordFilter, SubscriptionId};
use crate::domain::{packet_types, HciPacket, Record, SharedRecord};

/// A single-record subscription waiting for the reply to one command.
///
/// The subscription is removed from the registry when the slot is
/// dropped, whether or not a reply arrived.
pub struct ResponseSlot {
    registry: Arc<DispatchRegistry>,
    id: SubscriptionId,
    receiver: Receiver<SharedRecord>,
}

impl ResponseSlot {
    pub fn register(registry: &Arc<DispatchRegistry>, filter: RecordFilter) -> Self {
        let (id, receiver) = registry.register_queue(1, Some(filter));
        Self {
            registry: Arc::clone(registry),
            id,
            receiver,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait up to `timeout` for the matching record.
    ///
    /// `Err(Timeout)` means nothing arrived yet and the slot can be
    /// waited on again.
    pub fn wait(&self, timeout: Duration) -> Result<SharedRecord, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl Drop for ResponseSlot {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}

/// Predicate matching the controller's answer to an outbound packet.
///
/// A command is answered by the Command Complete or Command Status event
/// carrying its opcode; anything else by the next event.
pub fn default_response_filter(h4_type: u8, payload: &[u8]) -> RecordFilter {
    match (h4_type, payload) {
        (packet_types::COMMAND, [lo, hi, ..]) => {
            let opcode = u16::from_le_bytes([*lo, *hi]);
            Arc::new(move |record: &Record| record.packet.answers_opcode(opcode))
        }
        _ => Arc::new(|record: &Record| matches!(record.packet, HciPacket::Event { .. })),
    }
}
