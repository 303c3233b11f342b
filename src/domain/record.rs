//! Captured HCI records.

use std::sync::Arc;

use chrono::{DateTime, Local};

use super::HciPacket;

/// One HCI unit read from the transport, with its capture metadata.
///
/// Records are shared read-only between every subscriber they are
/// dispatched to, see [`SharedRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Decoded packet
    pub packet: HciPacket,
    /// Bytes exactly as read from the transport (H4 framed)
    pub raw: Vec<u8>,
    /// Length of the packet on the wire
    pub original_length: u32,
    /// Number of bytes kept (no truncation is done, so equal to `original_length`)
    pub captured_length: u32,
    /// btsnoop packet flags
    pub flags: u32,
    /// Packets dropped before this one
    pub drop_count: u32,
    /// Wall-clock capture time
    pub timestamp: DateTime<Local>,
}

/// A record as handed to subscribers.
pub type SharedRecord = Arc<Record>;

impl Record {
    /// Build a record for bytes that were just read.
    pub fn captured(raw: Vec<u8>, packet: HciPacket) -> Self {
        Self::captured_at(raw, packet, Local::now())
    }

    /// Build a record with an explicit capture time.
    pub fn captured_at(raw: Vec<u8>, packet: HciPacket, timestamp: DateTime<Local>) -> Self {
        let length = raw.len() as u32;
        Self {
            packet,
            raw,
            original_length: length,
            captured_length: length,
            flags: 0,
            drop_count: 0,
            timestamp,
        }
    }
}
