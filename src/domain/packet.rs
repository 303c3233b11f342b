//! Decoded HCI packets.
//!
//! These types describe H4 framed HCI traffic at the level needed to
//! report it and to correlate commands with their responses. They are
//! independent of how the bytes were read (SRP).

use std::fmt;

/// H4 packet type indicators.
pub mod packet_types {
    pub const COMMAND: u8 = 0x01;
    pub const ACL_DATA: u8 = 0x02;
    pub const SCO_DATA: u8 = 0x03;
    pub const EVENT: u8 = 0x04;
    pub const ISO_DATA: u8 = 0x05;
}

/// Event codes used for command correlation.
pub mod event_codes {
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
}

/// One HCI packet decoded from its H4 framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HciPacket {
    /// Host to controller command
    Command { opcode: u16, params: Vec<u8> },
    /// ACL data, `handle` is the 12-bit connection handle
    AclData {
        handle: u16,
        pb_flag: u8,
        bc_flag: u8,
        data: Vec<u8>,
    },
    /// Synchronous (SCO) data
    ScoData { handle: u16, data: Vec<u8> },
    /// Controller to host event
    Event { code: u8, params: Vec<u8> },
    /// Isochronous data
    IsoData { handle: u16, data: Vec<u8> },
    /// Unrecognised or truncated input, kept verbatim
    Unknown { data: Vec<u8> },
}

impl HciPacket {
    /// The H4 type indicator, if the packet was recognised.
    pub fn packet_type(&self) -> Option<u8> {
        match self {
            Self::Command { .. } => Some(packet_types::COMMAND),
            Self::AclData { .. } => Some(packet_types::ACL_DATA),
            Self::ScoData { .. } => Some(packet_types::SCO_DATA),
            Self::Event { .. } => Some(packet_types::EVENT),
            Self::IsoData { .. } => Some(packet_types::ISO_DATA),
            Self::Unknown { .. } => None,
        }
    }

    /// Short kind label used in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Command { .. } => "HCI_CMD",
            Self::AclData { .. } => "ACL",
            Self::ScoData { .. } => "SCO",
            Self::Event { .. } => "HCI_EVT",
            Self::IsoData { .. } => "ISO",
            Self::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Parameters or data carried after the packet header.
    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Command { params, .. } | Self::Event { params, .. } => params,
            Self::AclData { data, .. }
            | Self::ScoData { data, .. }
            | Self::IsoData { data, .. }
            | Self::Unknown { data } => data,
        }
    }

    /// Opcode acknowledged by a Command Complete event.
    pub fn command_complete_opcode(&self) -> Option<u16> {
        match self {
            Self::Event { code, params } if *code == event_codes::COMMAND_COMPLETE => {
                read_u16_le(params, 1)
            }
            _ => None,
        }
    }

    /// Opcode acknowledged by a Command Status event.
    pub fn command_status_opcode(&self) -> Option<u16> {
        match self {
            Self::Event { code, params } if *code == event_codes::COMMAND_STATUS => {
                read_u16_le(params, 2)
            }
            _ => None,
        }
    }

    /// Whether this is a Command Complete or Command Status for `opcode`.
    pub fn answers_opcode(&self, opcode: u16) -> bool {
        self.command_complete_opcode() == Some(opcode)
            || self.command_status_opcode() == Some(opcode)
    }
}

impl fmt::Display for HciPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { opcode, params } => write!(
                f,
                "HCI_CMD opcode=0x{:04x} (ogf=0x{:02x} ocf=0x{:03x}) plen={}",
                opcode,
                opcode >> 10,
                opcode & 0x03ff,
                params.len()
            ),
            Self::AclData {
                handle,
                pb_flag,
                bc_flag,
                data,
            } => write!(
                f,
                "ACL handle=0x{:03x} pb={} bc={} dlen={}",
                handle,
                pb_flag,
                bc_flag,
                data.len()
            ),
            Self::ScoData { handle, data } => {
                write!(f, "SCO handle=0x{:03x} dlen={}", handle, data.len())
            }
            Self::Event { code, params } => {
                if let Some(opcode) = self.command_complete_opcode() {
                    write!(f, "HCI_EVT Command Complete opcode=0x{:04x} plen={}", opcode, params.len())
                } else if let Some(opcode) = self.command_status_opcode() {
                    write!(f, "HCI_EVT Command Status opcode=0x{:04x} plen={}", opcode, params.len())
                } else {
                    write!(f, "HCI_EVT code=0x{:02x} plen={}", code, params.len())
                }
            }
            Self::IsoData { handle, data } => {
                write!(f, "ISO handle=0x{:03x} dlen={}", handle, data.len())
            }
            Self::Unknown { data } => write!(f, "UNKNOWN len={}", data.len()),
        }
    }
}

fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_complete(opcode: u16) -> HciPacket {
        let [lo, hi] = opcode.to_le_bytes();
        HciPacket::Event {
            code: event_codes::COMMAND_COMPLETE,
            params: vec![0x01, lo, hi, 0x00],
        }
    }

    #[test]
    fn test_command_complete_opcode() {
        let packet = command_complete(0x0c03);
        assert_eq!(packet.command_complete_opcode(), Some(0x0c03));
        assert_eq!(packet.command_status_opcode(), None);
        assert!(packet.answers_opcode(0x0c03));
        assert!(!packet.answers_opcode(0x1001));
    }

    #[test]
    fn test_command_status_opcode() {
        let packet = HciPacket::Event {
            code: event_codes::COMMAND_STATUS,
            params: vec![0x00, 0x01, 0x05, 0x04],
        };
        assert_eq!(packet.command_status_opcode(), Some(0x0405));
        assert!(packet.answers_opcode(0x0405));
    }

    #[test]
    fn test_short_event_has_no_opcode() {
        let packet = HciPacket::Event {
            code: event_codes::COMMAND_COMPLETE,
            params: vec![0x01, 0x03],
        };
        assert_eq!(packet.command_complete_opcode(), None);
    }

    #[test]
    fn test_payload_and_type() {
        let packet = HciPacket::Command {
            opcode: 0xfc4d,
            params: vec![1, 2, 3],
        };
        assert_eq!(packet.payload(), &[1, 2, 3]);
        assert_eq!(packet.packet_type(), Some(packet_types::COMMAND));
        assert_eq!(HciPacket::Unknown { data: vec![9] }.packet_type(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            command_complete(0x1001).to_string(),
            "HCI_EVT Command Complete opcode=0x1001 plen=4"
        );
        let cmd = HciPacket::Command {
            opcode: 0x0c03,
            params: vec![],
        };
        assert_eq!(cmd.to_string(), "HCI_CMD opcode=0x0c03 (ogf=0x03 ocf=0x003) plen=0");
    }
}
