//! HCI packet parser implementation.
//!
//! Parses H4 (UART transport) framed packets: one type indicator byte
//! followed by the packet header and payload.

use tracing::debug;

use crate::domain::{packet_types, HciPacket};
use crate::error::ParseError;

/// Header sizes including the H4 type byte.
const COMMAND_HEADER_LEN: usize = 4;
const ACL_HEADER_LEN: usize = 5;
const SCO_HEADER_LEN: usize = 4;
const EVENT_HEADER_LEN: usize = 3;
const ISO_HEADER_LEN: usize = 5;

/// Parser for H4 framed HCI packets.
///
/// Implements the Single Responsibility Principle by focusing
/// solely on the wire format, leaving interpretation to consumers.
#[derive(Debug, Clone, Copy, Default)]
pub struct HciParser;

impl HciParser {
    /// Create a new HCI parser.
    pub fn new() -> Self {
        Self
    }

    /// Decode a packet, falling back to [`HciPacket::Unknown`] for input
    /// that cannot be parsed.
    pub fn decode(&self, data: &[u8]) -> HciPacket {
        match self.parse(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Undecodable HCI packet ({}): {}", e, hex::encode(data));
                HciPacket::Unknown {
                    data: data.to_vec(),
                }
            }
        }
    }

    /// Parse a packet from raw H4 bytes.
    ///
    /// Bytes beyond the length declared in the header are ignored.
    pub fn parse(&self, data: &[u8]) -> Result<HciPacket, ParseError> {
        let (&packet_type, _) = data.split_first().ok_or(ParseError::Empty)?;

        match packet_type {
            packet_types::COMMAND => {
                require_len(data, COMMAND_HEADER_LEN)?;
                let opcode = u16::from_le_bytes([data[1], data[2]]);
                let params = body(data, COMMAND_HEADER_LEN, data[3] as usize)?;
                Ok(HciPacket::Command { opcode, params })
            }
            packet_types::ACL_DATA => {
                require_len(data, ACL_HEADER_LEN)?;
                let handle = u16::from_le_bytes([data[1], data[2]]) & 0x0fff;
                let pb_flag = (data[2] >> 4) & 0x03;
                let bc_flag = (data[2] >> 6) & 0x03;
                let len = u16::from_le_bytes([data[3], data[4]]) as usize;
                let data = body(data, ACL_HEADER_LEN, len)?;
                Ok(HciPacket::AclData {
                    handle,
                    pb_flag,
                    bc_flag,
                    data,
                })
            }
            packet_types::SCO_DATA => {
                require_len(data, SCO_HEADER_LEN)?;
                let handle = u16::from_le_bytes([data[1], data[2]]) & 0x0fff;
                let data = body(data, SCO_HEADER_LEN, data[3] as usize)?;
                Ok(HciPacket::ScoData { handle, data })
            }
            packet_types::EVENT => {
                require_len(data, EVENT_HEADER_LEN)?;
                let code = data[1];
                let params = body(data, EVENT_HEADER_LEN, data[2] as usize)?;
                Ok(HciPacket::Event { code, params })
            }
            packet_types::ISO_DATA => {
                require_len(data, ISO_HEADER_LEN)?;
                let handle = u16::from_le_bytes([data[1], data[2]]) & 0x0fff;
                let len = (u16::from_le_bytes([data[3], data[4]]) & 0x3fff) as usize;
                let data = body(data, ISO_HEADER_LEN, len)?;
                Ok(HciPacket::IsoData { handle, data })
            }
            other => Err(ParseError::UnknownPacketType(other)),
        }
    }
}

fn require_len(data: &[u8], expected: usize) -> Result<(), ParseError> {
    if data.len() < expected {
        return Err(ParseError::PacketTooShort {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn body(data: &[u8], header_len: usize, len: usize) -> Result<Vec<u8>, ParseError> {
    require_len(data, header_len + len)?;
    Ok(data[header_len..header_len + len].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event_codes;

    #[test]
    fn test_parse_command() {
        let parser = HciParser::new();
        let packet = parser.parse(&[0x01, 0x03, 0x0c, 0x00]).unwrap();
        assert_eq!(
            packet,
            HciPacket::Command {
                opcode: 0x0c03,
                params: vec![]
            }
        );
    }

    #[test]
    fn test_parse_command_complete_event() {
        let parser = HciParser::new();
        let packet = parser
            .parse(&[0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00])
            .unwrap();

        match &packet {
            HciPacket::Event { code, params } => {
                assert_eq!(*code, event_codes::COMMAND_COMPLETE);
                assert_eq!(params, &vec![0x01, 0x03, 0x0c, 0x00]);
            }
            other => panic!("unexpected packet {:?}", other),
        }
        assert_eq!(packet.command_complete_opcode(), Some(0x0c03));
    }

    #[test]
    fn test_parse_acl_flags() {
        let parser = HciParser::new();
        // handle 0x040, pb=2, bc=0, two bytes of data
        let packet = parser
            .parse(&[0x02, 0x40, 0x20, 0x02, 0x00, 0xaa, 0xbb])
            .unwrap();
        assert_eq!(
            packet,
            HciPacket::AclData {
                handle: 0x040,
                pb_flag: 2,
                bc_flag: 0,
                data: vec![0xaa, 0xbb]
            }
        );
    }

    #[test]
    fn test_parse_sco_and_iso() {
        let parser = HciParser::new();
        assert_eq!(
            parser.parse(&[0x03, 0x01, 0x00, 0x01, 0x7f]).unwrap(),
            HciPacket::ScoData {
                handle: 1,
                data: vec![0x7f]
            }
        );
        assert_eq!(
            parser.parse(&[0x05, 0x02, 0x40, 0x01, 0x40, 0x11]).unwrap(),
            HciPacket::IsoData {
                handle: 2,
                data: vec![0x11]
            }
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let parser = HciParser::new();
        let packet = parser.parse(&[0x04, 0x13, 0x01, 0x05, 0xff, 0xff]).unwrap();
        assert_eq!(packet.payload(), &[0x05]);
    }

    #[test]
    fn test_errors() {
        let parser = HciParser::new();
        assert_eq!(parser.parse(&[]), Err(ParseError::Empty));
        assert_eq!(parser.parse(&[0x42, 0x00]), Err(ParseError::UnknownPacketType(0x42)));
        assert_eq!(
            parser.parse(&[0x04, 0x0e, 0x04, 0x01]),
            Err(ParseError::PacketTooShort {
                expected: 7,
                actual: 4
            })
        );
    }

    #[test]
    fn test_decode_falls_back_to_unknown() {
        let parser = HciParser::new();
        assert_eq!(
            parser.decode(&[0x01, 0x03]),
            HciPacket::Unknown {
                data: vec![0x01, 0x03]
            }
        );
    }
}
