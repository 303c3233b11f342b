//! Console-based record reporter.

use std::io::{self, Write};

use crate::domain::{HciPacket, Record};
use crate::reporter::RecordReporter;

/// Reports HCI records to the console, one line per record.
pub struct ConsoleReporter {
    /// Whether to append a hex dump of the raw bytes
    hex_dump: bool,
}

impl ConsoleReporter {
    /// Create a new console reporter.
    pub fn new() -> Self {
        Self { hex_dump: false }
    }

    /// Enable or disable the hex dump below each record.
    pub fn with_hex_dump(mut self, hex_dump: bool) -> Self {
        self.hex_dump = hex_dump;
        self
    }

    fn format_record(&self, record: &Record) -> String {
        let mut output = format!(
            "[{}] {:<7} {} len={}",
            record.timestamp.format("%H:%M:%S%.6f"),
            record.packet.kind(),
            summary(&record.packet),
            record.raw.len()
        );

        if self.hex_dump {
            for chunk in record.raw.chunks(16) {
                output.push_str("\n    ");
                output.push_str(&hex::encode(chunk));
            }
        }

        output
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

fn summary(packet: &HciPacket) -> String {
    match packet {
        HciPacket::Command { opcode, .. } => format!("opcode=0x{:04x}", opcode),
        HciPacket::Event { code, .. } => match packet
            .command_complete_opcode()
            .or_else(|| packet.command_status_opcode())
        {
            Some(opcode) => format!("event=0x{:02x} opcode=0x{:04x}", code, opcode),
            None => format!("event=0x{:02x}", code),
        },
        HciPacket::AclData {
            handle, pb_flag, ..
        } => format!("handle=0x{:03x} pb={}", handle, pb_flag),
        HciPacket::ScoData { handle, .. } | HciPacket::IsoData { handle, .. } => {
            format!("handle=0x{:03x}", handle)
        }
        HciPacket::Unknown { .. } => "-".to_string(),
    }
}

impl RecordReporter for ConsoleReporter {
    fn report(&self, record: &Record) {
        let output = self.format_record(record);
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", output);
    }

    fn on_start(&self, transport: &str) {
        println!("Capturing HCI traffic on {}", transport);
        println!("Press Ctrl+C to stop.\n");
    }

    fn on_stop(&self) {
        println!("\nStopping HCI capture.");
    }
}
