//! Domain models for HCI capture.
//!
//! This module contains the core domain types that are independent
//! of any transport or OS concerns (SRP, DIP).

mod device;
mod packet;
mod record;

pub use device::{flags_to_text, DeviceDescriptor, DEVICE_FLAG_NAMES, HCI_UP};
pub use packet::{event_codes, packet_types, HciPacket};
pub use record::{Record, SharedRecord};
