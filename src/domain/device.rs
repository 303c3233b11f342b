//! Bluetooth adapter descriptors.

use std::fmt;

use macaddr::MacAddr6;

/// Device flag names in kernel bit order (`HCI_UP` is bit 0).
pub const DEVICE_FLAG_NAMES: [&str; 10] = [
    "UP", "INIT", "RUNNING", "PSCAN", "ISCAN", "AUTH", "ENCRYPT", "INQUIRY", "RAW", "RESET",
];

/// Bit set while the adapter is up.
pub const HCI_UP: u32 = 1 << 0;

/// A local HCI adapter as reported by the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Kernel device index (the N in hciN)
    pub id: u16,
    /// Interface name, e.g. "hci0"
    pub name: String,
    /// Public device address
    pub address: MacAddr6,
    /// Raw flag bitmap
    pub flags: u32,
    /// Flag bitmap rendered as text, e.g. "UP RUNNING"
    pub flags_text: String,
}

impl DeviceDescriptor {
    /// Build a descriptor from the fields of a `struct hci_dev_info`.
    ///
    /// `name` is NUL padded and `bdaddr` is in wire (little-endian) order.
    pub fn from_dev_info(id: u16, name: &[u8], bdaddr: [u8; 6], flags: u32) -> Self {
        let name: Vec<u8> = name.iter().copied().filter(|&b| b != 0).collect();
        let [a0, a1, a2, a3, a4, a5] = bdaddr;

        Self {
            id,
            name: String::from_utf8_lossy(&name).into_owned(),
            address: MacAddr6::new(a5, a4, a3, a2, a1, a0),
            flags,
            flags_text: flags_to_text(flags),
        }
    }

    /// Whether the UP flag is set.
    pub fn is_up(&self) -> bool {
        self.flags & HCI_UP != 0
    }
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  [{}]  flags={}<{}>",
            self.name, self.address, self.flags, self.flags_text
        )
    }
}

/// Render a device flag bitmap as space separated names, low bit first.
///
/// A zero bitmap is "DOWN". Bits above `RESET` have no name and are skipped.
pub fn flags_to_text(flags: u32) -> String {
    if flags == 0 {
        return "DOWN".to_string();
    }

    DEVICE_FLAG_NAMES
        .iter()
        .enumerate()
        .filter(|(bit, _)| flags & (1 << bit) != 0)
        .map(|(_, name)| *name)
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_flags_are_down() {
        assert_eq!(flags_to_text(0), "DOWN");
    }

    #[test]
    fn test_flags_low_bit_first() {
        assert_eq!(flags_to_text(0b1), "UP");
        assert_eq!(flags_to_text(0b101), "UP RUNNING");
        assert_eq!(flags_to_text(0b1_0000_0000), "RAW");
        assert_eq!(flags_to_text(0x3ff), DEVICE_FLAG_NAMES.join(" "));
    }

    #[test]
    fn test_unnamed_high_bits_ignored() {
        assert_eq!(flags_to_text(1 << 12), "");
        assert_eq!(flags_to_text((1 << 12) | 0b10), "INIT");
    }

    #[test]
    fn test_every_single_bit() {
        for (bit, name) in DEVICE_FLAG_NAMES.iter().enumerate() {
            assert_eq!(flags_to_text(1 << bit), *name);
        }
    }

    #[test]
    fn test_from_dev_info() {
        let mut name = [0u8; 8];
        name[..4].copy_from_slice(b"hci0");
        let dev = DeviceDescriptor::from_dev_info(0, &name, [0x55, 0x44, 0x33, 0x22, 0x11, 0x00], 0x5);

        assert_eq!(dev.name, "hci0");
        assert_eq!(dev.address.to_string(), "00:11:22:33:44:55");
        assert_eq!(dev.flags_text, "UP RUNNING");
        assert!(dev.is_up());
    }

    #[test]
    fn test_down_device_not_up() {
        let dev = DeviceDescriptor::from_dev_info(1, b"hci1\0\0\0\0", [0; 6], 0);
        assert!(!dev.is_up());
        assert_eq!(dev.flags_text, "DOWN");
        assert_eq!(dev.to_string(), "hci1  [00:00:00:00:00:00]  flags=0<DOWN>");
    }
}
