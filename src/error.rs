use std::io;

use thiserror::Error;

/// Errors from device enumeration and transport establishment.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Bluetooth subsystem unavailable: {0}")]
    EnumerationUnavailable(#[source] io::Error),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Invalid device id: {0} (expected 0..=16)")]
    InvalidDeviceId(i32),

    #[error("Device {0} is down and could not be brought up")]
    DeviceDown(String),

    #[error("{request} failed: {source}")]
    DeviceControl {
        request: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("Failed to open socket: {0}")]
    Socket(#[source] io::Error),

    #[error("Failed to bind socket: {0}")]
    Bind(#[source] io::Error),

    #[error("Not supported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("A transport is already connected")]
    AlreadyConnected,

    #[error("No transport is connected")]
    NotConnected,

    #[error("Failed to spawn engine thread: {0}")]
    Thread(#[source] io::Error),

    #[error("Capture log error: {0}")]
    Capture(#[from] CaptureError),
}

/// Errors reading or writing btsnoop capture logs.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid btsnoop signature")]
    InvalidSignature,

    #[error("Unsupported btsnoop version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported datalink type: {0}")]
    UnsupportedDatalink(u32),

    #[error("Truncated capture: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
}

/// Errors decoding H4 framed HCI packets.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty packet")]
    Empty,

    #[error("Unknown H4 packet type: 0x{0:02x}")]
    UnknownPacketType(u8),

    #[error("Packet too short: expected {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },
}

/// Errors submitting commands to the controller.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("No transport is connected")]
    NotConnected,

    #[error("Send queue is full")]
    QueueFull,

    #[error("Transport write failed: {0}")]
    Transport(#[source] io::Error),
}

/// Errors loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}
