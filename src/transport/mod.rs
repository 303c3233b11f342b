//! HCI transport establishment.
//!
//! This module defines the `HciChannel` trait (DIP) and the three ways
//! of obtaining one: a raw HCI socket, an exclusive user-channel socket,
//! and a localhost TCP bridge for hosts without native HCI sockets.
//! Every variant is wrapped in the same [`TransportHandle`].

#[cfg(target_os = "linux")]
mod hci_socket;
mod loopback;
#[cfg(test)]
pub(crate) mod scripted;

pub use loopback::{LoopbackBridge, DEFAULT_LOOPBACK_PORT};

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::capture::BtsnoopWriter;
use crate::error::TransportError;

/// Default receive timeout so the receive loop can observe shutdown.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(2);

/// Default accept/read timeout of the loopback bridge.
pub const DEFAULT_LOOPBACK_TIMEOUT: Duration = Duration::from_millis(500);

/// A bidirectional channel carrying H4 framed HCI packets.
///
/// Implementations must tolerate `close` being called from another
/// thread while a `read_frame` is blocked; the read then fails (after at
/// most its receive timeout) with an error other than a timeout.
pub trait HciChannel: Send + Sync {
    /// Read one unit of HCI traffic. Timeouts surface as
    /// `WouldBlock`/`TimedOut`, `Ok(0)` means nothing was read.
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Transmit one H4 frame.
    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    /// Close the channel. Must not block.
    fn close(&self);
}

/// Which kind of channel to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Raw HCI socket, shared with the kernel's Bluetooth stack
    #[default]
    Hci,
    /// Exclusive HCI user channel (device must be down)
    UserChannel,
    /// Localhost TCP bridge to an external HCI source
    Loopback,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hci => write!(f, "hci"),
            Self::UserChannel => write!(f, "user"),
            Self::Loopback => write!(f, "loopback"),
        }
    }
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hci" | "raw" => Ok(Self::Hci),
            "user" | "user-channel" => Ok(Self::UserChannel),
            "loopback" | "bridge" => Ok(Self::Loopback),
            other => Err(format!(
                "unknown transport mode '{}' (expected hci, user or loopback)",
                other
            )),
        }
    }
}

/// Tunables shared by the transport variants.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Socket receive timeout for the HCI socket variants
    pub receive_timeout: Duration,
    /// Listener port of the loopback bridge (0 picks a free port)
    pub loopback_port: u16,
    /// Accept/read timeout of the loopback bridge
    pub loopback_timeout: Duration,
    /// Where the loopback bridge sends outbound frames (defaults to its own listener)
    pub loopback_inject: Option<SocketAddr>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            loopback_port: DEFAULT_LOOPBACK_PORT,
            loopback_timeout: DEFAULT_LOOPBACK_TIMEOUT,
            loopback_inject: None,
        }
    }
}

/// The single live channel of a session.
///
/// Cloning shares the channel; `close` on any clone closes it for all.
#[derive(Clone)]
pub struct TransportHandle {
    channel: Arc<dyn HciChannel>,
    mode: TransportMode,
    description: String,
    closed: Arc<AtomicBool>,
}

impl TransportHandle {
    pub fn new(
        mode: TransportMode,
        description: impl Into<String>,
        channel: Arc<dyn HciChannel>,
    ) -> Self {
        Self {
            channel,
            mode,
            description: description.into(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.channel.read_frame(buf)
    }

    pub fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.channel.write_frame(frame)
    }

    /// Close the channel. Idempotent and non-blocking.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.channel.close();
            debug!("Closed transport {}", self.description);
        }
    }
}

impl fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportHandle")
            .field("mode", &self.mode)
            .field("description", &self.description)
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// Open a transport of the requested kind.
///
/// When a capture log is given, its header is written (if the file is
/// still empty) before the handle is returned.
pub fn establish(
    mode: TransportMode,
    interface: &str,
    options: &TransportOptions,
    log: Option<&BtsnoopWriter>,
) -> Result<TransportHandle, TransportError> {
    let handle = match mode {
        TransportMode::Hci => open_hci(interface, options)?,
        TransportMode::UserChannel => open_user_channel(interface, options)?,
        TransportMode::Loopback => LoopbackBridge::establish(options)?,
    };

    if let Some(log) = log {
        if let Err(e) = log.write_header_if_empty() {
            handle.close();
            return Err(e.into());
        }
    }

    info!("Transport established: {}", handle.description());
    Ok(handle)
}

#[cfg(target_os = "linux")]
fn open_hci(interface: &str, options: &TransportOptions) -> Result<TransportHandle, TransportError> {
    hci_socket::open_raw(interface, options)
}

#[cfg(target_os = "linux")]
fn open_user_channel(
    interface: &str,
    options: &TransportOptions,
) -> Result<TransportHandle, TransportError> {
    hci_socket::open_user_channel(interface, options)
}

#[cfg(not(target_os = "linux"))]
fn open_hci(_interface: &str, _options: &TransportOptions) -> Result<TransportHandle, TransportError> {
    Err(TransportError::Unsupported("raw HCI sockets"))
}

#[cfg(not(target_os = "linux"))]
fn open_user_channel(
    _interface: &str,
    _options: &TransportOptions,
) -> Result<TransportHandle, TransportError> {
    Err(TransportError::Unsupported("HCI user channel"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingChannel {
        closes: AtomicUsize,
    }

    impl HciChannel for CountingChannel {
        fn read_frame(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write_frame(&self, _frame: &[u8]) -> io::Result<()> {
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("hci".parse::<TransportMode>(), Ok(TransportMode::Hci));
        assert_eq!("USER".parse::<TransportMode>(), Ok(TransportMode::UserChannel));
        assert_eq!("bridge".parse::<TransportMode>(), Ok(TransportMode::Loopback));
        assert!("usb".parse::<TransportMode>().is_err());
        assert_eq!(TransportMode::UserChannel.to_string(), "user");
    }

    #[test]
    fn test_close_is_idempotent_across_clones() {
        let channel = Arc::new(CountingChannel::default());
        let handle = TransportHandle::new(TransportMode::Hci, "test", channel.clone());
        let other = handle.clone();

        handle.close();
        other.close();
        handle.close();

        assert_eq!(channel.closes.load(Ordering::SeqCst), 1);
        assert!(other.is_closed());
    }

    #[test]
    fn test_closed_handle_rejects_io() {
        let handle = TransportHandle::new(
            TransportMode::Hci,
            "test",
            Arc::new(CountingChannel::default()),
        );
        handle.close();

        let mut buf = [0u8; 4];
        let err = handle.read_frame(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(handle.write_frame(&[1]).is_err());
    }

    #[test]
    fn test_establish_loopback_writes_log_header() {
        let dir = TempDir::new().unwrap();
        let log = BtsnoopWriter::open(dir.path().join("btsnoop.log")).unwrap();
        let options = TransportOptions {
            loopback_port: 0,
            ..TransportOptions::default()
        };

        let handle = establish(TransportMode::Loopback, "loopback", &options, Some(&log)).unwrap();
        assert_eq!(handle.mode(), TransportMode::Loopback);
        assert_eq!(std::fs::read(log.path()).unwrap().len(), 16);
        handle.close();
    }
}
