//! Raw HCI and HCI user-channel sockets (Linux).

use std::io::{self, Read, Write};
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use socket2::Socket;
use tracing::{debug, info, warn};

use super::{closed_error, HciChannel, TransportHandle, TransportMode, TransportOptions};
use crate::device::{self, open_hci_socket};
use crate::error::TransportError;

const SOL_HCI: libc::c_int = 0;
const HCI_DATA_DIR: libc::c_int = 1;
const HCI_FILTER: libc::c_int = 2;
const HCI_TIME_STAMP: libc::c_int = 3;

pub const HCI_CHANNEL_RAW: u16 = 0;
pub const HCI_CHANNEL_USER: u16 = 1;

/// `struct sockaddr_hci`.
///
/// Six bytes, native endian, no padding:
///
/// | offset | size | field         |
/// |--------|------|---------------|
/// | 0      | 2    | `hci_family`  (AF_BLUETOOTH) |
/// | 2      | 2    | `hci_dev`     (device index) |
/// | 4      | 2    | `hci_channel` (RAW = 0, USER = 1) |
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockaddrHci {
    pub hci_family: libc::sa_family_t,
    pub hci_dev: u16,
    pub hci_channel: u16,
}

impl SockaddrHci {
    pub fn new(device_index: u16, channel: u16) -> Self {
        Self {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: device_index,
            hci_channel: channel,
        }
    }
}

/// `struct hci_ufilter`: packet type mask, event mask, opcode.
#[repr(C)]
struct HciFilter {
    type_mask: u32,
    event_mask: [u32; 2],
    opcode: u16,
}

/// Every packet type, every event, no opcode filter.
const PASS_ALL_FILTER: HciFilter = HciFilter {
    type_mask: u32::MAX,
    event_mask: [u32::MAX, u32::MAX],
    opcode: 0,
};

/// A bound HCI socket used for both directions.
pub struct HciSocket {
    socket: RwLock<Option<Socket>>,
    closed: AtomicBool,
}

impl HciSocket {
    fn new(socket: Socket) -> Self {
        Self {
            socket: RwLock::new(Some(socket)),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `op` on the open socket. Reads and writes share the lock.
    fn with_socket<T>(&self, op: impl FnOnce(&Socket) -> io::Result<T>) -> io::Result<T> {
        if self.closed.load(Ordering::SeqCst) {
            self.release();
            return Err(closed_error());
        }

        let result = {
            let guard = self.socket.read().unwrap_or_else(PoisonError::into_inner);
            let socket = guard.as_ref().ok_or_else(closed_error)?;
            op(socket)
        };

        if self.closed.load(Ordering::SeqCst) {
            // close() ran while this call held the socket
            self.release();
            return Err(closed_error());
        }
        result
    }

    /// Drop the socket unless a read or write still holds it; whoever
    /// holds it releases it on the way out.
    fn release(&self) {
        if let Ok(mut socket) = self.socket.try_write() {
            if socket.take().is_some() {
                debug!("Released HCI socket");
            }
        }
    }

    #[cfg(test)]
    fn is_released(&self) -> bool {
        self.socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

impl HciChannel for HciSocket {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_socket(|mut socket| socket.read(buf))
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.with_socket(|mut socket| socket.write_all(frame))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.release();
    }
}

/// Open a raw HCI socket on `interface`, bringing the device up if needed.
pub fn open_raw(interface: &str, options: &TransportOptions) -> Result<TransportHandle, TransportError> {
    let device = device::find_device(interface)?;

    if !device.is_up() {
        warn!("Device {} is DOWN!", interface);
        info!("Trying to set {} to state 'UP' (requires root)", interface);
        if let Err(e) = device::bring_up(device.id as i32) {
            warn!("Failed to bring up {}: {}", interface, e);
            return Err(TransportError::DeviceDown(interface.to_string()));
        }
    }

    let socket = open_hci_socket().map_err(TransportError::Socket)?;
    set_hci_option(&socket, HCI_DATA_DIR, &1i32).map_err(TransportError::Socket)?;
    set_hci_option(&socket, HCI_TIME_STAMP, &1i32).map_err(TransportError::Socket)?;
    set_hci_option(&socket, HCI_FILTER, &PASS_ALL_FILTER).map_err(TransportError::Socket)?;

    debug!("Socket interface number: {}", device.id);
    bind_hci(&socket, SockaddrHci::new(device.id, HCI_CHANNEL_RAW)).map_err(TransportError::Bind)?;
    socket
        .set_read_timeout(Some(options.receive_timeout))
        .map_err(TransportError::Socket)?;
    debug!("Bound raw HCI socket to {}", interface);

    Ok(TransportHandle::new(
        TransportMode::Hci,
        format!("{} [{}] (raw HCI socket)", interface, device.address),
        Arc::new(HciSocket::new(socket)),
    ))
}

/// Open an exclusive user-channel socket on `interface`.
///
/// The kernel only grants the user channel while the device is down.
pub fn open_user_channel(
    interface: &str,
    options: &TransportOptions,
) -> Result<TransportHandle, TransportError> {
    let device_index = resolve_device_index(interface)?;

    let socket = open_hci_socket().map_err(|e| {
        warn!("Unable to open PF_BLUETOOTH socket: {}", e);
        TransportError::Socket(e)
    })?;
    bind_hci(&socket, SockaddrHci::new(device_index, HCI_CHANNEL_USER)).map_err(|e| {
        warn!("Unable to bind user channel on {}: {}", interface, e);
        TransportError::Bind(e)
    })?;
    socket
        .set_read_timeout(Some(options.receive_timeout))
        .map_err(TransportError::Socket)?;

    Ok(TransportHandle::new(
        TransportMode::UserChannel,
        format!("{} (HCI user channel)", interface),
        Arc::new(HciSocket::new(socket)),
    ))
}

/// Device index for `interface`, from enumeration or from the "hciN" name.
fn resolve_device_index(interface: &str) -> Result<u16, TransportError> {
    match device::find_device(interface) {
        Ok(device) => Ok(device.id),
        Err(TransportError::DeviceNotFound(name)) => parse_device_index(&name)
            .ok_or(TransportError::DeviceNotFound(name)),
        Err(e) => Err(e),
    }
}

fn parse_device_index(interface: &str) -> Option<u16> {
    interface.strip_prefix("hci")?.parse().ok()
}

/// Bind directly with `bind(2)`; the socket API has no HCI address type.
fn bind_hci(socket: &Socket, addr: SockaddrHci) -> io::Result<()> {
    // SAFETY: `addr` is a valid sockaddr_hci and the length matches it.
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const SockaddrHci as *const libc::sockaddr,
            mem::size_of::<SockaddrHci>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_hci_option<T>(socket: &Socket, name: libc::c_int, value: &T) -> io::Result<()> {
    // SAFETY: `value` points to a live `T` of the advertised size.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            SOL_HCI,
            name,
            value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
