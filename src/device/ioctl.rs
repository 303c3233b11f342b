//! HCI device-control ioctls (Linux).
//!
//! Request numbers and structure layouts follow `<bluetooth/hci.h>`.

use std::io;
use std::mem;
use std::os::fd::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::domain::DeviceDescriptor;

pub const BTPROTO_HCI: libc::c_int = 1;
pub const HCI_MAX_DEV: u16 = 16;

const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | ((ty as u32) << 8) | nr as u32
}

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const INT_SIZE: usize = mem::size_of::<libc::c_int>();

pub const HCIDEVUP: u32 = ioc(IOC_WRITE, b'H', 201, INT_SIZE);
pub const HCIGETDEVLIST: u32 = ioc(IOC_READ, b'H', 210, INT_SIZE);
pub const HCIGETDEVINFO: u32 = ioc(IOC_READ, b'H', 211, INT_SIZE);

#[repr(C)]
#[derive(Clone, Copy, Default)]
#[allow(dead_code)]
struct HciDevReq {
    dev_id: u16,
    dev_opt: u32,
}

#[repr(C)]
struct HciDevListReq {
    dev_num: u16,
    dev_req: [HciDevReq; HCI_MAX_DEV as usize],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct HciDevStats {
    err_rx: u32,
    err_tx: u32,
    cmd_tx: u32,
    evt_rx: u32,
    acl_tx: u32,
    acl_rx: u32,
    sco_tx: u32,
    sco_rx: u32,
    byte_rx: u32,
    byte_tx: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct HciDevInfo {
    dev_id: u16,
    name: [u8; 8],
    bdaddr: [u8; 6],
    flags: u32,
    dev_type: u8,
    features: [u8; 8],
    pkt_type: u32,
    link_policy: u32,
    link_mode: u32,
    acl_mtu: u16,
    acl_pkts: u16,
    sco_mtu: u16,
    sco_pkts: u16,
    stat: HciDevStats,
}

/// Open a raw HCI socket, unbound.
pub fn open_hci_socket() -> io::Result<Socket> {
    Socket::new(
        Domain::from(libc::AF_BLUETOOTH),
        Type::from(libc::SOCK_RAW),
        Some(Protocol::from(BTPROTO_HCI)),
    )
}

/// Ids of all registered HCI devices (`HCIGETDEVLIST`).
pub fn device_ids(socket: &Socket) -> io::Result<Vec<u16>> {
    let mut req = HciDevListReq {
        dev_num: HCI_MAX_DEV,
        dev_req: [HciDevReq::default(); HCI_MAX_DEV as usize],
    };

    // SAFETY: `req` is a properly sized `hci_dev_list_req` with room for
    // HCI_MAX_DEV entries, which is the bound the kernel honours.
    let ret = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            HCIGETDEVLIST as _,
            &mut req as *mut HciDevListReq,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    let count = req.dev_num.min(HCI_MAX_DEV) as usize;
    Ok(req.dev_req[..count].iter().map(|r| r.dev_id).collect())
}

/// Name, address and flags of one device (`HCIGETDEVINFO`).
pub fn device_info(socket: &Socket, dev_id: u16) -> io::Result<DeviceDescriptor> {
    let mut info = HciDevInfo {
        dev_id,
        ..HciDevInfo::default()
    };

    // SAFETY: `info` matches the kernel's `struct hci_dev_info` layout.
    let ret = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            HCIGETDEVINFO as _,
            &mut info as *mut HciDevInfo,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(DeviceDescriptor::from_dev_info(
        info.dev_id,
        &info.name,
        info.bdaddr,
        info.flags,
    ))
}

/// Activate a device (`HCIDEVUP`). Needs CAP_NET_ADMIN.
pub fn device_up(socket: &Socket, dev_id: u16) -> io::Result<()> {
    // SAFETY: HCIDEVUP takes the device id by value.
    let ret = unsafe {
        libc::ioctl(
            socket.as_raw_fd(),
            HCIDEVUP as _,
            libc::c_ulong::from(dev_id),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_numbers_match_kernel_headers() {
        assert_eq!(HCIDEVUP, 0x4004_48c9);
        assert_eq!(HCIGETDEVLIST, 0x8004_48d2);
        assert_eq!(HCIGETDEVINFO, 0x8004_48d3);
    }

    #[test]
    fn test_struct_layouts() {
        assert_eq!(mem::size_of::<HciDevReq>(), 8);
        assert_eq!(mem::size_of::<HciDevListReq>(), 4 + 8 * 16);
        assert_eq!(mem::size_of::<HciDevInfo>(), 92);
    }
}
