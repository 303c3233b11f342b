//! Localhost TCP bridge.
//!
//! Stands in for a native HCI socket on hosts that lack one: an external
//! process connects to the listener and streams H4 frames in, and
//! outbound frames are written to a TCP peer (by default the listener
//! itself, so commands loop straight back into the receive path).

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use super::{closed_error, HciChannel, TransportHandle, TransportMode, TransportOptions};
use crate::error::TransportError;

pub const DEFAULT_LOOPBACK_PORT: u16 = 65432;

/// TCP listener on 127.0.0.1 acting as an HCI channel.
///
/// One inbound connection is served at a time; when the peer hangs up the
/// bridge goes back to accepting.
pub struct LoopbackBridge {
    listener: Socket,
    local_addr: SocketAddr,
    inject_addr: SocketAddr,
    timeout: Duration,
    inbound: Mutex<Option<TcpStream>>,
    outbound: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl LoopbackBridge {
    /// Bind the listener on `127.0.0.1:port`.
    pub fn bind(port: u16, timeout: Duration) -> Result<Self, TransportError> {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(TransportError::Socket)?;
        listener
            .set_reuse_address(true)
            .map_err(TransportError::Socket)?;

        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        listener.bind(&addr.into()).map_err(TransportError::Bind)?;
        listener.listen(1).map_err(TransportError::Socket)?;
        // Accept honours the receive timeout, so the receive loop wakes up
        // periodically even with no peer connected.
        listener
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Socket)?;

        let local_addr = listener
            .local_addr()
            .map_err(TransportError::Socket)?
            .as_socket()
            .ok_or_else(|| {
                TransportError::Socket(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "listener has no IP address",
                ))
            })?;

        info!("Loopback bridge listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            inject_addr: local_addr,
            timeout,
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Send outbound frames to `addr` instead of the bridge's own listener.
    pub fn with_inject_addr(mut self, addr: SocketAddr) -> Self {
        self.inject_addr = addr;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn establish(options: &TransportOptions) -> Result<TransportHandle, TransportError> {
        let mut bridge = Self::bind(options.loopback_port, options.loopback_timeout)?;
        if let Some(addr) = options.loopback_inject {
            bridge = bridge.with_inject_addr(addr);
        }
        let description = format!("loopback bridge on {}", bridge.local_addr());
        Ok(TransportHandle::new(
            TransportMode::Loopback,
            description,
            Arc::new(bridge),
        ))
    }

    fn accept(&self) -> io::Result<TcpStream> {
        let (conn, peer) = self.listener.accept()?;
        let stream: TcpStream = conn.into();
        stream.set_read_timeout(Some(self.timeout))?;
        debug!(
            "Loopback bridge accepted connection from {:?}",
            peer.as_socket()
        );
        Ok(stream)
    }
}

impl HciChannel for LoopbackBridge {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        let mut inbound = lock(&self.inbound);
        if inbound.is_none() {
            *inbound = Some(self.accept()?);
        }
        let stream = inbound.as_mut().ok_or_else(closed_error)?;

        match stream.read(buf) {
            Ok(0) => {
                debug!("Loopback peer disconnected");
                *inbound = None;
                Ok(0)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
                ) =>
            {
                debug!("Loopback peer dropped: {}", e);
                *inbound = None;
                Ok(0)
            }
            other => other,
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }

        let mut outbound = lock(&self.outbound);
        if outbound.is_none() {
            let stream = TcpStream::connect_timeout(&self.inject_addr, self.timeout)?;
            debug!("Loopback bridge connected to {}", self.inject_addr);
            *outbound = Some(stream);
        }
        let stream = outbound.as_mut().ok_or_else(closed_error)?;

        let result = stream.write_all(frame).and_then(|()| stream.flush());
        if result.is_err() {
            // Reconnect on the next write
            *outbound = None;
        }
        result
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.listener.shutdown(Shutdown::Both);
        // A reader may hold the inbound lock; it sees the flag after its timeout.
        if let Ok(mut inbound) = self.inbound.try_lock() {
            if let Some(stream) = inbound.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
        if let Ok(mut outbound) = self.outbound.try_lock() {
            if let Some(stream) = outbound.take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
