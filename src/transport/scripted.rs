//! In-memory channel for exercising the engines without a controller.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{closed_error, HciChannel, TransportHandle, TransportMode};

type Responder = Box<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

pub(crate) struct ScriptedChannel {
    inbound: Mutex<Receiver<Vec<u8>>>,
    injector: Mutex<Sender<Vec<u8>>>,
    written: Mutex<Vec<Vec<u8>>>,
    responder: Option<Responder>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    timeout: Duration,
}

impl ScriptedChannel {
    pub fn new() -> Self {
        let (injector, inbound) = mpsc::channel();
        Self {
            inbound: Mutex::new(inbound),
            injector: Mutex::new(injector),
            written: Mutex::new(Vec::new()),
            responder: None,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            timeout: Duration::from_millis(20),
        }
    }

    /// Answer every written frame with whatever `responder` returns.
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn into_handle(self) -> (Arc<Self>, TransportHandle) {
        let channel = Arc::new(self);
        let handle = TransportHandle::new(TransportMode::Loopback, "scripted", channel.clone());
        (channel, handle)
    }

    /// Queue a frame for the next read.
    pub fn inject(&self, frame: &[u8]) {
        let _ = self.injector.lock().unwrap().send(frame.to_vec());
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap().clone()
    }

    pub fn fail_reads(&self) {
        self.fail_reads.store(true, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl HciChannel for ScriptedChannel {
    fn read_frame(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_error());
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "adapter removed"));
        }

        match self.inbound.lock().unwrap().recv_timeout(self.timeout) {
            Ok(frame) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "timed out"))
            }
        }
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write refused"));
        }
        self.written.lock().unwrap().push(frame.to_vec());
        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(frame)) {
            self.inject(&reply);
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
