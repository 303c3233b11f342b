//! A live connection to one controller.
//!
//! The session owns the dispatch registry and the capture log, starts
//! the receive and send engines on top of a transport, and exposes the
//! consumer surface: subscriptions and command submission.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::BtsnoopWriter;
use crate::config::Config;
use crate::dispatch::{DispatchRegistry, RecordFilter, SubscriptionId};
use crate::domain::{Record, SharedRecord};
use crate::engine::{ReceiveEngine, SendEngine, SendTask, SessionEnd};
use crate::error::{SendError, TransportError};
use crate::transport::{self, TransportHandle, TransportMode};

/// Outbound tasks that may wait for the send engine.
const SEND_QUEUE_CAPACITY: usize = 64;

struct Link {
    transport: TransportHandle,
    running: Arc<AtomicBool>,
    tasks: SyncSender<SendTask>,
    receiver: JoinHandle<SessionEnd>,
    sender: JoinHandle<()>,
}

pub struct Session {
    config: Config,
    registry: Arc<DispatchRegistry>,
    log: Option<Arc<BtsnoopWriter>>,
    link: Mutex<Option<Link>>,
}

impl Session {
    /// Create an unconnected session, opening the capture log if enabled.
    pub fn new(config: Config) -> Result<Self, TransportError> {
        let log = if config.write_btsnoop {
            let writer = BtsnoopWriter::open(&config.btsnoop_path)?;
            info!("Writing btsnoop log to {}", config.btsnoop_path.display());
            Some(Arc::new(writer))
        } else {
            None
        };

        Ok(Self {
            config,
            registry: Arc::new(DispatchRegistry::new()),
            log,
            link: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DispatchRegistry> {
        &self.registry
    }

    /// Establish a transport and start both engines.
    pub fn connect(&self, mode: TransportMode, interface: &str) -> Result<(), TransportError> {
        let mut link = self.lock_link();
        self.ensure_idle(&mut link)?;

        let handle = transport::establish(
            mode,
            interface,
            &self.config.transport_options(),
            self.log.as_deref(),
        )?;
        *link = Some(self.start(handle)?);
        Ok(())
    }

    /// Start the engines on an already established transport.
    pub fn attach(&self, handle: TransportHandle) -> Result<(), TransportError> {
        let mut link = self.lock_link();
        self.ensure_idle(&mut link)?;

        if let Some(log) = &self.log {
            log.write_header_if_empty()?;
        }
        *link = Some(self.start(handle)?);
        Ok(())
    }

    /// Whether both engines are still running.
    pub fn is_running(&self) -> bool {
        self.lock_link()
            .as_ref()
            .is_some_and(|link| link.running.load(Ordering::SeqCst))
    }

    /// Stop the engines, close the transport and wait for both threads.
    ///
    /// Returns how the receive loop ended, or `None` if nothing was
    /// connected.
    pub fn shutdown(&self) -> Option<SessionEnd> {
        let link = self.lock_link().take()?;
        info!("Shutting down {}", link.transport.description());

        link.running.store(false, Ordering::SeqCst);
        link.transport.close();
        drop(link.tasks);

        let end = link.receiver.join().unwrap_or_else(|_| {
            error!("Receive engine panicked");
            SessionEnd::TransportLost("receive engine panicked".to_string())
        });
        if link.sender.join().is_err() {
            error!("Send engine panicked");
        }
        Some(end)
    }

    /// Subscribe a queue of the configured default size.
    pub fn register_queue(
        &self,
        filter: Option<RecordFilter>,
    ) -> (SubscriptionId, Receiver<SharedRecord>) {
        self.registry.register_queue(self.config.queue_size, filter)
    }

    /// Subscribe a queue with an explicit capacity.
    pub fn register_queue_with_capacity(
        &self,
        capacity: usize,
        filter: Option<RecordFilter>,
    ) -> (SubscriptionId, Receiver<SharedRecord>) {
        self.registry.register_queue(capacity, filter)
    }

    pub fn register_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        self.registry.register_callback(callback)
    }

    pub fn unregister(&self, id: SubscriptionId) -> bool {
        self.registry.unregister(id)
    }

    /// Send `h4_type ++ payload`.
    ///
    /// Without a timeout the packet is queued and `Ok(None)` returned at
    /// once. With a timeout the call blocks until the controller's reply
    /// (its payload) arrives or the timeout passes (`Ok(None)`). The wait
    /// is bounded by the caller's own timeout plus one poll interval, even
    /// when other requests are queued ahead of this one.
    pub fn send(
        &self,
        h4_type: u8,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Option<Vec<u8>>, SendError> {
        self.submit(h4_type, payload, timeout, None)
    }

    /// Like [`Session::send`], with a custom reply predicate.
    pub fn send_with_filter<F>(
        &self,
        h4_type: u8,
        payload: &[u8],
        timeout: Duration,
        filter: F,
    ) -> Result<Option<Vec<u8>>, SendError>
    where
        F: Fn(&Record) -> bool + Send + Sync + 'static,
    {
        self.submit(h4_type, payload, Some(timeout), Some(Arc::new(filter)))
    }

    fn submit(
        &self,
        h4_type: u8,
        payload: &[u8],
        timeout: Option<Duration>,
        filter: Option<RecordFilter>,
    ) -> Result<Option<Vec<u8>>, SendError> {
        let (tasks, running) = match self.lock_link().as_ref() {
            Some(link) if link.running.load(Ordering::SeqCst) => {
                (link.tasks.clone(), Arc::clone(&link.running))
            }
            _ => return Err(SendError::NotConnected),
        };

        let task = SendTask::new(h4_type, payload.to_vec());
        let Some(timeout) = timeout else {
            enqueue(&tasks, task)?;
            return Ok(None);
        };

        let (reply, wait) = mpsc::sync_channel(1);
        enqueue(&tasks, task.expecting_response(timeout, filter, reply))?;
        drop(tasks);

        // The engine's own deadline starts at pickup, which may be later
        match wait.recv_timeout(timeout + self.config.poll_interval) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) if running.load(Ordering::SeqCst) => {
                debug!("No reply within {:?}, giving up", timeout);
                Ok(None)
            }
            // The engine drops the task unanswered only when it stops
            Err(_) => Err(SendError::NotConnected),
        }
    }

    fn start(&self, handle: TransportHandle) -> Result<Link, TransportError> {
        let running = Arc::new(AtomicBool::new(true));
        let (tasks, queue) = mpsc::sync_channel(SEND_QUEUE_CAPACITY);

        let mut receive = ReceiveEngine::new(
            handle.clone(),
            Arc::clone(&self.registry),
            self.log.clone(),
            Arc::clone(&running),
        );
        let mut send = SendEngine::new(
            handle.clone(),
            Arc::clone(&self.registry),
            queue,
            Arc::clone(&running),
            self.config.poll_interval,
        );

        let abort = |e| {
            running.store(false, Ordering::SeqCst);
            handle.close();
            TransportError::Thread(e)
        };
        let receiver = spawn("hci-recv", move || receive.run()).map_err(abort)?;
        let sender = match spawn("hci-send", move || send.run()) {
            Ok(sender) => sender,
            Err(e) => {
                let err = abort(e);
                let _ = receiver.join();
                return Err(err);
            }
        };
        info!("Session started on {}", handle.description());

        Ok(Link {
            transport: handle,
            running,
            tasks,
            receiver,
            sender,
        })
    }

    /// Reap a link whose engines already stopped; refuse a live one.
    fn ensure_idle(&self, link: &mut Option<Link>) -> Result<(), TransportError> {
        if link
            .as_ref()
            .is_some_and(|live| live.running.load(Ordering::SeqCst))
        {
            return Err(TransportError::AlreadyConnected);
        }
        if let Some(stale) = link.take() {
            stale.transport.close();
            let _ = stale.receiver.join();
            let _ = stale.sender.join();
            debug!("Reaped stopped session");
        }
        Ok(())
    }

    fn lock_link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn enqueue(tasks: &SyncSender<SendTask>, task: SendTask) -> Result<(), SendError> {
    tasks.try_send(task).map_err(|e| match e {
        TrySendError::Full(_) => {
            warn!("Send queue is full");
            SendError::QueueFull
        }
        TrySendError::Disconnected(_) => SendError::NotConnected,
    })
}

fn spawn<T, F>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}
