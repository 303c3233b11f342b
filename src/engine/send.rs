use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::correlation::{default_response_filter, ResponseSlot};
use super::EngineState;
use crate::dispatch::{DispatchRegistry, RecordFilter};
use crate::error::SendError;
use crate::transport::TransportHandle;

/// What a waiting caller gets back: the reply payload, `None` on timeout.
pub type SendReply = Result<Option<Vec<u8>>, SendError>;

/// One outbound packet, optionally waiting for its reply.
pub struct SendTask {
    h4_type: u8,
    payload: Vec<u8>,
    response: Option<PendingResponse>,
}

struct PendingResponse {
    timeout: Duration,
    filter: Option<RecordFilter>,
    reply: SyncSender<SendReply>,
}

impl SendTask {
    /// A packet sent without waiting for anything.
    pub fn new(h4_type: u8, payload: Vec<u8>) -> Self {
        Self {
            h4_type,
            payload,
            response: None,
        }
    }

    /// Wait up to `timeout` for the record accepted by `filter` (or the
    /// default reply filter) and deliver its payload on `reply`.
    pub fn expecting_response(
        mut self,
        timeout: Duration,
        filter: Option<RecordFilter>,
        reply: SyncSender<SendReply>,
    ) -> Self {
        self.response = Some(PendingResponse {
            timeout,
            filter,
            reply,
        });
        self
    }

    /// The H4 frame: packet type followed by the payload.
    pub fn frame(&self) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + self.payload.len());
        frame.push(self.h4_type);
        frame.extend_from_slice(&self.payload);
        frame
    }
}

/// Transmits queued packets and correlates replies.
pub struct SendEngine {
    transport: TransportHandle,
    registry: Arc<DispatchRegistry>,
    tasks: Receiver<SendTask>,
    running: Arc<AtomicBool>,
    poll_interval: Duration,
    state: EngineState,
}

impl SendEngine {
    pub fn new(
        transport: TransportHandle,
        registry: Arc<DispatchRegistry>,
        tasks: Receiver<SendTask>,
        running: Arc<AtomicBool>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            transport,
            registry,
            tasks,
            running,
            poll_interval,
            state: EngineState::Running,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run until the running flag is cleared or every task sender is gone.
    pub fn run(&mut self) {
        info!("Send engine started");

        while self.running.load(Ordering::SeqCst) {
            match self.tasks.recv_timeout(self.poll_interval) {
                Ok(task) => self.execute(task),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.state = EngineState::Stopped;
        info!("Send engine stopped");
    }

    fn execute(&self, task: SendTask) {
        let frame = task.frame();
        debug!("Sending {} bytes: {}", frame.len(), hex::encode(&frame));

        let Some(response) = task.response else {
            if let Err(e) = self.transport.write_frame(&frame) {
                warn!("Failed to send packet: {}", e);
            }
            return;
        };

        let filter = response
            .filter
            .unwrap_or_else(|| default_response_filter(task.h4_type, &task.payload));
        // Registered before transmitting so a fast reply cannot be missed
        let slot = ResponseSlot::register(&self.registry, filter);

        let outcome = match self.transport.write_frame(&frame) {
            Ok(()) => self.await_reply(&slot, response.timeout),
            Err(e) => {
                warn!("Failed to send packet: {}", e);
                Err(SendError::Transport(e))
            }
        };
        drop(slot);

        if response.reply.send(outcome).is_err() {
            debug!("Caller stopped waiting for the reply");
        }
    }

    /// Wait for the reply in poll-sized steps so shutdown is not delayed
    /// by a long response timeout.
    ///
    /// A session that stops while waiting yields `NotConnected`, not a
    /// timeout.
    fn await_reply(&self, slot: &ResponseSlot, timeout: Duration) -> SendReply {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.running.load(Ordering::SeqCst) {
                debug!("Session stopped while waiting for a response");
                return Err(SendError::NotConnected);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("No response from the controller within {:?}", timeout);
                return Ok(None);
            }

            match slot.wait(remaining.min(self.poll_interval)) {
                Ok(record) => return Ok(Some(record.packet.payload().to_vec())),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Ok(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ReceiveEngine;
    use crate::transport::scripted::ScriptedChannel;
    use std::sync::mpsc;
    use std::thread;

    const POLL: Duration = Duration::from_millis(20);

    struct Harness {
        channel: Arc<ScriptedChannel>,
        registry: Arc<DispatchRegistry>,
        running: Arc<AtomicBool>,
        tasks: SyncSender<SendTask>,
        threads: Vec<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(channel: ScriptedChannel) -> Self {
            let (channel, handle) = channel.into_handle();
            let registry = Arc::new(DispatchRegistry::new());
            let running = Arc::new(AtomicBool::new(true));
            let (tasks, queue) = mpsc::sync_channel(8);

            let mut receive =
                ReceiveEngine::new(handle.clone(), Arc::clone(&registry), None, Arc::clone(&running));
            let mut send = SendEngine::new(
                handle,
                Arc::clone(&registry),
                queue,
                Arc::clone(&running),
                POLL,
            );
            let threads = vec![
                thread::spawn(move || {
                    receive.run();
                }),
                thread::spawn(move || send.run()),
            ];

            Self {
                channel,
                registry,
                running,
                tasks,
                threads,
            }
        }

        fn request(&self, task: SendTask, timeout: Duration) -> SendReply {
            let (reply, wait) = mpsc::sync_channel(1);
            self.tasks
                .send(task.expecting_response(timeout, None, reply))
                .unwrap();
            wait.recv().unwrap()
        }

        fn stop(self) {
            self.running.store(false, Ordering::SeqCst);
            for thread in self.threads {
                thread.join().unwrap();
            }
        }
    }

    fn reset_complete(frame: &[u8]) -> Option<Vec<u8>> {
        (frame == [0x01, 0x03, 0x0c, 0x00]).then(|| vec![0x04, 0x0e, 0x04, 0x01, 0x03, 0x0c, 0x00])
    }

    #[test]
    fn test_frame_prefixes_packet_type() {
        let task = SendTask::new(0x01, vec![0x03, 0x0c, 0x00]);
        assert_eq!(task.frame(), vec![0x01, 0x03, 0x0c, 0x00]);
    }

    #[test]
    fn test_reply_payload_is_returned() {
        let harness = Harness::start(ScriptedChannel::new().with_responder(reset_complete));

        let reply = harness.request(
            SendTask::new(0x01, vec![0x03, 0x0c, 0x00]),
            Duration::from_secs(5),
        );
        assert_eq!(reply.unwrap(), Some(vec![0x01, 0x03, 0x0c, 0x00]));
        assert_eq!(harness.registry.queue_count(), 0);

        harness.stop();
    }

    #[test]
    fn test_timeout_returns_none_and_cleans_up() {
        let harness = Harness::start(ScriptedChannel::new());

        let reply = harness.request(
            SendTask::new(0x01, vec![0x03, 0x0c, 0x00]),
            Duration::from_millis(100),
        );
        assert_eq!(reply.unwrap(), None);
        assert_eq!(harness.registry.queue_count(), 0);
        assert_eq!(harness.channel.written(), vec![vec![0x01, 0x03, 0x0c, 0x00]]);

        harness.stop();
    }

    #[test]
    fn test_write_failure_is_reported_and_engine_keeps_running() {
        let harness = Harness::start(ScriptedChannel::new());
        harness.channel.fail_writes();

        let reply = harness.request(
            SendTask::new(0x01, vec![0x03, 0x0c, 0x00]),
            Duration::from_secs(1),
        );
        assert!(matches!(reply, Err(SendError::Transport(_))));
        assert_eq!(harness.registry.queue_count(), 0);
        assert!(harness.running.load(Ordering::SeqCst));

        harness.stop();
    }

    #[test]
    fn test_stopped_session_fails_pending_reply() {
        let harness = Harness::start(ScriptedChannel::new());
        let (reply, wait) = mpsc::sync_channel(1);
        harness
            .tasks
            .send(SendTask::new(0x01, vec![0x03, 0x0c, 0x00]).expecting_response(
                Duration::from_secs(10),
                None,
                reply,
            ))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.channel.written().is_empty() && Instant::now() < deadline {
            thread::sleep(POLL);
        }
        harness.channel.fail_reads();

        let outcome = wait.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(outcome, Err(SendError::NotConnected)));
        assert_eq!(harness.registry.queue_count(), 0);

        harness.stop();
    }

    #[test]
    fn test_fire_and_forget_is_transmitted() {
        let harness = Harness::start(ScriptedChannel::new());
        harness
            .tasks
            .send(SendTask::new(0x01, vec![0x01, 0x10, 0x00]))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while harness.channel.written().is_empty() && Instant::now() < deadline {
            thread::sleep(POLL);
        }
        assert_eq!(harness.channel.written(), vec![vec![0x01, 0x01, 0x10, 0x00]]);

        harness.stop();
    }
}
