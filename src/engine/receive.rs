use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{is_soft_read_error, EngineState, SessionEnd};
use crate::capture::BtsnoopWriter;
use crate::dispatch::DispatchRegistry;
use crate::domain::Record;
use crate::parser::HciParser;
use crate::transport::TransportHandle;

/// Bytes requested per read.
pub const RECEIVE_CHUNK: usize = 1024;

/// Reads HCI traffic, logs it and fans it out.
pub struct ReceiveEngine {
    transport: TransportHandle,
    registry: Arc<DispatchRegistry>,
    log: Option<Arc<BtsnoopWriter>>,
    parser: HciParser,
    running: Arc<AtomicBool>,
    state: EngineState,
}

impl ReceiveEngine {
    pub fn new(
        transport: TransportHandle,
        registry: Arc<DispatchRegistry>,
        log: Option<Arc<BtsnoopWriter>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            registry,
            log,
            parser: HciParser::new(),
            running,
            state: EngineState::Running,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Run until shutdown or transport failure.
    pub fn run(&mut self) -> SessionEnd {
        info!("Receive engine started on {}", self.transport.description());
        let mut buf = [0u8; RECEIVE_CHUNK];

        let end = loop {
            if !self.running.load(Ordering::SeqCst) {
                break SessionEnd::Shutdown;
            }

            match self.transport.read_frame(&mut buf) {
                Ok(0) => continue,
                Ok(n) => self.handle_frame(&buf[..n]),
                Err(e) if is_soft_read_error(&e) => continue,
                Err(e) => {
                    // A close during shutdown also lands here
                    if !self.running.swap(false, Ordering::SeqCst) {
                        break SessionEnd::Shutdown;
                    }
                    error!("Lost connection to the controller: {}", e);
                    break SessionEnd::TransportLost(e.to_string());
                }
            }
        };

        self.state = EngineState::Stopped;
        info!("Receive engine stopped ({})", end);
        end
    }

    fn handle_frame(&self, data: &[u8]) {
        let record = Arc::new(Record::captured(data.to_vec(), self.parser.decode(data)));
        debug!("Received {} ({} bytes)", record.packet, data.len());

        if let Some(log) = &self.log {
            if let Err(e) = log.append_record(&record) {
                warn!("Failed to append to {}: {}", log.path().display(), e);
            }
        }

        self.registry.dispatch(&record);
    }
}
