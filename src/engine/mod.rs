//! Receive and send loops of a session.
//!
//! Each engine runs on its own thread and stops when the shared running
//! flag is cleared. The receive engine also clears the flag itself when
//! the transport fails, which stops the send engine too.

mod correlation;
mod receive;
mod send;

pub use correlation::{default_response_filter, ResponseSlot};
pub use receive::{ReceiveEngine, RECEIVE_CHUNK};
pub use send::{SendEngine, SendReply, SendTask};

use std::fmt;
use std::io;

/// Lifecycle of an engine loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Running,
    Stopped,
}

/// Why a session's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The running flag was cleared
    Shutdown,
    /// The transport failed with a non-timeout error
    TransportLost(String),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shutdown => write!(f, "shutdown"),
            Self::TransportLost(reason) => write!(f, "transport lost: {}", reason),
        }
    }
}

/// Read errors that only mean "nothing arrived yet".
pub(crate) fn is_soft_read_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
