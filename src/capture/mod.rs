//! btsnoop capture logging.
//!
//! This module holds the btsnoop record codec and the append-only log
//! writer that the receive engine feeds. The format is what Wireshark
//! and other HCI analysis tools read.

pub mod btsnoop;
mod writer;

pub use btsnoop::{BtsnoopReader, FileHeader, RecordHeader};
pub use writer::BtsnoopWriter;
