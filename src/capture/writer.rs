//! Append-only btsnoop log writer.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Local};
use tracing::debug;

use super::btsnoop::{encode_frame, timestamp_to_btsnoop, FileHeader, RecordHeader};
use crate::domain::Record;
use crate::error::CaptureError;

/// Writes HCI records to a btsnoop file.
///
/// Header emission and record appends share one lock, so frames from
/// different threads never interleave. Every write is flushed before
/// the call returns.
#[derive(Debug)]
pub struct BtsnoopWriter {
    path: PathBuf,
    file: Mutex<File>,
}

impl BtsnoopWriter {
    /// Open (or create) a capture log for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the identification header if the file is still empty.
    ///
    /// Returns whether a header was written.
    pub fn write_header_if_empty(&self) -> Result<bool, CaptureError> {
        let mut file = self.lock();
        if file.metadata()?.len() != 0 {
            return Ok(false);
        }

        file.write_all(&FileHeader::default().encode())?;
        file.flush()?;
        debug!("Wrote btsnoop header to {}", self.path.display());
        Ok(true)
    }

    /// Append one frame built from explicit header fields.
    pub fn append(
        &self,
        raw: &[u8],
        original_length: u32,
        captured_length: u32,
        flags: u32,
        drop_count: u32,
        timestamp: &DateTime<Local>,
    ) -> Result<(), CaptureError> {
        let header = RecordHeader {
            original_length,
            included_length: captured_length,
            flags,
            drops: drop_count,
            timestamp_us: timestamp_to_btsnoop(&timestamp.naive_local()),
        };
        self.write_frame(&encode_frame(&header, raw))
    }

    /// Append a captured record.
    pub fn append_record(&self, record: &Record) -> Result<(), CaptureError> {
        let header = RecordHeader::for_record(record);
        self.write_frame(&encode_frame(&header, &record.raw))
    }

    fn write_frame(&self, frame: &[u8]) -> Result<(), CaptureError> {
        let mut file = self.lock();
        file.write_all(frame)?;
        file.flush()?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, File> {
        self.file.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
