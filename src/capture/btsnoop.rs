//! btsnoop file format.
//!
//! A btsnoop file is a 16-byte identification header followed by
//! records, each a 24-byte header and the raw packet bytes. All integers
//! are big-endian. Timestamps count microseconds since midnight,
//! January 1st 0 AD, expressed relative to the 2000 AD epoch plus
//! [`BTSNOOP_EPOCH_DELTA_US`].

use std::io::{self, Read};

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::domain::Record;
use crate::error::CaptureError;

pub const BTSNOOP_SIGNATURE: &[u8; 8] = b"btsnoop\0";
pub const BTSNOOP_VERSION: u32 = 1;
/// HCI UART (H4) datalink
pub const DATALINK_HCI_UART: u32 = 1002;

pub const FILE_HEADER_LEN: usize = 16;
pub const RECORD_HEADER_LEN: usize = 24;

/// Microseconds between midnight 1 Jan 0 AD and midnight 1 Jan 2000 AD.
pub const BTSNOOP_EPOCH_DELTA_US: i64 = 0x00E0_3AB4_4A67_6000;

/// Microseconds between the Unix epoch and midnight 1 Jan 2000.
const UNIX_TO_2000_US: i64 = 946_684_800_000_000;

/// The file identification header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub datalink: u32,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            version: BTSNOOP_VERSION,
            datalink: DATALINK_HCI_UART,
        }
    }
}

impl FileHeader {
    pub fn encode(&self) -> [u8; FILE_HEADER_LEN] {
        let mut out = [0u8; FILE_HEADER_LEN];
        out[..8].copy_from_slice(BTSNOOP_SIGNATURE);
        out[8..12].copy_from_slice(&self.version.to_be_bytes());
        out[12..16].copy_from_slice(&self.datalink.to_be_bytes());
        out
    }

    /// Decode and validate a file header.
    pub fn decode(data: &[u8]) -> Result<Self, CaptureError> {
        if data.len() < FILE_HEADER_LEN {
            return Err(CaptureError::Truncated {
                expected: FILE_HEADER_LEN,
                actual: data.len(),
            });
        }
        if &data[..8] != BTSNOOP_SIGNATURE {
            return Err(CaptureError::InvalidSignature);
        }

        let version = read_u32(data, 8);
        if version != BTSNOOP_VERSION {
            return Err(CaptureError::UnsupportedVersion(version));
        }
        let datalink = read_u32(data, 12);
        if datalink != DATALINK_HCI_UART {
            return Err(CaptureError::UnsupportedDatalink(datalink));
        }

        Ok(Self { version, datalink })
    }
}

/// Per-record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub original_length: u32,
    pub included_length: u32,
    pub flags: u32,
    pub drops: u32,
    /// Microseconds since midnight 1 Jan 0 AD
    pub timestamp_us: i64,
}

impl RecordHeader {
    /// Header describing a captured record.
    pub fn for_record(record: &Record) -> Self {
        Self {
            original_length: record.original_length,
            included_length: record.captured_length,
            flags: record.flags,
            drops: record.drop_count,
            timestamp_us: timestamp_to_btsnoop(&record.timestamp.naive_local()),
        }
    }

    pub fn encode(&self) -> [u8; RECORD_HEADER_LEN] {
        let mut out = [0u8; RECORD_HEADER_LEN];
        out[0..4].copy_from_slice(&self.original_length.to_be_bytes());
        out[4..8].copy_from_slice(&self.included_length.to_be_bytes());
        out[8..12].copy_from_slice(&self.flags.to_be_bytes());
        out[12..16].copy_from_slice(&self.drops.to_be_bytes());
        out[16..24].copy_from_slice(&self.timestamp_us.to_be_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CaptureError> {
        if data.len() < RECORD_HEADER_LEN {
            return Err(CaptureError::Truncated {
                expected: RECORD_HEADER_LEN,
                actual: data.len(),
            });
        }

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&data[16..24]);

        Ok(Self {
            original_length: read_u32(data, 0),
            included_length: read_u32(data, 4),
            flags: read_u32(data, 8),
            drops: read_u32(data, 12),
            timestamp_us: i64::from_be_bytes(ts),
        })
    }

    /// Capture time as a naive (local) date and time.
    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        timestamp_from_btsnoop(self.timestamp_us)
    }
}

/// A complete record frame: header followed by the packet bytes.
pub fn encode_frame(header: &RecordHeader, data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(data);
    frame
}

/// Convert a naive date and time to btsnoop microseconds.
pub fn timestamp_to_btsnoop(time: &NaiveDateTime) -> i64 {
    let since_2000 = time.and_utc().timestamp_micros() - UNIX_TO_2000_US;
    since_2000.saturating_add(BTSNOOP_EPOCH_DELTA_US)
}

/// Convert btsnoop microseconds back to a naive date and time.
pub fn timestamp_from_btsnoop(timestamp_us: i64) -> Option<NaiveDateTime> {
    let unix_us = timestamp_us
        .checked_sub(BTSNOOP_EPOCH_DELTA_US)?
        .checked_add(UNIX_TO_2000_US)?;
    DateTime::<Utc>::from_timestamp_micros(unix_us).map(|dt| dt.naive_utc())
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

/// Reads records back out of a btsnoop stream.
pub struct BtsnoopReader<R> {
    inner: R,
    header: FileHeader,
}

impl<R: Read> BtsnoopReader<R> {
    /// Read and validate the file header.
    pub fn new(mut inner: R) -> Result<Self, CaptureError> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        let n = read_full(&mut inner, &mut buf)?;
        let header = FileHeader::decode(&buf[..n])?;
        Ok(Self { inner, header })
    }

    pub fn header(&self) -> FileHeader {
        self.header
    }

    fn next_frame(&mut self) -> Result<Option<(RecordHeader, Vec<u8>)>, CaptureError> {
        let mut buf = [0u8; RECORD_HEADER_LEN];
        let n = read_full(&mut self.inner, &mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        let header = RecordHeader::decode(&buf[..n])?;

        let mut data = vec![0u8; header.included_length as usize];
        let n = read_full(&mut self.inner, &mut data)?;
        if n < data.len() {
            return Err(CaptureError::Truncated {
                expected: data.len(),
                actual: n,
            });
        }

        Ok(Some((header, data)))
    }
}

impl<R: Read> Iterator for BtsnoopReader<R> {
    type Item = Result<(RecordHeader, Vec<u8>), CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Fill `buf` unless EOF comes first; returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
