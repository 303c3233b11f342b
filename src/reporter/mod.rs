//! Reporting module for captured HCI records.
//!
//! This module defines the `RecordReporter` trait (ISP, DIP) and provides
//! implementations for different output formats.

mod console_reporter;

pub use console_reporter::ConsoleReporter;

use crate::domain::Record;

/// Trait for reporting captured records (Interface Segregation Principle).
///
/// Reporters only present records; filtering is done by the
/// subscription they are registered with.
pub trait RecordReporter: Send + Sync {
    /// Report one record.
    fn report(&self, record: &Record);

    /// Called once the session is connected.
    fn on_start(&self, transport: &str);

    /// Called when the session stops.
    fn on_stop(&self);
}
