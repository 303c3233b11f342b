//! hcitap - Bluetooth HCI transport and capture core.
//!
//! Opens a raw channel to a local Bluetooth controller (raw HCI socket,
//! exclusive user channel, or a localhost TCP bridge), records every HCI
//! packet to a btsnoop log, fans records out to subscribers and sends
//! commands with reply correlation.
//!
//! ```no_run
//! use std::time::Duration;
//! use hcitap::{Config, Session, TransportMode};
//!
//! let session = Session::new(Config::default())?;
//! session.connect(TransportMode::Hci, "hci0")?;
//! // HCI_Reset
//! let reply = session.send(0x01, &[0x03, 0x0c, 0x00], Some(Duration::from_secs(2)))?;
//! println!("{:?}", reply);
//! session.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod capture;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod domain;
pub mod engine;
pub mod error;
pub mod parser;
pub mod reporter;
pub mod session;
pub mod transport;

pub use capture::BtsnoopWriter;
pub use config::Config;
pub use device::{bring_up, find_device, list_devices};
pub use dispatch::{DispatchRegistry, RecordFilter, SubscriptionId};
pub use domain::{DeviceDescriptor, HciPacket, Record, SharedRecord};
pub use engine::SessionEnd;
pub use error::{CaptureError, ConfigError, ParseError, SendError, TransportError};
pub use session::Session;
pub use transport::{establish, HciChannel, TransportHandle, TransportMode, TransportOptions};
