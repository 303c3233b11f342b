//! HCI packet parsing module.
//!
//! This module is responsible for parsing raw H4 bytes into domain HCI types (SRP).

mod hci_parser;

pub use hci_parser::HciParser;
