//! Fan-out of received records to subscribers.
//!
//! Two kinds of subscription exist: bounded queues (with an optional
//! filter) and synchronous callbacks. The receive engine hands every
//! record to [`DispatchRegistry::dispatch`]; consumers read their queues
//! on their own threads.

mod registry;

pub use registry::{DispatchRegistry, DispatchSummary, RecordCallback, RecordFilter, SubscriptionId};
