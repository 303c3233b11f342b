use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, error, warn};

use crate::domain::{Record, SharedRecord};

/// Predicate deciding whether a queue wants a record.
pub type RecordFilter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;

/// Callback invoked synchronously for every record.
pub type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;

/// Handle returned by every registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
struct QueueSubscription {
    id: SubscriptionId,
    sender: SyncSender<SharedRecord>,
    filter: Option<RecordFilter>,
}

#[derive(Clone)]
struct CallbackSubscription {
    id: SubscriptionId,
    callback: RecordCallback,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Queues the record was enqueued on
    pub enqueued: usize,
    /// Queues that were full and lost the record
    pub dropped: usize,
    /// Callbacks that ran to completion
    pub callbacks: usize,
}

/// Registry of queue and callback subscriptions.
///
/// Registration and removal may happen from any thread, including from
/// inside a callback: fan-out works on a snapshot of the subscription
/// lists, so no lock is held while records are delivered.
#[derive(Default)]
pub struct DispatchRegistry {
    next_id: AtomicU64,
    queues: RwLock<Vec<QueueSubscription>>,
    callbacks: RwLock<Vec<CallbackSubscription>>,
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bounded queue of `capacity` records and subscribe it.
    pub fn register_queue(
        &self,
        capacity: usize,
        filter: Option<RecordFilter>,
    ) -> (SubscriptionId, Receiver<SharedRecord>) {
        let (sender, receiver) = mpsc::sync_channel(capacity.max(1));
        (self.register_sender(sender, filter), receiver)
    }

    /// Subscribe an existing bounded sender.
    pub fn register_sender(
        &self,
        sender: SyncSender<SharedRecord>,
        filter: Option<RecordFilter>,
    ) -> SubscriptionId {
        let id = self.allocate_id();
        write(&self.queues).push(QueueSubscription { id, sender, filter });
        debug!("Registered queue subscription {}", id);
        id
    }

    /// Subscribe a callback.
    pub fn register_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&Record) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        write(&self.callbacks).push(CallbackSubscription {
            id,
            callback: Arc::new(callback),
        });
        debug!("Registered callback subscription {}", id);
        id
    }

    /// Remove a subscription. Returns false if `id` was not registered.
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let removed = remove(&mut write(&self.queues), |s| s.id == id)
            || remove(&mut write(&self.callbacks), |s| s.id == id);
        if removed {
            debug!("Unregistered subscription {}", id);
        } else {
            debug!("Subscription {} is not registered", id);
        }
        removed
    }

    pub fn queue_count(&self) -> usize {
        read(&self.queues).len()
    }

    pub fn callback_count(&self) -> usize {
        read(&self.callbacks).len()
    }

    /// Deliver `record` to every matching queue, then run every callback.
    ///
    /// Never blocks: a full queue loses this record, a queue whose
    /// receiver is gone is pruned, and a panicking callback is logged.
    pub fn dispatch(&self, record: &SharedRecord) -> DispatchSummary {
        let queues = read(&self.queues).clone();
        let callbacks = read(&self.callbacks).clone();

        let mut summary = DispatchSummary::default();
        let mut disconnected = Vec::new();

        for sub in &queues {
            if !accepts(sub, record) {
                continue;
            }
            match sub.sender.try_send(Arc::clone(record)) {
                Ok(()) => summary.enqueued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        "Receive queue {} is full, dropping {} packet ({} bytes)",
                        sub.id,
                        record.packet.kind(),
                        record.raw.len()
                    );
                    summary.dropped += 1;
                }
                Err(TrySendError::Disconnected(_)) => disconnected.push(sub.id),
            }
        }

        if !disconnected.is_empty() {
            let mut queues = write(&self.queues);
            queues.retain(|s| !disconnected.contains(&s.id));
            debug!("Pruned {} abandoned queue subscriptions", disconnected.len());
        }

        for sub in &callbacks {
            let callback = &sub.callback;
            match panic::catch_unwind(AssertUnwindSafe(|| callback(record))) {
                Ok(()) => summary.callbacks += 1,
                Err(cause) => error!(
                    "Callback {} panicked: {}",
                    sub.id,
                    panic_message(cause.as_ref())
                ),
            }
        }

        summary
    }

    fn allocate_id(&self) -> SubscriptionId {
        SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

fn accepts(sub: &QueueSubscription, record: &Record) -> bool {
    let Some(filter) = &sub.filter else {
        return true;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| filter(record))) {
        Ok(accepted) => accepted,
        Err(cause) => {
            error!(
                "Filter of queue {} panicked: {}",
                sub.id,
                panic_message(cause.as_ref())
            );
            false
        }
    }
}

fn remove<T>(list: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> bool {
    match list.iter().position(matches) {
        Some(index) => {
            list.remove(index);
            true
        }
        None => false,
    }
}

fn panic_message(cause: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = cause.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = cause.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "unknown panic"
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::HciPacket;
    use crate::parser::HciParser;
    use std::sync::atomic::AtomicUsize;

    fn record(raw: &[u8]) -> SharedRecord {
        Arc::new(Record::captured(raw.to_vec(), HciParser::new().decode(raw)))
    }

    fn events_only() -> RecordFilter {
        Arc::new(|r: &Record| matches!(r.packet, HciPacket::Event { .. }))
    }

    #[test]
    fn test_fan_out_respects_filters() {
        let registry = DispatchRegistry::new();
        let (_, all) = registry.register_queue(10, None);
        let (_, events) = registry.register_queue(10, Some(events_only()));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        registry.register_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        registry.dispatch(&record(&[0x04, 0x0e, 0x01, 0x01]));
        registry.dispatch(&record(&[0x01, 0x03, 0x0c, 0x00]));
        registry.dispatch(&record(&[0x04, 0x0f, 0x01, 0x00]));

        assert_eq!(all.try_iter().count(), 3);
        let kinds: Vec<u8> = events.try_iter().map(|r| r.raw[1]).collect();
        assert_eq!(kinds, vec![0x0e, 0x0f]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_queue_preserves_arrival_order() {
        let registry = DispatchRegistry::new();
        let (_, rx) = registry.register_queue(100, None);

        for i in 0u8..50 {
            registry.dispatch(&record(&[0x04, 0x13, 0x01, i]));
        }

        let seen: Vec<u8> = rx.try_iter().map(|r| r.raw[3]).collect();
        assert_eq!(seen, (0u8..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_full_queue_does_not_starve_others() {
        let registry = DispatchRegistry::new();
        let (_, small) = registry.register_queue(1, None);
        let (_, large) = registry.register_queue(100, None);

        let mut dropped = 0;
        for i in 0u8..10 {
            dropped += registry.dispatch(&record(&[0x04, 0x13, 0x01, i])).dropped;
        }

        assert_eq!(dropped, 9);
        assert_eq!(small.try_iter().count(), 1);
        assert_eq!(large.try_iter().count(), 10);
    }

    #[test]
    fn test_dropped_receiver_is_pruned() {
        let registry = DispatchRegistry::new();
        let (_, rx) = registry.register_queue(4, None);
        drop(rx);
        assert_eq!(registry.queue_count(), 1);

        registry.dispatch(&record(&[0x04, 0x0e, 0x00]));
        assert_eq!(registry.queue_count(), 0);
    }

    #[test]
    fn test_unregister() {
        let registry = DispatchRegistry::new();
        let (queue, rx) = registry.register_queue(4, None);
        let callback = registry.register_callback(|_| {});
        assert_ne!(queue, callback);

        assert!(registry.unregister(queue));
        assert!(registry.unregister(callback));
        assert!(!registry.unregister(queue));
        assert_eq!(registry.queue_count(), 0);
        assert_eq!(registry.callback_count(), 0);

        registry.dispatch(&record(&[0x04, 0x0e, 0x00]));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_panicking_callback_is_isolated() {
        let registry = DispatchRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));

        registry.register_callback(|_| panic!("consumer bug"));
        let counter = Arc::clone(&hits);
        registry.register_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let summary = registry.dispatch(&record(&[0x04, 0x0e, 0x00]));
        assert_eq!(summary.callbacks, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_unregister_itself() {
        let registry = Arc::new(DispatchRegistry::new());
        let slot = Arc::new(std::sync::Mutex::new(None::<SubscriptionId>));

        let reg = Arc::clone(&registry);
        let own_id = Arc::clone(&slot);
        let id = registry.register_callback(move |_| {
            if let Some(id) = own_id.lock().unwrap().take() {
                reg.unregister(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        registry.dispatch(&record(&[0x04, 0x0e, 0x00]));
        assert_eq!(registry.callback_count(), 0);
    }

    #[test]
    fn test_queue_registered_mid_dispatch_sees_later_records() {
        let registry = Arc::new(DispatchRegistry::new());
        let late = Arc::new(std::sync::Mutex::new(None));

        let reg = Arc::clone(&registry);
        let sink = Arc::clone(&late);
        registry.register_callback(move |_| {
            let mut late = sink.lock().unwrap();
            if late.is_none() {
                *late = Some(reg.register_queue(8, None).1);
            }
        });

        let first = registry.dispatch(&record(&[0x04, 0x0e, 0x01, 0x01]));
        assert_eq!(first.enqueued, 0);
        assert_eq!(registry.queue_count(), 1);

        registry.dispatch(&record(&[0x04, 0x0e, 0x01, 0x02]));
        registry.dispatch(&record(&[0x04, 0x0e, 0x01, 0x03]));

        let late = late.lock().unwrap();
        let rx = late.as_ref().unwrap();
        let received: Vec<Vec<u8>> = rx.try_iter().map(|r| r.raw.clone()).collect();
        assert_eq!(
            received,
            vec![vec![0x04, 0x0e, 0x01, 0x02], vec![0x04, 0x0e, 0x01, 0x03]]
        );
    }
}
