use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

/// Notifications published by the scanner.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// The worker is about to probe this identifier.
    ProbeStarted(String),
    /// Fraction of the current format pass, in `0.0..=1.0`.
    Progress(f32),
    Finished,
    /// The scan was abandoned after the worker kept crashing or could not be
    /// relaunched.
    Failed(String),
    /// The host side plugin list was reloaded from a finished scan.
    PluginListChanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    receiver: Receiver<ScanEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn receiver(&self) -> &Receiver<ScanEvent> {
        &self.receiver
    }

    pub fn try_recv(&self) -> Option<ScanEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ScanEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }
}

/// Fan-out list of event channels. Sending never blocks and never runs
/// subscriber code, so it is safe from any thread that holds no session lock.
#[derive(Debug, Default)]
pub struct Subscribers {
    next_id: AtomicU64,
    senders: Mutex<Vec<(SubscriptionId, Sender<ScanEvent>)>>,
}

impl Subscribers {
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = unbounded();
        self.senders.lock().push((id, tx));
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut senders = self.senders.lock();
        let before = senders.len();
        senders.retain(|(existing, _)| *existing != id);
        senders.len() != before
    }

    pub fn dispatch(&self, events: impl IntoIterator<Item = ScanEvent>) {
        let mut senders = self.senders.lock();
        for event in events {
            senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    pub fn len(&self) -> usize {
        self.senders.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
