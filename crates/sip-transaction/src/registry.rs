use std::collections::HashMap;
use std::sync::Mutex;

use smol_str::SmolStr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Named one-shot timers that deliver an event into their owner's mailbox.
///
/// Contract: setting a timer under a name that already exists cancels the
/// prior timer first. A timer that fires after the owning mailbox is gone is
/// a no-op, so holders never need to race cancellation against teardown.
pub struct TimerRegistry<E> {
    tx: mpsc::Sender<E>,
    entries: Mutex<HashMap<SmolStr, JoinHandle<()>>>,
}

impl<E: Send + 'static> TimerRegistry<E> {
    /// Creates a registry delivering fired events to `tx`.
    pub fn new(tx: mpsc::Sender<E>) -> Self {
        Self {
            tx,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Arms (or re-arms) the named timer.
    pub fn set(&self, name: &str, duration: Duration, event: E) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            // Owner gone means nothing to deliver to.
            let _ = tx.send(event).await;
        });
        let mut entries = self.entries.lock().unwrap();
        if let Some(prior) = entries.insert(SmolStr::new(name), handle) {
            prior.abort();
        }
    }

    /// Cancels the named timer if armed.
    pub fn cancel(&self, name: &str) {
        if let Some(handle) = self.entries.lock().unwrap().remove(name) {
            handle.abort();
        }
    }

    /// Cancels every armed timer. Required before owner destruction.
    pub fn cancel_all(&self) {
        let mut entries = self.entries.lock().unwrap();
        for (_, handle) in entries.drain() {
            handle.abort();
        }
    }

    /// True when the named timer is currently armed.
    pub fn is_armed(&self, name: &str) -> bool {
        self.entries.lock().unwrap().contains_key(name)
    }
}

impl<E> Drop for TimerRegistry<E> {
    fn drop(&mut self) {
        for (_, handle) in self.entries.lock().unwrap().drain() {
            handle.abort();
        }
    }
}
