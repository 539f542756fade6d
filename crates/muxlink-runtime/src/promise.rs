//! One-shot settle cell with any number of waiters.

use std::sync::Mutex;
use tokio::sync::Notify;

/// Settles exactly once; later settles are ignored. Waiters that arrive
/// after settlement resolve immediately.
pub struct SettleCell<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> SettleCell<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Settle the cell. Returns false when it was already settled.
    pub fn settle(&self, value: T) -> bool {
        {
            let mut slot = self.value.lock().expect("settle cell poisoned");
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_settled(&self) -> bool {
        self.value.lock().expect("settle cell poisoned").is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.value.lock().expect("settle cell poisoned").clone()
    }

    pub async fn wait(&self) -> T {
        loop {
            let notified = self.notify.notified();
            if let Some(value) = self.peek() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: Clone> Default for SettleCell<T> {
    fn default() -> Self {
        Self::new()
    }
}
