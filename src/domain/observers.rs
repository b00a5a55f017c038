//! Observer list backed by unbounded tokio channels.
//!
//! Platform callbacks publish synchronously; every registered receiver gets
//! its own copy. Dropping a receiver unregisters it on the next publish.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

pub struct Observers<T> {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<T>>>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<T> Default for Observers<T> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<T: Clone> Observers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `value` to every live observer
    pub fn publish(&self, value: T) {
        self.lock().retain(|tx| tx.send(value.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.senders.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
