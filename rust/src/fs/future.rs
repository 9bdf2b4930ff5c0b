use std::sync::Mutex;

use tokio::sync::Notify;

/// Single-writer, multi-reader result cell.
///
/// The first `complete` wins; every `wait` caller observes the same value.
/// Replaces the callback-chained futures of a listener-style design with a
/// value any number of tasks can await.
#[derive(Debug, Default)]
pub struct CompletionCell<T: Clone> {
    state: Mutex<Option<T>>,
    notify: Notify,
}

impl<T: Clone> CompletionCell<T> {
    pub fn new() -> Self {
        CompletionCell {
            state: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Complete the cell, returning false if it was already completed.
    pub fn complete(&self, value: T) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.is_some() {
                return false;
            }
            *state = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub fn try_get(&self) -> Option<T> {
        self.state.lock().unwrap().clone()
    }

    pub async fn wait(&self) -> T {
        loop {
            // register before checking so a concurrent complete isn't missed
            let notified = self.notify.notified();
            if let Some(value) = self.try_get() {
                return value;
            }
            notified.await;
        }
    }
}
