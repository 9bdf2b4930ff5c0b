use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

// Periodic wakeup guarding waiters against a missed release signal.
const WAKEUP_INTERVAL: Duration = Duration::from_millis(2000);

/// Bounded budget for bytes queued in deferred cache puts.
///
/// A caller acquires a permit for its byte count before spawning the put and
/// the permit releases the budget when dropped, so the release happens even
/// when the put fails or the task is cancelled. A maximum of 0 disables the
/// gate entirely.
#[derive(Debug)]
pub struct PendingPutsBudget {
    max: u64,
    cur: Mutex<u64>,
    released: Notify,
}

impl PendingPutsBudget {
    pub fn new(max: u64) -> Arc<Self> {
        Arc::new(PendingPutsBudget {
            max,
            cur: Mutex::new(0),
            released: Notify::new(),
        })
    }

    /// Reserve `bytes` of the budget, waiting until they fit.
    ///
    /// An idle budget admits any size so a single oversized put cannot wedge
    /// the gate.
    pub async fn acquire(self: &Arc<Self>, bytes: usize) -> PutPermit {
        if self.max == 0 {
            return PutPermit { budget: None, bytes };
        }

        loop {
            let notified = self.released.notified();

            {
                let mut cur = self.cur.lock().unwrap();

                if *cur == 0 || *cur + bytes as u64 <= self.max {
                    *cur += bytes as u64;

                    return PutPermit {
                        budget: Some(Arc::clone(self)),
                        bytes,
                    };
                }
            }

            let _ = tokio::time::timeout(WAKEUP_INTERVAL, notified).await;
        }
    }

    /// Bytes currently reserved.
    pub fn pending(&self) -> u64 {
        *self.cur.lock().unwrap()
    }

    fn release(&self, bytes: usize) {
        {
            let mut cur = self.cur.lock().unwrap();
            *cur = cur.saturating_sub(bytes as u64);
        }
        self.released.notify_waiters();
    }
}

/// Reservation handle, releases its bytes on drop.
#[derive(Debug)]
pub struct PutPermit {
    budget: Option<Arc<PendingPutsBudget>>,
    bytes: usize,
}

impl Drop for PutPermit {
    fn drop(&mut self) {
        if let Some(budget) = self.budget.take() {
            budget.release(self.bytes);
        }
    }
}
