use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::cache::NodeId;
use crate::error::GridFsError;
use crate::fs::future::CompletionCell;
use crate::Result;

/// Process-scoped table of open write sessions, keyed by file id.
///
/// A session removes itself from the table inside its terminal transition,
/// so a fresh session for the same file can never collide with a finished
/// one. Lock order is session first, table second; the table lock is never
/// held while a session lock is taken.
#[derive(Debug, Default)]
pub(crate) struct PendingWrites {
    map: Mutex<HashMap<Uuid, Arc<WriteCompletionFuture>>>,
}

impl PendingWrites {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a write session for `file_id`. Opening a second concurrent
    /// session for the same file is a caller bug and panics.
    pub(crate) fn register(self: &Arc<Self>, file_id: Uuid) -> Arc<WriteCompletionFuture> {
        let fut = Arc::new(WriteCompletionFuture {
            file_id,
            inner: Mutex::new(Inner {
                ack_map: HashMap::new(),
                state: WriteState::Open,
            }),
            acks: Notify::new(),
            done: CompletionCell::new(),
            registry: Arc::downgrade(self),
        });

        match self.map.lock().unwrap().entry(file_id) {
            Entry::Occupied(_) => {
                panic!("protocol violation: write session already open for file {file_id}")
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&fut));
            }
        }

        fut
    }

    pub(crate) fn get(&self, file_id: &Uuid) -> Option<Arc<WriteCompletionFuture>> {
        self.map.lock().unwrap().get(file_id).cloned()
    }

    pub(crate) fn all(&self) -> Vec<Arc<WriteCompletionFuture>> {
        self.map.lock().unwrap().values().cloned().collect()
    }

    fn remove(&self, file_id: Uuid, fut: &WriteCompletionFuture) {
        let mut map = self.map.lock().unwrap();
        if let Some(cur) = map.get(&file_id) {
            if std::ptr::eq(Arc::as_ptr(cur), fut) {
                map.remove(&file_id);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteState {
    Open,
    AwaitingLast,
    Done,
}

#[derive(Debug)]
struct Inner {
    // in-flight batches awaiting acknowledgment, batch id -> owning node
    ack_map: HashMap<u64, NodeId>,
    state: WriteState,
}

/// Tracks outstanding batch acknowledgments of one open write stream.
///
/// The session completes successfully only once the stream was closed and
/// every registered batch has been acknowledged; a single node failure
/// invalidates the whole session. Exactly one terminal transition ever
/// happens, later calls are no-ops.
#[derive(Debug)]
pub struct WriteCompletionFuture {
    file_id: Uuid,
    inner: Mutex<Inner>,
    acks: Notify,
    done: CompletionCell<Result<bool>>,
    registry: Weak<PendingWrites>,
}

impl WriteCompletionFuture {
    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    /// A write batch was dispatched to `node` and will be acknowledged under
    /// `batch_id`.
    pub(crate) fn on_write_request(&self, node: NodeId, batch_id: u64) {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == WriteState::Done {
            return;
        }

        let pushed_out = inner.ack_map.insert(batch_id, node);
        assert!(
            pushed_out.is_none(),
            "protocol violation: batch {batch_id} registered twice"
        );
    }

    /// Acknowledgment for `batch_id` arrived from `node`.
    pub(crate) fn on_write_ack(&self, node: NodeId, batch_id: u64) {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == WriteState::Done {
            return;
        }

        let removed = inner.ack_map.remove(&batch_id);
        assert_eq!(
            removed,
            Some(node),
            "protocol violation: acknowledgement for unregistered batch [node={node}, batch_id={batch_id}]"
        );

        if inner.ack_map.is_empty() {
            self.acks.notify_waiters();

            if inner.state == WriteState::AwaitingLast {
                self.complete(inner, Ok(true));
            }
        }
    }

    /// A write failed on `node`. Only sessions with batches pending toward
    /// that node are affected; one failed batch fails the whole session.
    pub(crate) fn on_error(&self, node: NodeId, err: GridFsError) {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == WriteState::Done {
            return;
        }

        if !inner.ack_map.values().any(|n| *n == node) {
            return;
        }

        inner.ack_map.clear();
        self.acks.notify_waiters();

        let wrapped = match err {
            GridFsError::OutOfSpace(msg) => GridFsError::OutOfSpace(format!(
                "failed to write data, not enough space on node {node}: {msg}"
            )),
            other => GridFsError::NodeFailure(format!(
                "failed to wait for write completion, write failed on node {node}: {other:?}"
            )),
        };

        self.complete(inner, Err(wrapped));
    }

    /// Fail the session outright, regardless of which nodes have batches
    /// outstanding.
    pub(crate) fn fail(&self, err: GridFsError) {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == WriteState::Done {
            return;
        }

        inner.ack_map.clear();
        self.acks.notify_waiters();

        self.complete(inner, Err(err));
    }

    /// The writer closed the stream; the session completes as soon as no
    /// acknowledgment is outstanding.
    pub(crate) fn mark_waiting_last_ack(&self) {
        let mut inner = self.inner.lock().unwrap();

        if inner.state == WriteState::Done {
            return;
        }

        inner.state = WriteState::AwaitingLast;

        debug!(
            "marked write completion future as awaiting last ack: {}",
            self.file_id
        );

        if inner.ack_map.is_empty() {
            self.complete(inner, Ok(true));
        }
    }

    fn complete(&self, mut inner: MutexGuard<'_, Inner>, res: Result<bool>) {
        inner.state = WriteState::Done;

        // deregister before the result becomes visible so a fresh session
        // for the same file cannot collide with this one
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.file_id, self);
        }

        drop(inner);

        self.done.complete(res);
    }

    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    pub fn try_result(&self) -> Option<Result<bool>> {
        self.done.try_get()
    }

    /// Wait for the terminal state of the session.
    pub async fn wait(&self) -> Result<bool> {
        self.done.wait().await
    }

    /// Wait until no batch acknowledgment is outstanding. Errors also clear
    /// the outstanding set, so this returns on failed sessions too.
    pub async fn await_all_acks_received(&self) {
        loop {
            let notified = self.acks.notified();
            if self.inner.lock().unwrap().ack_map.is_empty() {
                return;
            }
            notified.await;
        }
    }
}
