//! Cache based file data container.
//!
//! [DataManager] is the entry point: it owns the write-session table, the
//! in-flight remote read table, the pending-puts budget and the background
//! delete worker, and exposes the block-level operations the file store is
//! built from.

mod affinity;
mod backpressure;
mod completion;
mod delete;
pub mod file_map;
mod future;
mod writer;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::{debug, error, warn};
use tokio::time::sleep;
use uuid::Uuid;

use crate::cache::{
    AckMessage, BlockCache, BlocksMessage, CacheTx, DataMessage, NodeId, PositionedRead, Transport,
    TxConcurrency, TxIsolation,
};
use crate::common::config::{Configuration, DataConfig};
use crate::error::GridFsError;
use crate::Result;

pub use affinity::BlockLocation;
pub use backpressure::{PendingPutsBudget, PutPermit};
pub use completion::WriteCompletionFuture;
pub use delete::DeleteCompletion;
pub use file_map::{AffinityRange, BlockKey, FileInfo, FileMap, RangeStatus};
pub use future::CompletionCell;
pub use writer::{BlockSource, ReaderSource};

use completion::PendingWrites;
use delete::AsyncDeleteWorker;

/// Block read/write counters of this node.
#[derive(Debug, Default)]
pub struct LocalMetrics {
    blocks_read: AtomicU64,
    blocks_read_secondary: AtomicU64,
    blocks_written: AtomicU64,
    blocks_written_secondary: AtomicU64,
}

impl LocalMetrics {
    pub(crate) fn add_read_blocks(&self, total: u64, secondary: u64) {
        self.blocks_read.fetch_add(total, Ordering::Relaxed);
        self.blocks_read_secondary
            .fetch_add(secondary, Ordering::Relaxed);
    }

    pub(crate) fn add_write_blocks(&self, total: u64, secondary: u64) {
        self.blocks_written.fetch_add(total, Ordering::Relaxed);
        self.blocks_written_secondary
            .fetch_add(secondary, Ordering::Relaxed);
    }

    pub fn blocks_read(&self) -> u64 {
        self.blocks_read.load(Ordering::Relaxed)
    }

    pub fn blocks_read_secondary(&self) -> u64 {
        self.blocks_read_secondary.load(Ordering::Relaxed)
    }

    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    pub fn blocks_written_secondary(&self) -> u64 {
        self.blocks_written_secondary.load(Ordering::Relaxed)
    }
}

/// Block data manager of one file store node.
pub struct DataManager<C: BlockCache, T: Transport> {
    pub(crate) cache: Arc<C>,
    pub(crate) transport: Arc<T>,
    pub(crate) config: DataConfig,
    pub(crate) local_node: NodeId,
    // blocks per implicit affinity group and bytes per group
    pub(crate) grp_size: u64,
    pub(crate) grp_block_size: u64,
    pub(crate) metrics: LocalMetrics,
    pub(crate) pending_writes: Arc<PendingWrites>,
    rmt_read_futs: Mutex<HashMap<BlockKey, Arc<CompletionCell<Result<Bytes>>>>>,
    pending_puts: Arc<PendingPutsBudget>,
    pub(crate) batch_id_ctr: AtomicU64,
    pub(crate) delete_worker: AsyncDeleteWorker,
}

impl<C: BlockCache, T: Transport> DataManager<C, T> {
    /// Create the manager and start its background delete worker. Must be
    /// called within a tokio runtime.
    pub fn start(
        cache: Arc<C>,
        transport: Arc<T>,
        configuration: Configuration,
        local_node: NodeId,
    ) -> Arc<Self> {
        let config = configuration.get_data_config();

        let delete_worker = AsyncDeleteWorker::start(Arc::clone(&cache), config.batch_size);
        let pending_puts = PendingPutsBudget::new(config.max_pending_puts);

        Arc::new(DataManager {
            transport,
            local_node,
            grp_size: config.group_size,
            grp_block_size: config.block_size * config.group_size,
            metrics: LocalMetrics::default(),
            pending_writes: PendingWrites::new(),
            rmt_read_futs: Mutex::new(HashMap::new()),
            pending_puts,
            batch_id_ctr: AtomicU64::new(0),
            delete_worker,
            config,
            cache,
        })
    }

    /// Stop the delete worker and wait for it to exit. A graceful stop
    /// drains queued deletions first, a cancel resolves them as cancelled.
    pub async fn stop(&self, cancel: bool) {
        self.delete_worker.stop(cancel);
        self.delete_worker.join().await;
    }

    /// Bytes used to store file data.
    pub fn space_size(&self) -> u64 {
        self.cache.space_used()
    }

    /// Maximum bytes available for file data.
    pub fn max_space_size(&self) -> u64 {
        self.cache.space_max()
    }

    /// Bytes covered by one implicit affinity group.
    pub fn group_block_size(&self) -> u64 {
        self.grp_block_size
    }

    pub fn metrics(&self) -> &LocalMetrics {
        &self.metrics
    }

    /// Affinity key for the next colocated range written from this node.
    /// Keeps the previous key while it still maps locally to prevent
    /// unnecessary file map growth.
    pub fn next_affinity_key(&self, prev: Option<Uuid>) -> Uuid {
        if let Some(prev) = prev {
            if self.cache.primary_node_for_key(&prev) == self.local_node {
                return prev;
            }
        }

        loop {
            let key = Uuid::new_v4();

            if self.cache.primary_node_for_key(&key) == self.local_node {
                return key;
            }
        }
    }

    /// Primary node for a raw affinity key.
    pub fn affinity_node(&self, affinity_key: &Uuid) -> NodeId {
        self.cache.primary_node_for_key(affinity_key)
    }

    /// Open a write session for `file`, returning the future completed when
    /// every dispatched batch is acknowledged or the session fails.
    ///
    /// Panics if a session for the same file id is already open; concurrent
    /// write streams for one file are a caller contract violation.
    pub fn write_start(&self, file: &FileInfo) -> Arc<WriteCompletionFuture> {
        let fut = self.pending_writes.register(file.id());

        debug!(
            "registered write completion future for file output stream [file_id={}]",
            file.id()
        );

        fut
    }

    /// Notify the manager that no further writes will happen on the stream.
    pub fn write_close(&self, file: &FileInfo) {
        match self.pending_writes.get(&file.id()) {
            Some(fut) => fut.mark_waiting_last_ack(),
            None => debug!(
                "failed to find write completion future for file in pending write map, most \
                 likely it was failed [file_id={}]",
                file.id()
            ),
        }
    }

    /// Wait until every batch dispatched so far has been acknowledged.
    pub async fn await_all_acks_received(&self, file_id: Uuid) {
        if let Some(fut) = self.pending_writes.get(&file_id) {
            fut.await_all_acks_received().await;
        }
    }

    /// Queue removal of all blocks of `file` with the background worker.
    pub fn delete(&self, file: &FileInfo) -> DeleteCompletion {
        self.delete_worker.delete_async(file)
    }

    /// Completes once every deletion queued so far has been processed. The
    /// out-of-space path waits on this before giving up.
    pub fn await_deletes(&self) -> DeleteCompletion {
        self.delete_worker.flush()
    }

    /// Get one data block, optionally filling it from a secondary source
    /// when the cache has no copy. Missing blocks read as `None`; per-block
    /// sparseness is legal.
    pub async fn data_block(
        &self,
        file: &FileInfo,
        block_idx: u64,
        secondary: Option<&dyn PositionedRead>,
    ) -> Result<Option<Bytes>> {
        let key = self.block_key(block_idx, file);

        if let Some(bytes) = self.cache.get(&key).await? {
            self.metrics.add_read_blocks(1, 0);

            return Ok(Some(bytes));
        }

        let Some(reader) = secondary else {
            self.metrics.add_read_blocks(1, 0);

            return Ok(None);
        };

        // concurrent readers of the same missing block coalesce onto a
        // single upstream fetch
        let (cell, owner) = {
            let mut futs = self.rmt_read_futs.lock().unwrap();

            match futs.entry(key.clone()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
                Entry::Vacant(entry) => {
                    let cell = Arc::new(CompletionCell::new());
                    entry.insert(Arc::clone(&cell));
                    (cell, true)
                }
            }
        };

        if !owner {
            let bytes = cell.wait().await?;

            self.metrics.add_read_blocks(1, 0);

            return Ok(Some(bytes));
        }

        debug!(
            "reading data block from the secondary source [file_id={}, block_idx={block_idx}]",
            file.id()
        );

        let res = self.read_secondary_block(file, block_idx, reader);

        let removed = self.rmt_read_futs.lock().unwrap().remove(&key);
        debug_assert!(removed.is_some());

        match res {
            Ok(bytes) => {
                cell.complete(Ok(bytes.clone()));

                self.put_safe(key, bytes.clone()).await;

                self.metrics.add_read_blocks(1, 1);

                Ok(Some(bytes))
            }
            Err(e) => {
                cell.complete(Err(e.clone()));

                Err(e)
            }
        }
    }

    fn read_secondary_block(
        &self,
        file: &FileInfo,
        block_idx: u64,
        reader: &dyn PositionedRead,
    ) -> Result<Bytes> {
        let block_size = file.block_size() as usize;
        let pos = block_idx * file.block_size() as u64;

        let mut buf = vec![0u8; block_size];
        let mut read = 0usize;

        while read < block_size {
            let r = reader
                .read(pos + read as u64, &mut buf[read..])
                .map_err(|e| {
                    GridFsError::IOError(format!(
                        "failed to read data from the secondary source: {e}"
                    ))
                })?;

            if r == 0 {
                break;
            }

            read += r;
        }

        // a short read past the end of the file trims the block
        buf.truncate(read);

        Ok(Bytes::from(buf))
    }

    /// Queue a deferred put of a block read from the secondary source,
    /// blocking while the pending-puts budget is exhausted.
    async fn put_safe(&self, key: BlockKey, data: Bytes) {
        let permit = self.pending_puts.acquire(data.len()).await;

        let cache = Arc::clone(&self.cache);
        let file_id = key.file_id();
        let block_idx = key.block_idx();

        tokio::spawn(async move {
            if let Err(e) = cache.put(key, data).await {
                warn!(
                    "failed to put data block into cache [file_id={file_id}, \
                     block_idx={block_idx}, err={e:?}]"
                );
            }

            drop(permit);
        });
    }

    /// Inbound handler for the two data-plane message kinds.
    pub fn on_message(self: &Arc<Self>, node: NodeId, msg: DataMessage) {
        match msg {
            DataMessage::Blocks(m) => self.process_blocks_message(node, m),
            DataMessage::Ack(m) => self.process_ack_message(node, m),
        }
    }

    /// A node left the cluster: fail every session still waiting on it.
    pub fn on_node_left(&self, node: NodeId) {
        for fut in self.pending_writes.all() {
            fut.on_error(
                node,
                GridFsError::NodeFailure(format!("node left grid before write completed: {node}")),
            );
        }
    }

    fn process_blocks_message(self: &Arc<Self>, node: NodeId, msg: BlocksMessage) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let error = this.store_blocks(msg.blocks).await.err();

            let ack = DataMessage::Ack(AckMessage {
                file_id: msg.file_id,
                batch_id: msg.batch_id,
                error,
            });

            if let Err(e) = this.transport.send(node, ack).await {
                warn!(
                    "failed to send batch acknowledgement, did node leave the grid? \
                     [node={node}, file_id={}, batch_id={}, err={e:?}]",
                    msg.file_id, msg.batch_id
                );
            }
        });
    }

    fn process_ack_message(&self, node: NodeId, msg: AckMessage) {
        match self.pending_writes.get(&msg.file_id) {
            Some(fut) => match msg.error {
                Some(e) => fut.on_error(node, e),
                None => fut.on_write_ack(node, msg.batch_id),
            },
            None => debug!(
                "received write acknowledgement for non-existent write future, most likely the \
                 future was failed [node={node}, file_id={}]",
                msg.file_id
            ),
        }
    }

    /// Remove the blocks of an affinity range, optionally including their
    /// non-colocated twins. Failures are logged, the sweep is best-effort.
    pub async fn clean_blocks(
        &self,
        file: &FileInfo,
        range: &AffinityRange,
        clean_non_colocated: bool,
    ) {
        let block_size = file.block_size() as u64;

        let start_idx = range.start_offset() / block_size;
        let end_idx = range.end_offset() / block_size;

        debug!(
            "cleaning blocks [file_id={}, range={range:?}, clean_non_colocated=\
             {clean_non_colocated}, start_idx={start_idx}, end_idx={end_idx}]",
            file.id()
        );

        let mut keys = Vec::with_capacity(self.config.batch_size);

        for idx in start_idx..=end_idx {
            keys.push(BlockKey::new(
                file.id(),
                Some(range.affinity_key()),
                file.evict_exclude(),
                idx,
            ));

            if clean_non_colocated {
                keys.push(BlockKey::new(file.id(), None, file.evict_exclude(), idx));
            }

            if keys.len() >= self.config.batch_size {
                if let Err(e) = self.cache.remove_keys(std::mem::take(&mut keys)).await {
                    error!(
                        "failed to clean up file range [file_id={}, range={range:?}]: {e:?}",
                        file.id()
                    );

                    return;
                }
            }
        }

        if !keys.is_empty() {
            if let Err(e) = self.cache.remove_keys(keys).await {
                error!(
                    "failed to clean up file range [file_id={}, range={range:?}]: {e:?}",
                    file.id()
                );
            }
        }
    }

    /// Copy all colocated blocks of a range onto non-colocated keys. Full
    /// blocks stream through throttled batched puts; a partially written
    /// block is moved under a pessimistic transaction so readers of either
    /// variant stay consistent.
    pub async fn spread_blocks(&self, file: &FileInfo, range: &AffinityRange) {
        let block_size = file.block_size() as u64;

        let start_idx = range.start_offset() / block_size;
        let end_idx = range.end_offset() / block_size;

        let mut batch: Vec<(BlockKey, Bytes)> = Vec::new();
        let mut bytes_processed: u64 = 0;

        for idx in start_idx..=end_idx {
            let colocated = BlockKey::new(
                file.id(),
                Some(range.affinity_key()),
                file.evict_exclude(),
                idx,
            );
            let plain = BlockKey::new(file.id(), None, file.evict_exclude(), idx);

            // most of the time this is a local get
            let block = match self.cache.get(&colocated).await {
                Ok(Some(block)) => block,
                Ok(None) => {
                    debug!(
                        "failed to find colocated file block for spread, will ignore \
                         [file_id={}, idx={idx}]",
                        file.id()
                    );

                    continue;
                }
                Err(e) => {
                    error!(
                        "failed to spread file range [file_id={}, range={range:?}]: {e:?}",
                        file.id()
                    );

                    return;
                }
            };

            bytes_processed += block.len() as u64;

            if block.len() as u64 != block_size {
                if let Err(e) = self.spread_partial_block(&colocated, &plain).await {
                    error!(
                        "failed to spread file range [file_id={}, range={range:?}]: {e:?}",
                        file.id()
                    );

                    return;
                }
            } else {
                batch.push((plain, block));
            }

            if bytes_processed >= self.config.fragmentizer_throttling_block_length {
                if !batch.is_empty() {
                    if let Err(e) = self.cache.put_all(std::mem::take(&mut batch)).await {
                        error!(
                            "failed to spread file range [file_id={}, range={range:?}]: {e:?}",
                            file.id()
                        );

                        return;
                    }
                }

                bytes_processed = 0;

                sleep(self.config.fragmentizer_throttling_delay).await;
            }
        }

        if !batch.is_empty() {
            if let Err(e) = self.cache.put_all(batch).await {
                error!(
                    "failed to spread file range [file_id={}, range={range:?}]: {e:?}",
                    file.id()
                );
            }
        }
    }

    async fn spread_partial_block(&self, colocated: &BlockKey, plain: &BlockKey) -> Result<()> {
        let mut tx = self
            .cache
            .tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead)
            .await?;

        let vals = tx.get_all(&[colocated.clone(), plain.clone()]).await?;

        match vals.get(colocated) {
            Some(val) => {
                tx.put(plain.clone(), val.clone()).await?;

                tx.commit().await
            }
            // the file is being deleted concurrently
            None => {
                debug!("failed to find colocated file block for spread, will ignore [key={colocated:?}]");

                Ok(())
            }
        }
    }
}
