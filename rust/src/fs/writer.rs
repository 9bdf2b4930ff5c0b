use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use log::debug;
use tokio::time::timeout;
use uuid::Uuid;

use crate::cache::{
    BlockCache, BlockUpdate, BlocksMessage, CacheTx, DataMessage, NodeId, Transport, TxConcurrency,
    TxIsolation, WorkerBatch,
};
use crate::error::GridFsError;
use crate::fs::file_map::{AffinityRange, BlockKey, FileInfo};
use crate::fs::DataManager;
use crate::Result;

/// Minimal capability the block writer needs from a data source: fill a
/// slice with the next bytes. One generic writer serves both in-memory
/// buffers and streaming readers.
pub trait BlockSource {
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()>;
}

impl BlockSource for Bytes {
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        if self.len() < dst.len() {
            return Err(GridFsError::InternalError(format!(
                "source exhausted [needed={}, available={}]",
                dst.len(),
                self.len()
            )));
        }

        self.copy_to_slice(dst);

        Ok(())
    }
}

/// Adapter turning any [Read] into a [BlockSource].
pub struct ReaderSource<R>(pub R);

impl<R: Read> BlockSource for ReaderSource<R> {
    fn read_into(&mut self, dst: &mut [u8]) -> Result<()> {
        Ok(self.0.read_exact(dst)?)
    }
}

impl<C: BlockCache, T: Transport> DataManager<C, T> {
    /// Cache key of one block of a file, as seen by readers.
    ///
    /// A whole-file affinity key colocates every block under it; otherwise a
    /// key already assigned to the block's offset range is reused; otherwise
    /// the key carries no affinity key and placement falls back to implicit
    /// block grouping.
    pub fn block_key(&self, block_idx: u64, file: &FileInfo) -> BlockKey {
        if let Some(affinity_key) = file.affinity_key() {
            return BlockKey::new(file.id(), Some(affinity_key), file.evict_exclude(), block_idx);
        }

        let affinity_key = file
            .file_map()
            .affinity_key(block_idx * file.block_size() as u64, false);

        BlockKey::new(file.id(), affinity_key, file.evict_exclude(), block_idx)
    }

    /// Cache key of one block during an active write, growing the stream's
    /// colocation range opportunistically.
    pub(crate) fn create_block_key(
        &self,
        block: u64,
        file: &FileInfo,
        loc_range: Option<&mut AffinityRange>,
    ) -> BlockKey {
        if let Some(affinity_key) = file.affinity_key() {
            return BlockKey::new(file.id(), Some(affinity_key), file.evict_exclude(), block);
        }

        let block_start = block * file.block_size() as u64;

        // no colocation attempted for this stream
        let Some(loc_range) = loc_range else {
            let affinity_key = file.file_map().affinity_key(block_start, false);

            return BlockKey::new(file.id(), affinity_key, file.evict_exclude(), block);
        };

        // the range is already closed for this offset, use the prior key
        if loc_range.less(block_start) {
            let affinity_key = file.file_map().affinity_key(block_start, false);

            return BlockKey::new(file.id(), affinity_key, file.evict_exclude(), block);
        }

        if !loc_range.belongs(block_start) {
            loc_range.expand(block_start, file.block_size() as u64);
        }

        BlockKey::new(
            file.id(),
            Some(loc_range.affinity_key()),
            file.evict_exclude(),
            block,
        )
    }

    /// Store the bytes of `remainder` + `src` as blocks of `file`.
    ///
    /// The covered span ends at `reserved_len`; full blocks are batched per
    /// owning node, partial blocks are merged transactionally. Without
    /// `flush`, a trailing partial block is handed back as the new remainder
    /// for the caller to prepend to its next write instead of being stored.
    ///
    /// Note: if the file is deleted concurrently the stored blocks are lost.
    #[allow(clippy::too_many_arguments)]
    pub async fn store_data_blocks<S: BlockSource>(
        self: &Arc<Self>,
        file: &FileInfo,
        reserved_len: u64,
        remainder: Option<Bytes>,
        mut src: S,
        src_len: usize,
        flush: bool,
        mut affinity_range: Option<&mut AffinityRange>,
        batch: Option<&dyn WorkerBatch>,
    ) -> Result<Option<Bytes>> {
        let id = file.id();
        let block_size = file.block_size() as u64;

        let mut remainder = remainder.unwrap_or_default();
        let remainder_len = remainder.len();

        let len = (remainder_len + src_len) as u64;

        if len > reserved_len {
            return Err(GridFsError::OverCapacity(format!(
                "not enough space reserved to store data [file_id={id}, reserved_len={reserved_len}, \
                 remainder_len={remainder_len}, data_len={src_len}]"
            )));
        }

        let start = reserved_len - len;
        let first = start / block_size;
        let limit = (start + len).div_ceil(block_size);

        let mut written: u64 = 0;

        let mut node_blocks: Vec<(BlockKey, Bytes)> = Vec::with_capacity((limit - first) as usize);
        let mut node: NodeId = self.local_node;
        let mut off: u64 = 0;

        for block in first..limit {
            let block_start_off = if block == first { start % block_size } else { 0 };
            let block_end_off = if block == limit - 1 {
                (start + len - 1) % block_size
            } else {
                block_size - 1
            };

            let size = (block_end_off - block_start_off + 1) as usize;

            debug_assert!(size > 0 && size as u64 <= block_size);
            debug_assert!(block_start_off + size as u64 <= block_size);

            let mut portion = BytesMut::zeroed(size);

            // the remainder is consumed first, then the source tops up
            let portion_off = size.min(remainder.len());

            if portion_off > 0 {
                remainder.copy_to_slice(&mut portion[..portion_off]);
            }

            if portion_off < size {
                src.read_into(&mut portion[portion_off..])?;
            }

            let portion = portion.freeze();

            // updates the active range if necessary
            let key = self.create_block_key(block, file, affinity_range.as_deref_mut());

            let primary = self.cache.primary_node(&key);

            if block == first {
                off = block_start_off;
                node = primary;
            }

            if size as u64 == block_size {
                debug_assert!(
                    block_start_off == 0,
                    "cannot write a whole block from a non-zero position [start={start}, block={block}]"
                );
            } else if block_start_off == 0 && !flush {
                // trailing partial block and no flush requested: hand the
                // bytes back for the caller to resubmit with its next write
                debug_assert!(written + portion.len() as u64 == len);

                if !node_blocks.is_empty() {
                    let flushed = node_blocks.len();

                    self.process_batch(id, node, std::mem::take(&mut node_blocks))
                        .await?;

                    self.metrics.add_write_blocks(flushed as u64, 0);
                }

                return Ok(Some(portion));
            }

            let mut written_secondary = 0;

            if let Some(batch) = batch {
                if !batch.write(&portion) {
                    return Err(GridFsError::IOError(
                        "cannot write more data to the secondary output batch because it was \
                         marked as closed"
                            .to_string(),
                    ));
                }

                written_secondary = 1;
            }

            // destination changed, flush what has accumulated so far
            if primary != node {
                if !node_blocks.is_empty() {
                    let flushed = node_blocks.len();

                    self.process_batch(id, node, std::mem::take(&mut node_blocks))
                        .await?;

                    self.metrics.add_write_blocks(flushed as u64, 0);
                }

                node = primary;
            }

            written += portion.len() as u64;

            if size as u64 != block_size {
                // partial writes are always synchronous so a concurrent
                // reader never observes a half-merged block
                let start_off = if block == first { off } else { 0 };

                self.process_partial_block_write(id, key, start_off as usize, portion)
                    .await?;

                self.metrics.add_write_blocks(1, written_secondary);
            } else {
                node_blocks.push((key, portion));

                self.metrics.add_write_blocks(0, written_secondary);
            }
        }

        if !node_blocks.is_empty() {
            let flushed = node_blocks.len();

            self.process_batch(id, node, node_blocks).await?;

            self.metrics.add_write_blocks(flushed as u64, 0);
        }

        debug_assert!(written == len);

        Ok(None)
    }

    /// Dispatch one per-node batch, registering it with the file's write
    /// session. Batches for remote nodes travel over the transport and are
    /// acknowledged asynchronously; local batches are stored in-process.
    pub(crate) async fn process_batch(
        self: &Arc<Self>,
        file_id: Uuid,
        node: NodeId,
        blocks: Vec<(BlockKey, Bytes)>,
    ) -> Result<()> {
        let batch_id = self.batch_id_ctr.fetch_add(1, Ordering::SeqCst);

        let Some(completion) = self.pending_writes.get(&file_id) else {
            debug!(
                "missing completion future for file write request, most likely an error occurred \
                 which will be thrown upon stream close [node={node}, file_id={file_id}]"
            );

            return Ok(());
        };

        // surface an error that happened in the middle of writing
        if let Some(res) = completion.try_result() {
            res?;
        }

        completion.on_write_request(node, batch_id);

        if node != self.local_node {
            let msg = DataMessage::Blocks(BlocksMessage {
                file_id,
                batch_id,
                blocks,
            });

            let this = Arc::clone(self);

            tokio::spawn(async move {
                if let Err(e) = this.transport.send(node, msg).await {
                    completion.on_error(node, e);
                }
            });
        } else {
            let this = Arc::clone(self);

            tokio::spawn(async move {
                match this.store_blocks(blocks).await {
                    Ok(()) => completion.on_write_ack(node, batch_id),
                    Err(e) => completion.on_error(node, e),
                }
            });
        }

        Ok(())
    }

    /// Merge a partial block into whichever key variant currently holds
    /// data, locking both the colocated and the non-colocated variant so no
    /// reader of either observes inconsistent state.
    pub(crate) async fn process_partial_block_write(
        &self,
        file_id: Uuid,
        colocated_key: BlockKey,
        start_off: usize,
        data: Bytes,
    ) -> Result<()> {
        if self.cache.space_used() >= self.cache.space_max() {
            self.await_trash_purge().await;

            if self.cache.space_used() >= self.cache.space_max() {
                let Some(completion) = self.pending_writes.get(&file_id) else {
                    debug!(
                        "missing completion future for file write request [file_id={file_id}]"
                    );

                    return Ok(());
                };

                completion.fail(GridFsError::OutOfSpace(format!(
                    "failed to write data block, maximum data size exceeded [used={}, allowed={}]",
                    self.cache.space_used(),
                    self.cache.space_max()
                )));

                return Ok(());
            }
        }

        // no affinity key present, a single-key atomic update suffices
        if colocated_key.affinity_key().is_none() {
            return self
                .cache
                .invoke(&colocated_key, &BlockUpdate::new(start_off, data))
                .await;
        }

        // writing the whole prefix, a plain put suffices
        if start_off == 0 {
            return self.cache.put(colocated_key, data).await;
        }

        let plain_key = BlockKey::new(
            colocated_key.file_id(),
            None,
            colocated_key.evict_exclude(),
            colocated_key.block_idx(),
        );

        let mut tx = self
            .cache
            .tx_start(TxConcurrency::Pessimistic, TxIsolation::RepeatableRead)
            .await?;

        // lock both variants
        let vals = tx
            .get_all(&[colocated_key.clone(), plain_key.clone()])
            .await?;

        let update = BlockUpdate::new(start_off, data);

        let mut has_val = false;

        if vals.contains_key(&colocated_key) {
            tx.invoke(&colocated_key, &update).await?;

            has_val = true;
        }

        if vals.contains_key(&plain_key) {
            tx.invoke(&plain_key, &update).await?;

            has_val = true;
        }

        if !has_val {
            // the file is being deleted concurrently
            return Err(GridFsError::MissingBlockData(format!(
                "failed to write partial block, no previous data was found \
                 [key={colocated_key:?}, start_off={start_off}, data_len={}]",
                update.data().len()
            )));
        }

        tx.commit().await
    }

    /// Store a batch of blocks locally, enforcing the space quota.
    pub(crate) async fn store_blocks(&self, blocks: Vec<(BlockKey, Bytes)>) -> Result<()> {
        debug_assert!(!blocks.is_empty());

        if self.cache.space_used() >= self.cache.space_max() {
            self.await_trash_purge().await;

            if self.cache.space_used() >= self.cache.space_max() {
                return Err(GridFsError::OutOfSpace(format!(
                    "failed to write data block, maximum data size exceeded [used={}, allowed={}]",
                    self.cache.space_used(),
                    self.cache.space_max()
                )));
            }
        }

        self.cache.put_all(blocks).await
    }

    /// Bounded wait for the delete worker to free space.
    async fn await_trash_purge(&self) {
        let purged = self.delete_worker.flush();

        let _ = timeout(self.config.trash_purge_timeout, purged.wait()).await;
    }
}
