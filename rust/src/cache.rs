//! Interfaces of the external collaborators: the sharded key-value cache
//! holding block data, the wire transport between nodes, and the optional
//! secondary system blocks can be mirrored to or filled from.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::error::GridFsError;
use crate::fs::file_map::BlockKey;
use crate::Result;

pub type NodeId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxConcurrency {
    Optimistic,
    Pessimistic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxIsolation {
    ReadCommitted,
    RepeatableRead,
}

/// In-place update of a stored block: copy `data` at `start`, growing the
/// stored value if it is shorter than `start + data.len()`.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    start: usize,
    data: Bytes,
}

impl BlockUpdate {
    pub fn new(start: usize, data: Bytes) -> Self {
        BlockUpdate { start, data }
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Merge this update into the current stored value.
    pub fn apply(&self, existing: Option<&[u8]>) -> Bytes {
        let required = self.start + self.data.len();

        let mut merged = BytesMut::from(existing.unwrap_or_default());
        if merged.len() < required {
            // don't allocate more than required
            merged.resize(required, 0);
        }

        merged[self.start..required].copy_from_slice(&self.data);

        merged.freeze()
    }
}

/// One transaction against the data cache. Dropping a transaction without
/// committing rolls it back.
#[async_trait]
pub trait CacheTx: Send {
    /// Read and lock the given keys.
    async fn get_all(&mut self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Bytes>>;

    async fn put(&mut self, key: BlockKey, value: Bytes) -> Result<()>;

    async fn invoke(&mut self, key: &BlockKey, update: &BlockUpdate) -> Result<()>;

    async fn commit(self) -> Result<()>;
}

/// The sharded key-value cache block data lives in.
///
/// Affinity methods answer placement questions: which node owns a key, and
/// in which primary-first order replicas are kept.
#[async_trait]
pub trait BlockCache: Send + Sync + 'static {
    type Tx: CacheTx;

    async fn get(&self, key: &BlockKey) -> Result<Option<Bytes>>;

    async fn put(&self, key: BlockKey, value: Bytes) -> Result<()>;

    async fn put_all(&self, blocks: Vec<(BlockKey, Bytes)>) -> Result<()>;

    async fn get_all(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Bytes>>;

    /// Atomically apply `update` to the value stored under `key`.
    async fn invoke(&self, key: &BlockKey, update: &BlockUpdate) -> Result<()>;

    /// Remove a batch of keys. Removal is streamed, missing keys are ignored.
    async fn remove_keys(&self, keys: Vec<BlockKey>) -> Result<()>;

    async fn tx_start(&self, concurrency: TxConcurrency, isolation: TxIsolation)
        -> Result<Self::Tx>;

    fn primary_node(&self, key: &BlockKey) -> NodeId;

    fn primary_and_backups(&self, key: &BlockKey) -> Vec<NodeId>;

    fn primary_node_for_key(&self, affinity_key: &Uuid) -> NodeId;

    fn primary_and_backups_for_key(&self, affinity_key: &Uuid) -> Vec<NodeId>;

    /// Bytes currently used for block data.
    fn space_used(&self) -> u64;

    /// Maximum bytes allowed for block data.
    fn space_max(&self) -> u64;
}

/// Blocks of one write batch destined for a single node, acknowledged as a
/// unit.
#[derive(Debug, Clone)]
pub struct BlocksMessage {
    pub file_id: Uuid,
    pub batch_id: u64,
    pub blocks: Vec<(BlockKey, Bytes)>,
}

/// Acknowledgment of one batch, carrying the storage error if any.
#[derive(Debug, Clone)]
pub struct AckMessage {
    pub file_id: Uuid,
    pub batch_id: u64,
    pub error: Option<GridFsError>,
}

#[derive(Debug, Clone)]
pub enum DataMessage {
    Blocks(BlocksMessage),
    Ack(AckMessage),
}

/// Point-to-point messaging between nodes of the file store.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, node: NodeId, msg: DataMessage) -> Result<()>;
}

/// Positioned reads against a secondary data source used to fill missing
/// blocks. Implementations must tolerate concurrent callers.
pub trait PositionedRead: Send + Sync {
    /// Read bytes at `pos` into `buf`, returning how many bytes were read,
    /// or 0 once the source is exhausted.
    fn read(&self, pos: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write sink mirroring stored blocks into a secondary system.
pub trait WorkerBatch: Send + Sync {
    /// Queue bytes for the secondary system; false once the batch was closed.
    fn write(&self, data: &[u8]) -> bool;
}
