#![allow(dead_code)]

//! In-memory stand-ins for the external collaborators: a shared
//! [MemoryCache] playing the sharded data cache of the whole cluster and a
//! [Router] delivering data-plane messages between node-local managers.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use gridfs_native::cache::{
    BlockCache, BlockUpdate, CacheTx, DataMessage, NodeId, Transport, TxConcurrency, TxIsolation,
};
use gridfs_native::fs::BlockKey;
use gridfs_native::{Configuration, DataManager, GridFsError, Result};

/// Placement component of a block key: either its affinity key or the
/// implicit group the block falls into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PinTarget {
    Key(Uuid),
    Group(Uuid, u64),
}

/// Shared in-memory rendition of the cluster's data cache.
///
/// Placement is deterministic (component hash modulo node count) and can be
/// pinned per component for tests that need a specific shape. Transactions
/// hold the single store lock until commit or drop, which serializes them
/// like the pessimistic mode they emulate; rollback is not modeled.
pub struct MemoryCache {
    data: Arc<AsyncMutex<HashMap<BlockKey, Bytes>>>,
    used: Arc<AtomicU64>,
    max_space: AtomicU64,
    nodes: Vec<NodeId>,
    replicas: usize,
    grp_size: u64,
    pins: Mutex<HashMap<PinTarget, Vec<NodeId>>>,
    removed: AtomicUsize,
    remove_delay_ms: AtomicU64,
}

impl MemoryCache {
    pub fn new(nodes: Vec<NodeId>, grp_size: u64) -> Arc<Self> {
        let replicas = nodes.len().min(2).max(1);

        Arc::new(MemoryCache {
            data: Arc::new(AsyncMutex::new(HashMap::new())),
            used: Arc::new(AtomicU64::new(0)),
            max_space: AtomicU64::new(u64::MAX),
            nodes,
            replicas,
            grp_size,
            pins: Mutex::new(HashMap::new()),
            removed: AtomicUsize::new(0),
            remove_delay_ms: AtomicU64::new(0),
        })
    }

    pub fn pin_key(&self, key: Uuid, nodes: Vec<NodeId>) {
        self.pins.lock().unwrap().insert(PinTarget::Key(key), nodes);
    }

    pub fn pin_group(&self, file_id: Uuid, grp_idx: u64, nodes: Vec<NodeId>) {
        self.pins
            .lock()
            .unwrap()
            .insert(PinTarget::Group(file_id, grp_idx), nodes);
    }

    pub fn set_max_space(&self, max: u64) {
        self.max_space.store(max, Ordering::SeqCst);
    }

    pub fn set_remove_delay(&self, delay: Duration) {
        self.remove_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Total number of keys passed to remove operations so far.
    pub fn removed_count(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }

    pub async fn stored_blocks(&self) -> usize {
        self.data.lock().await.len()
    }

    pub async fn stored(&self, key: &BlockKey) -> Option<Bytes> {
        self.data.lock().await.get(key).cloned()
    }

    fn target_for(&self, key: &BlockKey) -> PinTarget {
        match key.affinity_key() {
            Some(affinity_key) => PinTarget::Key(affinity_key),
            None => PinTarget::Group(key.file_id(), key.block_idx() / self.grp_size),
        }
    }

    fn nodes_for(&self, target: &PinTarget) -> Vec<NodeId> {
        if let Some(pinned) = self.pins.lock().unwrap().get(target) {
            return pinned.clone();
        }

        let mut hasher = DefaultHasher::new();
        target.hash(&mut hasher);
        let primary = (hasher.finish() % self.nodes.len() as u64) as usize;

        (0..self.replicas)
            .map(|i| self.nodes[(primary + i) % self.nodes.len()])
            .collect()
    }

    fn store(map: &mut HashMap<BlockKey, Bytes>, used: &AtomicU64, key: BlockKey, value: Bytes) {
        let new_len = value.len() as u64;

        if let Some(old) = map.insert(key, value) {
            used.fetch_sub(old.len() as u64, Ordering::SeqCst);
        }

        used.fetch_add(new_len, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlockCache for MemoryCache {
    type Tx = MemTx;

    async fn get(&self, key: &BlockKey) -> Result<Option<Bytes>> {
        Ok(self.data.lock().await.get(key).cloned())
    }

    async fn put(&self, key: BlockKey, value: Bytes) -> Result<()> {
        let mut map = self.data.lock().await;
        Self::store(&mut map, &self.used, key, value);
        Ok(())
    }

    async fn put_all(&self, blocks: Vec<(BlockKey, Bytes)>) -> Result<()> {
        let mut map = self.data.lock().await;

        for (key, value) in blocks {
            Self::store(&mut map, &self.used, key, value);
        }

        Ok(())
    }

    async fn get_all(&self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Bytes>> {
        let map = self.data.lock().await;

        Ok(keys
            .iter()
            .filter_map(|k| map.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn invoke(&self, key: &BlockKey, update: &BlockUpdate) -> Result<()> {
        let mut map = self.data.lock().await;

        let merged = update.apply(map.get(key).map(|v| v.as_ref()));
        Self::store(&mut map, &self.used, key.clone(), merged);

        Ok(())
    }

    async fn remove_keys(&self, keys: Vec<BlockKey>) -> Result<()> {
        let delay = self.remove_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        self.removed.fetch_add(keys.len(), Ordering::SeqCst);

        let mut map = self.data.lock().await;

        for key in keys {
            if let Some(old) = map.remove(&key) {
                self.used.fetch_sub(old.len() as u64, Ordering::SeqCst);
            }
        }

        Ok(())
    }

    async fn tx_start(
        &self,
        _concurrency: TxConcurrency,
        _isolation: TxIsolation,
    ) -> Result<Self::Tx> {
        Ok(MemTx {
            guard: Arc::clone(&self.data).lock_owned().await,
            used: Arc::clone(&self.used),
        })
    }

    fn primary_node(&self, key: &BlockKey) -> NodeId {
        self.nodes_for(&self.target_for(key))[0]
    }

    fn primary_and_backups(&self, key: &BlockKey) -> Vec<NodeId> {
        self.nodes_for(&self.target_for(key))
    }

    fn primary_node_for_key(&self, affinity_key: &Uuid) -> NodeId {
        self.nodes_for(&PinTarget::Key(*affinity_key))[0]
    }

    fn primary_and_backups_for_key(&self, affinity_key: &Uuid) -> Vec<NodeId> {
        self.nodes_for(&PinTarget::Key(*affinity_key))
    }

    fn space_used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    fn space_max(&self) -> u64 {
        self.max_space.load(Ordering::SeqCst)
    }
}

pub struct MemTx {
    guard: OwnedMutexGuard<HashMap<BlockKey, Bytes>>,
    used: Arc<AtomicU64>,
}

#[async_trait]
impl CacheTx for MemTx {
    async fn get_all(&mut self, keys: &[BlockKey]) -> Result<HashMap<BlockKey, Bytes>> {
        Ok(keys
            .iter()
            .filter_map(|k| self.guard.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn put(&mut self, key: BlockKey, value: Bytes) -> Result<()> {
        MemoryCache::store(&mut self.guard, &self.used, key, value);
        Ok(())
    }

    async fn invoke(&mut self, key: &BlockKey, update: &BlockUpdate) -> Result<()> {
        let merged = update.apply(self.guard.get(key).map(|v| v.as_ref()));
        MemoryCache::store(&mut self.guard, &self.used, key.clone(), merged);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        Ok(())
    }
}

/// Loopback transport delivering messages to the target node's inbox.
/// Deafened nodes silently lose their inbound messages, like a dropped
/// connection.
pub struct Router {
    local: NodeId,
    peers: Arc<Mutex<HashMap<NodeId, mpsc::UnboundedSender<(NodeId, DataMessage)>>>>,
    deaf: Arc<Mutex<HashSet<NodeId>>>,
}

#[async_trait]
impl Transport for Router {
    async fn send(&self, node: NodeId, msg: DataMessage) -> Result<()> {
        if self.deaf.lock().unwrap().contains(&node) {
            return Ok(());
        }

        let sender = self.peers.lock().unwrap().get(&node).cloned();

        match sender {
            Some(sender) => {
                let _ = sender.send((self.local, msg));
                Ok(())
            }
            None => Err(GridFsError::TransportError(format!("unknown node {node}"))),
        }
    }
}

pub struct TestNode {
    pub id: NodeId,
    pub manager: Arc<DataManager<MemoryCache, Router>>,
}

/// A set of node-local managers sharing one cache, wired through a [Router].
pub struct TestCluster {
    pub cache: Arc<MemoryCache>,
    pub nodes: Vec<TestNode>,
    deaf: Arc<Mutex<HashSet<NodeId>>>,
}

impl TestCluster {
    pub fn start(node_count: usize, configuration: Configuration) -> Self {
        let node_ids: Vec<NodeId> = (0..node_count).map(|_| Uuid::new_v4()).collect();

        let data_config = configuration.get_data_config();
        let cache = MemoryCache::new(node_ids.clone(), data_config.group_size);

        let peers = Arc::new(Mutex::new(HashMap::new()));
        let deaf = Arc::new(Mutex::new(HashSet::new()));

        let mut nodes = Vec::new();

        for id in node_ids {
            let (sender, mut receiver) = mpsc::unbounded_channel();
            peers.lock().unwrap().insert(id, sender);

            let transport = Arc::new(Router {
                local: id,
                peers: Arc::clone(&peers),
                deaf: Arc::clone(&deaf),
            });

            let manager =
                DataManager::start(Arc::clone(&cache), transport, configuration.clone(), id);

            let pump = Arc::clone(&manager);
            tokio::spawn(async move {
                while let Some((from, msg)) = receiver.recv().await {
                    pump.on_message(from, msg);
                }
            });

            nodes.push(TestNode { id, manager });
        }

        TestCluster { cache, nodes, deaf }
    }

    pub fn manager(&self, idx: usize) -> &Arc<DataManager<MemoryCache, Router>> {
        &self.nodes[idx].manager
    }

    pub fn node_id(&self, idx: usize) -> NodeId {
        self.nodes[idx].id
    }

    /// Drop all messages addressed to `node` from now on.
    pub fn deafen(&self, node: NodeId) {
        self.deaf.lock().unwrap().insert(node);
    }
}

/// Configuration with a small block size so tests stay readable.
pub fn test_config(block_size: u64, group_size: u64) -> Configuration {
    let mut configuration = Configuration::new();
    configuration.set("fs.data.block.size", block_size);
    configuration.set("fs.data.group.size", group_size);
    configuration.set("fs.data.trash.purge.timeout.ms", 50u64);
    configuration
}

/// Deterministic test payload.
pub fn make_data(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
