use std::collections::HashMap;
use std::time::Duration;

/// Default block size in bytes.
pub const DEFAULT_BLOCK_SIZE: u64 = 65536;
/// Default number of blocks making up one implicit affinity group.
pub const DEFAULT_GROUP_SIZE: u64 = 512;
/// Default number of blocks accumulated per node before a batch is flushed.
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Default limit for bytes queued in deferred puts, 0 disables the gate.
pub const DEFAULT_MAX_PENDING_PUTS: u64 = 0;
/// Default time to wait for the delete worker to free space.
pub const DEFAULT_TRASH_PURGE_TIMEOUT_MS: u64 = 1000;
/// Default number of bytes moved by the fragmentizer before throttling.
pub const DEFAULT_FRAGMENTIZER_THROTTLING_BLOCK_LENGTH: u64 = 16 * 1024 * 1024;
/// Default fragmentizer throttling delay.
pub const DEFAULT_FRAGMENTIZER_THROTTLING_DELAY_MS: u64 = 200;

const BLOCK_SIZE_KEY: &str = "fs.data.block.size";
const GROUP_SIZE_KEY: &str = "fs.data.group.size";
const BATCH_SIZE_KEY: &str = "fs.data.batch.size";
const MAX_PENDING_PUTS_KEY: &str = "fs.data.pending.puts.max";
const TRASH_PURGE_TIMEOUT_KEY: &str = "fs.data.trash.purge.timeout.ms";
const FRAGMENTIZER_THROTTLING_BLOCK_LENGTH_KEY: &str =
    "fs.data.fragmentizer.throttling.block.length";
const FRAGMENTIZER_THROTTLING_DELAY_KEY: &str = "fs.data.fragmentizer.throttling.delay.ms";

#[derive(Debug, Clone, Default)]
pub struct Configuration {
    map: HashMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_config(conf_map: HashMap<String, String>) -> Self {
        Configuration { map: conf_map }
    }

    /// Get a value from the config, returning None if the key wasn't defined.
    pub fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).cloned()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) {
        self.map.insert(key.to_string(), value.to_string());
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Snapshot of the typed data-layer settings.
    pub fn get_data_config(&self) -> DataConfig {
        DataConfig {
            block_size: self.get_u64(BLOCK_SIZE_KEY, DEFAULT_BLOCK_SIZE),
            group_size: self.get_u64(GROUP_SIZE_KEY, DEFAULT_GROUP_SIZE).max(1),
            batch_size: self.get_usize(BATCH_SIZE_KEY, DEFAULT_BATCH_SIZE).max(1),
            max_pending_puts: self.get_u64(MAX_PENDING_PUTS_KEY, DEFAULT_MAX_PENDING_PUTS),
            trash_purge_timeout: Duration::from_millis(
                self.get_u64(TRASH_PURGE_TIMEOUT_KEY, DEFAULT_TRASH_PURGE_TIMEOUT_MS),
            ),
            fragmentizer_throttling_block_length: self.get_u64(
                FRAGMENTIZER_THROTTLING_BLOCK_LENGTH_KEY,
                DEFAULT_FRAGMENTIZER_THROTTLING_BLOCK_LENGTH,
            ),
            fragmentizer_throttling_delay: Duration::from_millis(self.get_u64(
                FRAGMENTIZER_THROTTLING_DELAY_KEY,
                DEFAULT_FRAGMENTIZER_THROTTLING_DELAY_MS,
            )),
        }
    }
}

/// Typed settings consumed by the data manager.
#[derive(Debug, Clone)]
pub struct DataConfig {
    /// Block size used for implicit affinity grouping.
    pub block_size: u64,
    /// Number of consecutive blocks sharing one implicit affinity key.
    pub group_size: u64,
    /// Blocks accumulated per destination before a batch is dispatched.
    pub batch_size: usize,
    /// Upper bound on bytes queued in deferred puts, 0 disables the gate.
    pub max_pending_puts: u64,
    /// How long to wait for the delete worker when the space quota is hit.
    pub trash_purge_timeout: Duration,
    /// Bytes the fragmentizer moves before pausing.
    pub fragmentizer_throttling_block_length: u64,
    /// How long the fragmentizer pauses between bursts.
    pub fragmentizer_throttling_delay: Duration,
}
