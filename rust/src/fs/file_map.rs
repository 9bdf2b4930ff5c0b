use uuid::Uuid;

/// Identity of one stored block.
///
/// For a fixed `(file_id, affinity_key, evict_exclude)` the block index maps
/// 1:1 to a contiguous byte range of the file. The same logical block can
/// transiently exist under both the colocated and non-colocated variant
/// while a range is being migrated; at most one of them is live.
///
/// Keys order by file and block first so that sorted batch operations against
/// the cache touch one file's blocks sequentially.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    file_id: Uuid,
    block_idx: u64,
    affinity_key: Option<Uuid>,
    evict_exclude: bool,
}

impl BlockKey {
    pub fn new(file_id: Uuid, affinity_key: Option<Uuid>, evict_exclude: bool, block_idx: u64) -> Self {
        BlockKey {
            file_id,
            block_idx,
            affinity_key,
            evict_exclude,
        }
    }

    pub fn file_id(&self) -> Uuid {
        self.file_id
    }

    pub fn affinity_key(&self) -> Option<Uuid> {
        self.affinity_key
    }

    pub fn evict_exclude(&self) -> bool {
        self.evict_exclude
    }

    pub fn block_idx(&self) -> u64 {
        self.block_idx
    }
}

/// Lifecycle of an affinity range with respect to the fragmentizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeStatus {
    /// Blocks are written under the colocated key variant.
    Initial,
    /// Blocks are being copied to non-colocated keys.
    Moving,
    /// Blocks now live under non-colocated keys only.
    Moved,
}

/// A contiguous byte range of a file colocated under one affinity key.
///
/// Offsets are inclusive on both ends. Ranges only ever grow forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityRange {
    start_off: u64,
    end_off: u64,
    affinity_key: Uuid,
    status: RangeStatus,
}

impl AffinityRange {
    pub fn new(start_off: u64, end_off: u64, affinity_key: Uuid) -> Self {
        assert!(start_off <= end_off);
        AffinityRange {
            start_off,
            end_off,
            affinity_key,
            status: RangeStatus::Initial,
        }
    }

    pub fn start_offset(&self) -> u64 {
        self.start_off
    }

    pub fn end_offset(&self) -> u64 {
        self.end_off
    }

    pub fn affinity_key(&self) -> Uuid {
        self.affinity_key
    }

    pub fn status(&self) -> RangeStatus {
        self.status
    }

    pub fn set_status(&mut self, status: RangeStatus) {
        self.status = status;
    }

    /// Whether `off` falls before the start of this range.
    pub fn less(&self, off: u64) -> bool {
        off < self.start_off
    }

    /// Whether `off` falls within this range.
    pub fn belongs(&self, off: u64) -> bool {
        off >= self.start_off && off <= self.end_off
    }

    /// Grow the range forward to cover the block starting at `block_start`.
    pub fn expand(&mut self, block_start: u64, block_size: u64) {
        if block_start > self.end_off {
            self.end_off = block_start + block_size - 1;
        }
    }
}

/// Ordered list of disjoint affinity ranges of one file.
///
/// Ranges are strictly ascending and append-only: once created a range never
/// shrinks and never changes its key, so results derived from already-covered
/// offsets cannot go stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMap {
    ranges: Vec<AffinityRange>,
}

impl FileMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self) -> &[AffinityRange] {
        &self.ranges
    }

    /// Affinity key assigned to the byte at `off`, if any.
    ///
    /// Ranges whose blocks were already moved to non-colocated keys are
    /// skipped unless `include_moved` is set; deletion must see them, new
    /// writes must not.
    pub fn affinity_key(&self, off: u64, include_moved: bool) -> Option<Uuid> {
        self.ranges
            .iter()
            .find(|r| r.belongs(off))
            .filter(|r| include_moved || r.status != RangeStatus::Moved)
            .map(|r| r.affinity_key)
    }

    /// Append a range past the current tail.
    pub fn add_range(&mut self, range: AffinityRange) {
        if let Some(last) = self.ranges.last() {
            assert!(
                range.start_off > last.end_off,
                "ranges must be disjoint and ascending [last={last:?}, new={range:?}]"
            );
        }
        self.ranges.push(range);
    }
}

/// Read-only descriptor of a file, supplied by the namespace service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    id: Uuid,
    block_size: u32,
    len: u64,
    affinity_key: Option<Uuid>,
    evict_exclude: bool,
    file_map: FileMap,
}

impl FileInfo {
    pub fn new(id: Uuid, block_size: u32, len: u64) -> Self {
        FileInfo {
            id,
            block_size,
            len,
            affinity_key: None,
            evict_exclude: false,
            file_map: FileMap::new(),
        }
    }

    pub fn with_affinity_key(mut self, affinity_key: Uuid) -> Self {
        self.affinity_key = Some(affinity_key);
        self
    }

    pub fn with_evict_exclude(mut self, evict_exclude: bool) -> Self {
        self.evict_exclude = evict_exclude;
        self
    }

    pub fn with_file_map(mut self, file_map: FileMap) -> Self {
        self.file_map = file_map;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn length(&self) -> u64 {
        self.len
    }

    pub fn affinity_key(&self) -> Option<Uuid> {
        self.affinity_key
    }

    pub fn evict_exclude(&self) -> bool {
        self.evict_exclude
    }

    pub fn file_map(&self) -> &FileMap {
        &self.file_map
    }

    /// Entries with no block size carry no data.
    pub fn is_file(&self) -> bool {
        self.block_size > 0
    }

    pub fn blocks_count(&self) -> u64 {
        if !self.is_file() {
            return 0;
        }
        self.len.div_ceil(self.block_size as u64)
    }
}
