use log::debug;

use crate::cache::{BlockCache, NodeId, Transport};
use crate::error::GridFsError;
use crate::fs::file_map::{BlockKey, FileInfo};
use crate::fs::DataManager;
use crate::Result;

/// One reported location: a byte span of the file and the primary-first
/// sequence of nodes holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLocation {
    start: u64,
    len: u64,
    nodes: Vec<NodeId>,
}

impl BlockLocation {
    pub fn new(start: u64, len: u64, nodes: Vec<NodeId>) -> Self {
        BlockLocation { start, len, nodes }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }
}

impl<C: BlockCache, T: Transport> DataManager<C, T> {
    /// Resolve which nodes hold the bytes `[start, start + len)` of a file.
    ///
    /// Adjacent spans owned by the same node sequence are merged, then every
    /// span longer than `max_len` is re-split; `max_len == 0` leaves spans
    /// unbounded.
    pub fn affinity(
        &self,
        info: &FileInfo,
        start: u64,
        len: u64,
        max_len: u64,
    ) -> Result<Vec<BlockLocation>> {
        debug!(
            "calculating affinity for file [file_id={}, start={start}, len={len}]",
            info.id()
        );

        if len == 0 {
            return Ok(Vec::new());
        }

        let block_size = info.block_size() as u64;

        // chunks are whole blocks, at least one
        let max_len = if max_len > 0 {
            (max_len - max_len % block_size).max(block_size)
        } else {
            0
        };

        let mut res: Vec<BlockLocation> = Vec::new();

        // with a whole-file affinity key the entire file resides on one node
        if let Some(affinity_key) = info.affinity_key() {
            let key = BlockKey::new(info.id(), Some(affinity_key), info.evict_exclude(), 0);

            split_blocks(start, len, max_len, self.cache.primary_and_backups(&key), &mut res);

            return Ok(res);
        }

        if info.file_map().ranges().is_empty() {
            self.grouped_affinity(info, start, len, max_len, &mut res)?;

            return Ok(res);
        }

        let mut pos = start;
        let end = start + len;

        for range in info.file_map().ranges() {
            debug!("checking range [range={range:?}, pos={pos}]");

            // fill the gap before the range from grouped placement
            if range.less(pos) {
                let part_end = end.min(range.start_offset());

                self.grouped_affinity(info, pos, part_end - pos, max_len, &mut res)?;

                pos = part_end;
            }

            if range.belongs(pos) {
                let part_end = (range.end_offset() + 1).min(end);

                let nodes = self.cache.primary_and_backups_for_key(&range.affinity_key());

                debug!(
                    "calculated affinity for range [start={pos}, end={part_end}, range={range:?}]"
                );

                match res.last() {
                    // merge only on identical node sequences, order matters
                    // for primary/backup precedence
                    Some(last) if last.nodes() == nodes.as_slice() => {
                        let last = res.pop().unwrap();

                        split_blocks(
                            last.start(),
                            last.len() + (part_end - pos),
                            max_len,
                            nodes,
                            &mut res,
                        );
                    }
                    _ => split_blocks(pos, part_end - pos, max_len, nodes, &mut res),
                }

                pos = part_end;
            }

            if pos == end {
                break;
            }
        }

        // final chunk past the last range
        if pos != end {
            self.grouped_affinity(info, pos, end - pos, max_len, &mut res)?;
        }

        Ok(res)
    }

    /// Implicit grouped placement for spans not covered by explicit ranges:
    /// consecutive blocks form fixed-size groups and every block of a group
    /// maps to the node owning the group's first block.
    fn grouped_affinity(
        &self,
        info: &FileInfo,
        start: u64,
        len: u64,
        max_len: u64,
        res: &mut Vec<BlockLocation>,
    ) -> Result<()> {
        let grp_block_size = self.grp_block_size;

        let first_grp_idx = start / grp_block_size;
        let limit_grp_idx = (start + len).div_ceil(grp_block_size);

        if limit_grp_idx - first_grp_idx > i32::MAX as u64 {
            return Err(GridFsError::RangeTooWide(format!(
                "failed to get affinity, range is too wide [file_id={}, start={start}, len={len}]",
                info.id()
            )));
        }

        debug!(
            "mapping file region [file_id={}, start={start}, len={len}]",
            info.id()
        );

        for grp_idx in first_grp_idx..limit_grp_idx {
            let (block_start, block_len) = if grp_idx == first_grp_idx {
                let block_start = start % grp_block_size;
                (block_start, (grp_block_size - block_start).min(len))
            } else if grp_idx == limit_grp_idx - 1 {
                (0, (start + len - 1) % grp_block_size + 1)
            } else {
                (0, grp_block_size)
            };

            // placement of the first block in the group
            let key = BlockKey::new(
                info.id(),
                info.affinity_key(),
                info.evict_exclude(),
                grp_idx * self.grp_size,
            );

            let nodes = self.cache.primary_and_backups(&key);

            debug!(
                "mapped key to nodes [key={key:?}, nodes={nodes:?}, block_start={block_start}, block_len={block_len}]"
            );

            match res.last() {
                Some(last) if last.nodes() == nodes.as_slice() => {
                    let last = res.pop().unwrap();

                    split_blocks(last.start(), last.len() + block_len, max_len, nodes, res);
                }
                _ => split_blocks(
                    grp_idx * grp_block_size + block_start,
                    block_len,
                    max_len,
                    nodes,
                    res,
                ),
            }
        }

        Ok(())
    }
}

/// Split a span into chunks no longer than `max_len`, all owned by the same
/// node sequence. A `max_len` of 0 keeps the span whole.
fn split_blocks(start: u64, len: u64, max_len: u64, nodes: Vec<NodeId>, res: &mut Vec<BlockLocation>) {
    if max_len > 0 {
        let end = start + len;
        let mut pos = start;

        while pos < end {
            let chunk = max_len.min(end - pos);

            res.push(BlockLocation::new(pos, chunk, nodes.clone()));

            pos += chunk;
        }
    } else {
        res.push(BlockLocation::new(start, len, nodes));
    }
}
