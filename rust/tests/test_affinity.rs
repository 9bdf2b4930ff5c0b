mod common;

use uuid::Uuid;

use gridfs_native::fs::{AffinityRange, FileInfo, FileMap};
use gridfs_native::{GridFsError, Result};

use common::{init_logging, test_config, TestCluster};

#[tokio::test]
async fn test_empty_span_resolves_to_nothing() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(1, test_config(1024, 2));
    let manager = cluster.manager(0);

    let file = FileInfo::new(Uuid::new_v4(), 1024, 4096);

    assert!(manager.affinity(&file, 0, 0, 0)?.is_empty());

    Ok(())
}

#[tokio::test]
async fn test_whole_file_affinity_maps_to_one_node_set() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let node_a = cluster.node_id(0);
    let node_b = cluster.node_id(1);

    let affinity_key = Uuid::new_v4();
    cluster.cache.pin_key(affinity_key, vec![node_a, node_b]);

    let file = FileInfo::new(Uuid::new_v4(), 1024, 5000).with_affinity_key(affinity_key);

    let locations = manager.affinity(&file, 0, 5000, 0)?;

    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].start(), 0);
    assert_eq!(locations[0].len(), 5000);
    assert_eq!(locations[0].nodes(), &[node_a, node_b]);

    // a max length is rounded down to a block multiple
    let locations = manager.affinity(&file, 0, 5000, 2500)?;

    let spans: Vec<_> = locations.iter().map(|l| (l.start(), l.len())).collect();
    assert_eq!(spans, vec![(0, 2048), (2048, 2048), (4096, 904)]);

    // and never below one block
    let locations = manager.affinity(&file, 0, 5000, 500)?;
    assert!(locations.iter().all(|l| l.len() <= 1024));

    Ok(())
}

#[tokio::test]
async fn test_adjacent_groups_on_same_nodes_merge() -> Result<()> {
    init_logging();

    // group covers 2048 bytes
    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let node_a = cluster.node_id(0);
    let node_b = cluster.node_id(1);

    let file = FileInfo::new(Uuid::new_v4(), 1024, 8192);

    cluster.cache.pin_group(file.id(), 0, vec![node_a]);
    cluster.cache.pin_group(file.id(), 1, vec![node_a]);
    cluster.cache.pin_group(file.id(), 2, vec![node_b]);
    cluster.cache.pin_group(file.id(), 3, vec![node_b]);

    let locations = manager.affinity(&file, 0, 8192, 0)?;

    assert_eq!(locations.len(), 2);
    assert_eq!((locations[0].start(), locations[0].len()), (0, 4096));
    assert_eq!(locations[0].nodes(), &[node_a]);
    assert_eq!((locations[1].start(), locations[1].len()), (4096, 4096));
    assert_eq!(locations[1].nodes(), &[node_b]);

    Ok(())
}

#[tokio::test]
async fn test_unaligned_span_keeps_boundaries() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let node_a = cluster.node_id(0);

    let file = FileInfo::new(Uuid::new_v4(), 1024, 8192);

    for grp in 0..4 {
        cluster.cache.pin_group(file.id(), grp, vec![node_a]);
    }

    // crosses a group boundary mid-block, still one merged location
    let locations = manager.affinity(&file, 1000, 2000, 0)?;

    assert_eq!(locations.len(), 1);
    assert_eq!((locations[0].start(), locations[0].len()), (1000, 2000));

    Ok(())
}

#[tokio::test]
async fn test_range_merges_with_grouped_neighbor_on_equal_sequence() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let node_a = cluster.node_id(0);
    let node_b = cluster.node_id(1);

    let affinity_key = Uuid::new_v4();

    let mut file_map = FileMap::new();
    file_map.add_range(AffinityRange::new(2048, 6143, affinity_key));

    let file = FileInfo::new(Uuid::new_v4(), 1024, 8192).with_file_map(file_map);

    cluster.cache.pin_group(file.id(), 0, vec![node_a, node_b]);
    cluster.cache.pin_key(affinity_key, vec![node_a, node_b]);
    cluster.cache.pin_group(file.id(), 3, vec![node_b, node_a]);

    let locations = manager.affinity(&file, 0, 8192, 0)?;

    // the gap before the range and the range itself share one node
    // sequence and collapse into one location
    assert_eq!(locations.len(), 2);
    assert_eq!((locations[0].start(), locations[0].len()), (0, 6144));
    assert_eq!(locations[0].nodes(), &[node_a, node_b]);
    assert_eq!((locations[1].start(), locations[1].len()), (6144, 2048));
    assert_eq!(locations[1].nodes(), &[node_b, node_a]);

    Ok(())
}

#[tokio::test]
async fn test_same_nodes_in_different_order_do_not_merge() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let node_a = cluster.node_id(0);
    let node_b = cluster.node_id(1);

    let affinity_key = Uuid::new_v4();

    let mut file_map = FileMap::new();
    file_map.add_range(AffinityRange::new(2048, 6143, affinity_key));

    let file = FileInfo::new(Uuid::new_v4(), 1024, 8192).with_file_map(file_map);

    cluster.cache.pin_group(file.id(), 0, vec![node_a, node_b]);
    // same node set, reversed precedence: must not merge
    cluster.cache.pin_key(affinity_key, vec![node_b, node_a]);
    cluster.cache.pin_group(file.id(), 3, vec![node_a, node_b]);

    let locations = manager.affinity(&file, 0, 8192, 0)?;

    assert_eq!(locations.len(), 3);
    assert_eq!((locations[0].start(), locations[0].len()), (0, 2048));
    assert_eq!(locations[0].nodes(), &[node_a, node_b]);
    assert_eq!((locations[1].start(), locations[1].len()), (2048, 4096));
    assert_eq!(locations[1].nodes(), &[node_b, node_a]);
    assert_eq!((locations[2].start(), locations[2].len()), (6144, 2048));

    Ok(())
}

#[tokio::test]
async fn test_resolution_is_idempotent() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let affinity_key = Uuid::new_v4();

    let mut file_map = FileMap::new();
    file_map.add_range(AffinityRange::new(2048, 4095, affinity_key));

    let file = FileInfo::new(Uuid::new_v4(), 1024, 10240).with_file_map(file_map);

    let first = manager.affinity(&file, 0, 10240, 0)?;
    let second = manager.affinity(&file, 0, 10240, 0)?;

    assert_eq!(first, second);

    Ok(())
}

#[tokio::test]
async fn test_max_len_bounds_every_chunk() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(2, test_config(1024, 2));
    let manager = cluster.manager(0);

    let file = FileInfo::new(Uuid::new_v4(), 1024, 16384);

    let max_len = 3000u64;
    let locations = manager.affinity(&file, 0, 16384, max_len)?;

    // rounded down to a block multiple
    assert!(locations.iter().all(|l| l.len() <= 2048));

    // chunks are contiguous and cover the requested span exactly
    let mut pos = 0;
    for location in &locations {
        assert_eq!(location.start(), pos);
        pos += location.len();
    }
    assert_eq!(pos, 16384);

    Ok(())
}

#[tokio::test]
async fn test_too_wide_span_is_rejected() {
    init_logging();

    let cluster = TestCluster::start(1, test_config(1, 1));
    let manager = cluster.manager(0);

    let file = FileInfo::new(Uuid::new_v4(), 1, 16);

    let res = manager.affinity(&file, 0, i32::MAX as u64 + 2, 0);

    assert!(matches!(res, Err(GridFsError::RangeTooWide(_))));
}

#[tokio::test]
async fn test_block_key_reuses_assigned_range_keys() -> Result<()> {
    init_logging();

    let cluster = TestCluster::start(1, test_config(1024, 512));
    let manager = cluster.manager(0);

    let affinity_key = Uuid::new_v4();

    let mut file_map = FileMap::new();
    file_map.add_range(AffinityRange::new(1024, 3071, affinity_key));

    let file = FileInfo::new(Uuid::new_v4(), 1024, 4096).with_file_map(file_map);

    // deterministic: the same index always yields the same key
    assert_eq!(manager.block_key(1, &file), manager.block_key(1, &file));

    assert_eq!(manager.block_key(0, &file).affinity_key(), None);
    assert_eq!(manager.block_key(1, &file).affinity_key(), Some(affinity_key));
    assert_eq!(manager.block_key(2, &file).affinity_key(), Some(affinity_key));
    assert_eq!(manager.block_key(3, &file).affinity_key(), None);

    // a whole-file key overrides the map
    let pinned = FileInfo::new(Uuid::new_v4(), 1024, 4096).with_affinity_key(affinity_key);
    assert_eq!(
        manager.block_key(3, &pinned).affinity_key(),
        Some(affinity_key)
    );

    Ok(())
}
