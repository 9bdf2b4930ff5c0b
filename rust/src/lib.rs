// #![warn(missing_docs)]
//! Block data layer for a cache-backed distributed file store
//!
//! Files are split into fixed-size blocks stored in a sharded key-value
//! cache. This crate maps byte ranges onto cache keys so related bytes land
//! on the same shard, fans write batches out to the owning nodes while
//! tracking per-node acknowledgments, enforces a pending-puts budget with
//! backpressure, and deletes removed files in the background.
//!
//! The cache itself, the wire transport and the file namespace are external
//! collaborators consumed through the traits in [`cache`].
//!
//! # Usage
//!
//! ```ignore
//! use gridfs_native::{Configuration, DataManager};
//!
//! let manager = DataManager::start(cache, transport, Configuration::new(), local_node);
//! let completion = manager.write_start(&file);
//! ```
pub mod cache;
pub(crate) mod common;
pub(crate) mod error;
pub mod fs;

pub use common::config::Configuration;
pub use common::config::DataConfig;
pub use error::GridFsError;
pub use error::Result;
pub use fs::DataManager;
