//! Stateful components
//!
//! - `chunk_store`: content-addressed chunk storage
//! - `faults`: fault injection for the chunk stores
//! - `metadata`: optimistic transactional store for repos, branches, commits
//! - `storage`: per-commit fileset layers, compaction and garbage collection
//! - `pfs`: the file system handle tying them together

pub mod chunk_store;
pub mod faults;
pub mod metadata;
pub mod pfs;
pub mod storage;
