//! Data types and algorithms
//!
//! - `branch`: repo and branch names, commit revision syntax
//! - `fileset`: file trees as stacked layers, globbing, diffing
//! - `index`: range-addressable index codec
//! - `metadata`: repo, branch and commit records
//! - `objects`: job and chunk identifiers
//! - `provenance`: provenance closure, propagation, squash and fsck

pub mod branch;
pub mod fileset;
pub mod index;
pub mod metadata;
pub mod objects;
pub mod provenance;
