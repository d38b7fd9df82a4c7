//! The `Pfs` API, one file per resource
//!
//! Every operation validates its input, runs its metadata changes in one
//! transaction and only then touches fileset storage.

pub mod branch;
pub mod commit;
pub mod file;
pub mod fsck;
pub mod job;
pub mod repo;
