//! A versioned, content-addressed file system
//!
//! Repos hold branches, branches hold commits, and commits hold file trees
//! stored as layered filesets in a chunk store. Branches may depend on
//! other branches; a commit upstream opens commits on every dependent
//! branch, all sharing one job ID.
//!
//! ```no_run
//! # fn main() -> anyhow::Result<()> {
//! use pfs::{BranchKey, CommitRef, Config, Pfs, PutFileOptions};
//!
//! let pfs = Pfs::in_memory(Config::default())?;
//! pfs.create_repo("images", "", false)?;
//!
//! let master = BranchKey::parse("images", "master")?;
//! pfs.put_file(&CommitRef::head(&master), "/cat.png", &b"meow"[..], PutFileOptions::default())?;
//! assert_eq!(&pfs.get_file(&CommitRef::head(&master), "/cat.png")?[..], b"meow");
//! # Ok(())
//! # }
//! ```

pub mod areas;
pub mod artifacts;
pub mod commands;
pub mod config;
pub mod errors;

pub use areas::chunk_store::{ChunkStore, LocalChunkStore, MemoryChunkStore};
pub use areas::faults::{FaultInjector, MonkeyFaults, NoFaults, ScriptedFaults};
pub use areas::pfs::Pfs;
pub use artifacts::fileset::diff::FileDiff;
pub use artifacts::fileset::tree::{FileInfo, FileType};
pub use artifacts::metadata::JobInfo;
pub use artifacts::metadata::branch_info::{BranchInfo, BranchOptions};
pub use artifacts::metadata::commit_info::{CommitInfo, CommitOrigin, CommitState};
pub use artifacts::metadata::keys::{BranchKey, CommitKey, CommitRef};
pub use artifacts::metadata::repo_info::RepoInfo;
pub use artifacts::metadata::trigger::Trigger;
pub use artifacts::provenance::fsck::Finding;
pub use commands::commit::CommitSubscription;
pub use commands::file::{FileBatch, FileOp, PutFileOptions};
pub use config::Config;
pub use errors::{Error, ErrorKind, Result};
