//! Commit records
//!
//! A commit moves through `STARTED → READY → FINISHED`:
//!
//! - **STARTED**: writes accepted, some transitive provenance is unfinished
//!   (or the commit has no provenance at all)
//! - **READY**: every transitive provenance commit is finished
//! - **FINISHED**: sealed; `size_bytes` is final
//!
//! States never move backwards. A finished commit only disappears through a
//! squash.

use crate::artifacts::fileset::FileSet;
use crate::artifacts::metadata::keys::CommitKey;
use crate::errors::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommitState {
    Started,
    Ready,
    Finished,
}

const COMMIT_STATES: phf::Map<&'static str, CommitState> = phf::phf_map! {
    "STARTED" => CommitState::Started,
    "READY" => CommitState::Ready,
    "FINISHED" => CommitState::Finished,
};

impl CommitState {
    pub fn try_parse(state: &str) -> Result<Self> {
        COMMIT_STATES
            .get(state.to_ascii_uppercase().as_str())
            .copied()
            .ok_or_else(|| Error::invalid_argument(format!("unknown commit state {state:?}")))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CommitState::Started => "STARTED",
            CommitState::Ready => "READY",
            CommitState::Finished => "FINISHED",
        }
    }
}

impl std::fmt::Display for CommitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a commit came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommitOrigin {
    /// Opened by `start_commit` or an auto-commit write
    User,
    /// Opened by provenance propagation
    Auto,
    /// Created by pointing a branch at a commit of another branch
    Alias,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub commit: CommitKey,
    pub origin: CommitOrigin,
    pub parent: Option<CommitKey>,
    pub children: BTreeSet<CommitKey>,
    pub direct_provenance: BTreeSet<CommitKey>,
    pub direct_subvenance: BTreeSet<CommitKey>,
    pub state: CommitState,
    pub description: String,
    pub size_bytes: u64,
    /// Complete file tree, set once the commit is finished
    pub fileset: Option<FileSet>,
    pub started: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
}

impl CommitInfo {
    pub fn new(commit: CommitKey, origin: CommitOrigin, parent: Option<CommitKey>) -> Self {
        CommitInfo {
            commit,
            origin,
            parent,
            children: BTreeSet::new(),
            direct_provenance: BTreeSet::new(),
            direct_subvenance: BTreeSet::new(),
            state: CommitState::Started,
            description: String::new(),
            size_bytes: 0,
            fileset: None,
            started: Utc::now(),
            finished: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state == CommitState::Finished
    }

    /// Whether the commit has reached at least `state`.
    pub fn reached(&self, state: CommitState) -> bool {
        self.state >= state
    }
}
