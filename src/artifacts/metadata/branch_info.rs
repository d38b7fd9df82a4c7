use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::metadata::trigger::Trigger;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// A branch row.
///
/// `provenance` and `subvenance` are derived from `direct_provenance` edges
/// and are rewritten inside the same transaction as any edge change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub branch: BranchKey,
    pub head: Option<CommitKey>,
    pub direct_provenance: BTreeSet<BranchKey>,
    pub provenance: BTreeSet<BranchKey>,
    pub subvenance: BTreeSet<BranchKey>,
    pub auto_finish: bool,
    pub trigger: Option<Trigger>,
    pub created: DateTime<Utc>,
}

impl BranchInfo {
    pub fn new(branch: BranchKey) -> Self {
        BranchInfo {
            branch,
            head: None,
            direct_provenance: BTreeSet::new(),
            provenance: BTreeSet::new(),
            subvenance: BTreeSet::new(),
            auto_finish: false,
            trigger: None,
            created: Utc::now(),
        }
    }
}

/// Options accepted by `create_branch`.
///
/// On an update the options replace the branch's settings: leaving
/// `auto_finish` unset or `trigger` empty clears them.
#[derive(Debug, Clone, Default)]
pub struct BranchOptions {
    /// Finish propagated commits as soon as they become ready
    pub auto_finish: bool,
    /// Overwrite an existing branch instead of failing
    pub update: bool,
    /// Move the branch along another branch of its repo
    pub trigger: Option<Trigger>,
}

impl BranchOptions {
    pub fn update() -> Self {
        BranchOptions {
            update: true,
            ..BranchOptions::default()
        }
    }
}
