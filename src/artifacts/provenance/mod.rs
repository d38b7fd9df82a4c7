//! The provenance engine
//!
//! Everything here runs inside a metadata transaction:
//!
//! - `graph`: closure, cycle checks and topological order over branches
//! - `propagate`: opening or extending downstream commits when upstream
//!   heads move
//! - `squash`: removing commits while keeping the graph linked
//! - `fsck`: rebuilding derived fields from direct edges
//!
//! The helpers in this module keep commit readiness and the derived branch
//! fields consistent after an edge changes.

pub mod fsck;
pub mod graph;
pub mod propagate;
pub mod squash;

use crate::areas::metadata::Txn;
use crate::artifacts::metadata::commit_info::{CommitInfo, CommitState};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::errors::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Whether every commit reachable through direct provenance is finished.
///
/// A commit with no provenance is trivially ready.
pub fn is_transitively_ready(txn: &mut Txn, commit: &CommitInfo) -> bool {
    let mut stack: Vec<CommitKey> = commit.direct_provenance.iter().cloned().collect();
    let mut seen = BTreeSet::new();

    while let Some(key) = stack.pop() {
        if !seen.insert(key.clone()) {
            continue;
        }
        match txn.get_commit(&key) {
            Some(info) if info.is_finished() => {
                stack.extend(info.direct_provenance.iter().cloned());
            }
            _ => return false,
        }
    }

    true
}

/// State a not yet finished commit should be in given its provenance.
///
/// Commits without provenance stay STARTED until they are finished.
pub fn open_state(txn: &mut Txn, commit: &CommitInfo) -> CommitState {
    if !commit.direct_provenance.is_empty() && is_transitively_ready(txn, commit) {
        CommitState::Ready
    } else {
        CommitState::Started
    }
}

/// Replace the direct provenance of `commit` with `upstream`, keeping the
/// upstream commits' `direct_subvenance` in sync. `commit` itself is not
/// written.
pub fn relink_provenance(txn: &mut Txn, commit: &mut CommitInfo, upstream: BTreeSet<CommitKey>) {
    for removed in commit.direct_provenance.difference(&upstream) {
        if let Some(mut info) = txn.get_commit(removed) {
            info.direct_subvenance.remove(&commit.commit);
            txn.put_commit(info);
        }
    }
    for added in upstream.difference(&commit.direct_provenance) {
        if let Some(mut info) = txn.get_commit(added) {
            info.direct_subvenance.insert(commit.commit.clone());
            txn.put_commit(info);
        }
    }

    commit.direct_provenance = upstream;
}

/// Move STARTED commits in `candidates` to READY when their provenance is
/// now complete. Returns the promoted commits.
pub fn promote(txn: &mut Txn, candidates: impl IntoIterator<Item = CommitKey>) -> Vec<CommitKey> {
    let mut promoted = Vec::new();

    for key in candidates {
        let Some(mut info) = txn.get_commit(&key) else {
            continue;
        };
        if info.state != CommitState::Started {
            continue;
        }
        if open_state(txn, &info) == CommitState::Ready {
            debug!(commit = %key, "commit is ready");
            info.state = CommitState::Ready;
            txn.put_commit(info);
            promoted.push(key);
        }
    }

    promoted
}

/// Recompute `provenance` and `subvenance` after the direct edges of
/// branches in `affected` changed.
///
/// `affected` must contain the edited branch and its whole subvenance from
/// before the edit; the new direct edges must already be written. Returns
/// the branches whose provenance gained members.
pub fn recompute_branches(
    txn: &mut Txn,
    affected: &BTreeSet<BranchKey>,
) -> Result<BTreeSet<BranchKey>> {
    let order = graph::topo_sort(affected, |branch| {
        Ok(txn
            .get_branch(branch)
            .map(|info| info.direct_provenance)
            .unwrap_or_default())
    })?;

    let mut old_provenance: BTreeMap<BranchKey, BTreeSet<BranchKey>> = BTreeMap::new();
    let mut new_provenance: BTreeMap<BranchKey, BTreeSet<BranchKey>> = BTreeMap::new();
    for branch in &order {
        let info = txn.require_branch(branch)?;
        let computed = graph::closure(&info.direct_provenance, |upstream| {
            if let Some(recomputed) = new_provenance.get(upstream) {
                return Ok(recomputed.clone());
            }
            Ok(txn
                .get_branch(upstream)
                .map(|info| info.provenance)
                .unwrap_or_default())
        })?;

        old_provenance.insert(branch.clone(), info.provenance);
        new_provenance.insert(branch.clone(), computed);
    }

    let touched: BTreeSet<BranchKey> = old_provenance
        .values()
        .chain(new_provenance.values())
        .flatten()
        .cloned()
        .chain(affected.iter().cloned())
        .collect();
    for upstream in touched {
        let Some(mut info) = txn.get_branch(&upstream) else {
            continue;
        };
        let mut subvenance: BTreeSet<BranchKey> = info
            .subvenance
            .iter()
            .filter(|branch| !affected.contains(*branch))
            .cloned()
            .collect();
        subvenance.extend(
            new_provenance
                .iter()
                .filter(|(_, provenance)| provenance.contains(&upstream))
                .map(|(branch, _)| branch.clone()),
        );

        if subvenance != info.subvenance {
            info.subvenance = subvenance;
            txn.put_branch(info);
        }
    }

    let mut grown = BTreeSet::new();
    for (branch, provenance) in new_provenance {
        let Some(mut info) = txn.get_branch(&branch) else {
            continue;
        };
        let old = old_provenance.get(&branch).cloned().unwrap_or_default();
        if !provenance.is_subset(&old) {
            grown.insert(branch.clone());
        }
        if info.provenance != provenance {
            info.provenance = provenance;
            txn.put_branch(info);
        }
    }

    Ok(grown)
}
