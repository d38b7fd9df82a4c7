use crate::areas::metadata::Txn;
use crate::artifacts::metadata::branch_info::BranchInfo;
use crate::artifacts::metadata::commit_info::CommitInfo;
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::provenance::graph::{self, Edges};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{info, warn};

/// An inconsistency between stored fields and what the direct edges imply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Finding {
    #[error("branch {branch} has provenance {actual:?}, expected {expected:?}")]
    ProvenanceMismatch {
        branch: BranchKey,
        expected: BTreeSet<BranchKey>,
        actual: BTreeSet<BranchKey>,
    },

    #[error("branch {branch} has subvenance {actual:?}, expected {expected:?}")]
    SubvenanceMismatch {
        branch: BranchKey,
        expected: BTreeSet<BranchKey>,
        actual: BTreeSet<BranchKey>,
    },

    #[error("branch {branch} depends on missing branch {upstream}")]
    MissingProvenanceBranch {
        branch: BranchKey,
        upstream: BranchKey,
    },

    #[error("branch provenance contains a cycle: {0}")]
    Cycle(String),

    #[error("head of branch {branch} points at missing commit {head}")]
    DanglingHead { branch: BranchKey, head: CommitKey },

    #[error("commit {commit} has missing parent {parent}")]
    DanglingParent { commit: CommitKey, parent: CommitKey },

    #[error("parent link between {parent} and {child} is one-sided")]
    ChildLinkMismatch { parent: CommitKey, child: CommitKey },

    #[error("provenance link between {upstream} and {downstream} is one-sided")]
    ProvenanceLinkMismatch {
        upstream: CommitKey,
        downstream: CommitKey,
    },
}

impl Finding {
    /// Whether [`repair`] can resolve this finding.
    pub fn is_repairable(&self) -> bool {
        !matches!(self, Finding::Cycle(_))
    }
}

struct Snapshot {
    branches: BTreeMap<BranchKey, BranchInfo>,
    commits: BTreeMap<CommitKey, CommitInfo>,
}

fn snapshot(txn: &mut Txn) -> Snapshot {
    let repos = txn.list_repos();
    let branches = repos
        .iter()
        .flat_map(|repo| txn.list_branches(&repo.name))
        .map(|info| (info.branch.clone(), info))
        .collect();
    let commits = txn
        .list_all_commits()
        .into_iter()
        .map(|info| (info.commit.clone(), info))
        .collect();

    Snapshot { branches, commits }
}

/// Direct edges restricted to branches that exist.
fn live_edges(snapshot: &Snapshot) -> Edges {
    snapshot
        .branches
        .iter()
        .map(|(branch, info)| {
            let direct = info
                .direct_provenance
                .iter()
                .filter(|upstream| snapshot.branches.contains_key(*upstream))
                .cloned()
                .collect();
            (branch.clone(), direct)
        })
        .collect()
}

/// Derived fields every branch should carry, or the cycle that prevents
/// computing them.
fn expected_branches(
    snapshot: &Snapshot,
) -> std::result::Result<BTreeMap<BranchKey, (BTreeSet<BranchKey>, BTreeSet<BranchKey>)>, Finding>
{
    let provenance =
        graph::full_provenance(&live_edges(snapshot)).map_err(|err| Finding::Cycle(err.to_string()))?;
    let subvenance = graph::transpose(&provenance);

    Ok(provenance
        .into_iter()
        .map(|(branch, upstream)| {
            let downstream = subvenance.get(&branch).cloned().unwrap_or_default();
            (branch, (upstream, downstream))
        })
        .collect())
}

fn check_snapshot(snapshot: &Snapshot) -> Vec<Finding> {
    let mut findings = Vec::new();

    for (branch, info) in &snapshot.branches {
        for upstream in &info.direct_provenance {
            if !snapshot.branches.contains_key(upstream) {
                findings.push(Finding::MissingProvenanceBranch {
                    branch: branch.clone(),
                    upstream: upstream.clone(),
                });
            }
        }
        if let Some(head) = &info.head
            && !snapshot.commits.contains_key(head)
        {
            findings.push(Finding::DanglingHead {
                branch: branch.clone(),
                head: head.clone(),
            });
        }
    }

    match expected_branches(snapshot) {
        Ok(expected) => {
            for (branch, (provenance, subvenance)) in expected {
                let info = &snapshot.branches[&branch];
                if info.provenance != provenance {
                    findings.push(Finding::ProvenanceMismatch {
                        branch: branch.clone(),
                        expected: provenance,
                        actual: info.provenance.clone(),
                    });
                }
                if info.subvenance != subvenance {
                    findings.push(Finding::SubvenanceMismatch {
                        branch,
                        expected: subvenance,
                        actual: info.subvenance.clone(),
                    });
                }
            }
        }
        Err(cycle) => findings.push(cycle),
    }

    for (key, info) in &snapshot.commits {
        if let Some(parent) = &info.parent {
            match snapshot.commits.get(parent) {
                None => findings.push(Finding::DanglingParent {
                    commit: key.clone(),
                    parent: parent.clone(),
                }),
                Some(parent_info) if !parent_info.children.contains(key) => {
                    findings.push(Finding::ChildLinkMismatch {
                        parent: parent.clone(),
                        child: key.clone(),
                    })
                }
                Some(_) => {}
            }
        }
        for child in &info.children {
            let linked = snapshot
                .commits
                .get(child)
                .is_some_and(|child_info| child_info.parent.as_ref() == Some(key));
            if !linked {
                findings.push(Finding::ChildLinkMismatch {
                    parent: key.clone(),
                    child: child.clone(),
                });
            }
        }

        for upstream in &info.direct_provenance {
            let linked = snapshot
                .commits
                .get(upstream)
                .is_some_and(|upstream_info| upstream_info.direct_subvenance.contains(key));
            if !linked {
                findings.push(Finding::ProvenanceLinkMismatch {
                    upstream: upstream.clone(),
                    downstream: key.clone(),
                });
            }
        }
        for downstream in &info.direct_subvenance {
            let linked = snapshot
                .commits
                .get(downstream)
                .is_some_and(|downstream_info| downstream_info.direct_provenance.contains(key));
            if !linked {
                findings.push(Finding::ProvenanceLinkMismatch {
                    upstream: key.clone(),
                    downstream: downstream.clone(),
                });
            }
        }
    }

    findings
}

/// Compare every derived field with what the direct edges imply.
pub fn check(txn: &mut Txn) -> Vec<Finding> {
    check_snapshot(&snapshot(txn))
}

/// Rewrite every derived field from the direct edges.
///
/// Returns what was found before repairing. Cycles are reported but left
/// alone, and the branch fields are then not rewritten.
pub fn repair(txn: &mut Txn) -> Vec<Finding> {
    let snapshot = snapshot(txn);
    let findings = check_snapshot(&snapshot);
    if findings.is_empty() {
        return findings;
    }

    let expected = expected_branches(&snapshot).ok();
    for (branch, info) in &snapshot.branches {
        let mut fixed = info.clone();
        fixed
            .direct_provenance
            .retain(|upstream| snapshot.branches.contains_key(upstream));
        if fixed
            .head
            .as_ref()
            .is_some_and(|head| !snapshot.commits.contains_key(head))
        {
            fixed.head = None;
        }
        if let Some((provenance, subvenance)) = expected.as_ref().and_then(|all| all.get(branch)) {
            fixed.provenance = provenance.clone();
            fixed.subvenance = subvenance.clone();
        }

        if fixed != *info {
            txn.put_branch(fixed);
        }
    }

    let mut children: BTreeMap<CommitKey, BTreeSet<CommitKey>> = BTreeMap::new();
    let mut subvenance: BTreeMap<CommitKey, BTreeSet<CommitKey>> = BTreeMap::new();
    for (key, info) in &snapshot.commits {
        if let Some(parent) = &info.parent {
            children.entry(parent.clone()).or_default().insert(key.clone());
        }
        for upstream in &info.direct_provenance {
            subvenance
                .entry(upstream.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    for (key, info) in &snapshot.commits {
        let mut fixed = info.clone();
        if fixed
            .parent
            .as_ref()
            .is_some_and(|parent| !snapshot.commits.contains_key(parent))
        {
            fixed.parent = None;
        }
        fixed.children = children.remove(key).unwrap_or_default();
        fixed
            .direct_provenance
            .retain(|upstream| snapshot.commits.contains_key(upstream));
        fixed.direct_subvenance = subvenance.remove(key).unwrap_or_default();

        if fixed != *info {
            txn.put_commit(fixed);
        }
    }

    for finding in &findings {
        if finding.is_repairable() {
            info!(%finding, "repaired");
        } else {
            warn!(%finding, "cannot repair");
        }
    }

    findings
}
