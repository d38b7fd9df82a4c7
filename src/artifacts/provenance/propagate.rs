use crate::areas::metadata::Txn;
use crate::artifacts::metadata::commit_info::{CommitInfo, CommitOrigin, CommitState};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::objects::job_id::JobId;
use crate::artifacts::provenance::{graph, open_state, relink_provenance};
use crate::errors::Result;
use std::collections::BTreeSet;
use tracing::debug;

/// Open or extend commits downstream of a change.
///
/// - `grown`: branches whose provenance just gained members
/// - `advanced`: branches whose head was just moved by the caller
/// - `job`: ID of the commit that triggered the change, if any
///
/// Every branch downstream of `grown` or `advanced` is visited in
/// topological order. A branch whose head already has every current
/// upstream head in its direct provenance is left alone; otherwise a new
/// commit is opened on it (or its open head of the same job is extended).
/// Returns the commits created.
pub fn propagate(
    txn: &mut Txn,
    grown: &BTreeSet<BranchKey>,
    advanced: &BTreeSet<BranchKey>,
    job: Option<&JobId>,
) -> Result<Vec<CommitKey>> {
    let mut candidates = grown.clone();
    for branch in grown.iter().chain(advanced) {
        if let Some(info) = txn.get_branch(branch) {
            candidates.extend(info.subvenance);
        }
    }
    candidates.retain(|branch| !advanced.contains(branch));

    let order = graph::topo_sort(&candidates, |branch| {
        Ok(txn
            .get_branch(branch)
            .map(|info| info.direct_provenance)
            .unwrap_or_default())
    })?;

    let mut moved = advanced.clone();
    let mut created = Vec::new();
    for branch in order {
        let mut info = txn.require_branch(&branch)?;
        let triggered = grown.contains(&branch)
            || info
                .direct_provenance
                .iter()
                .any(|upstream| moved.contains(upstream));
        if !triggered {
            continue;
        }

        let upstream_heads: BTreeSet<CommitKey> = info
            .direct_provenance
            .iter()
            .filter_map(|upstream| txn.get_branch(upstream).and_then(|info| info.head))
            .collect();
        if upstream_heads.is_empty() {
            continue;
        }

        let head = info.head.as_ref().and_then(|head| txn.get_commit(head));
        if head
            .as_ref()
            .is_some_and(|head| upstream_heads.is_subset(&head.direct_provenance))
        {
            continue;
        }

        let id = job_for(txn, &upstream_heads, job);
        let mut key = CommitKey::new(branch.clone(), id);
        if let Some(existing) = txn.get_commit(&key) {
            if info.head.as_ref() == Some(&key) && !existing.is_finished() {
                extend(txn, existing, upstream_heads);
                moved.insert(branch);
                continue;
            }
            key = CommitKey::new(branch.clone(), JobId::generate());
        }

        let mut commit = CommitInfo::new(key.clone(), CommitOrigin::Auto, info.head.clone());
        if let Some(mut parent) = head {
            parent.children.insert(key.clone());
            txn.put_commit(parent);
        }
        relink_provenance(txn, &mut commit, upstream_heads);
        commit.state = open_state(txn, &commit);
        debug!(commit = %key, state = %commit.state, "opened downstream commit");
        txn.put_commit(commit);

        info.head = Some(key.clone());
        txn.put_branch(info);

        moved.insert(branch);
        created.push(key);
    }

    Ok(created)
}

/// The triggering job if one of the upstream heads belongs to it, else the
/// newest upstream head's job.
fn job_for(txn: &Txn, upstream_heads: &BTreeSet<CommitKey>, job: Option<&JobId>) -> JobId {
    if let Some(job) = job
        && upstream_heads.iter().any(|head| head.id == *job)
    {
        return job.clone();
    }

    upstream_heads
        .iter()
        .max_by_key(|head| txn.commit_seq(head))
        .map(|head| head.id.clone())
        .unwrap_or_else(JobId::generate)
}

fn extend(txn: &mut Txn, mut commit: CommitInfo, upstream_heads: BTreeSet<CommitKey>) {
    relink_provenance(txn, &mut commit, upstream_heads);

    // never demote; finishing re-checks readiness anyway
    if commit.state == CommitState::Started {
        commit.state = open_state(txn, &commit);
    }
    debug!(commit = %commit.commit, "extended downstream commit");
    txn.put_commit(commit);
}
