use crate::areas::metadata::Txn;
use crate::areas::pfs::Pfs;
use crate::artifacts::branch::names::{BranchName, RepoName};
use crate::artifacts::fileset::FileSet;
use crate::artifacts::metadata::branch_info::{BranchInfo, BranchOptions};
use crate::artifacts::metadata::commit_info::{CommitInfo, CommitOrigin, CommitState};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey, CommitRef};
use crate::artifacts::metadata::trigger::Trigger;
use crate::artifacts::provenance::propagate::propagate;
use crate::artifacts::provenance::{recompute_branches, relink_provenance, squash};
use crate::commands::commit::resolve;
use crate::errors::{Error, Result};
use chrono::Utc;
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, info};

/// Current heads of the direct provenance of `branch`.
pub(crate) fn upstream_heads(txn: &mut Txn, branch: &BranchInfo) -> BTreeSet<CommitKey> {
    branch
        .direct_provenance
        .iter()
        .filter_map(|upstream| txn.get_branch(upstream).and_then(|info| info.head))
        .collect()
}

/// Detach `branch` from the provenance graph, then remove it with its
/// commits. Returns the removed commits.
pub(crate) fn remove_branch(txn: &mut Txn, branch: &BranchKey) -> Result<Vec<CommitKey>> {
    let mut info = txn.require_branch(branch)?;

    for downstream in &info.subvenance {
        if let Some(mut downstream_info) = txn.get_branch(downstream)
            && downstream_info.direct_provenance.remove(branch)
        {
            txn.put_branch(downstream_info);
        }
    }
    let mut affected = info.subvenance.clone();
    affected.insert(branch.clone());
    info.direct_provenance.clear();
    txn.put_branch(info);
    recompute_branches(txn, &affected)?;

    let doomed: BTreeSet<CommitKey> = txn
        .list_commits(&branch.repo)
        .into_iter()
        .filter(|commit| commit.commit.branch == *branch)
        .map(|commit| commit.commit)
        .collect();
    let removed = squash::remove_commits(txn, &doomed)?;
    txn.delete_branch(branch);

    Ok(removed)
}

/// Point a new commit on `branch` at the finished `source` of another
/// branch, sharing its ID and tree.
fn alias(txn: &mut Txn, branch: &BranchInfo, source: CommitInfo) -> Result<CommitKey> {
    if !source.is_finished() {
        return Err(Error::failed_precondition(format!(
            "cannot point branch {} at unfinished commit {}",
            branch.branch, source.commit
        )));
    }

    let key = CommitKey::new(branch.branch.clone(), source.commit.id.clone());
    if txn.get_commit(&key).is_some() {
        return Ok(key);
    }

    let mut commit = CommitInfo::new(key.clone(), CommitOrigin::Alias, Some(source.commit.clone()));
    commit.state = CommitState::Finished;
    commit.finished = Some(Utc::now());
    commit.description = source.description.clone();
    commit.size_bytes = source.size_bytes;
    commit.fileset = Some(source.fileset.clone().unwrap_or_default());
    let upstream = upstream_heads(txn, branch);
    relink_provenance(txn, &mut commit, upstream);

    let mut source = source;
    source.children.insert(key.clone());
    txn.put_commit(source);
    txn.put_commit(commit);

    Ok(key)
}

/// Reject a trigger on `branch` that could never fire or would loop.
fn check_trigger(
    txn: &mut Txn,
    branch: &BranchKey,
    trigger: &Trigger,
    provenance: &BTreeSet<BranchKey>,
) -> Result<()> {
    trigger.validate()?;
    if !provenance.is_empty() {
        return Err(Error::invalid_argument(format!(
            "branch {branch} cannot have both provenance and a trigger"
        )));
    }
    let source = trigger_source(branch, trigger)?;
    if source == *branch {
        return Err(Error::invalid_argument(format!(
            "branch {branch} cannot trigger on itself"
        )));
    }

    let mut seen = BTreeSet::new();
    let mut next = Some(source);
    while let Some(current) = next {
        if current == *branch {
            return Err(Error::invalid_argument(format!(
                "triggers of branch {branch} would form a loop"
            )));
        }
        if !seen.insert(current.clone()) {
            break;
        }
        next = match txn.get_branch(&current).and_then(|info| info.trigger) {
            Some(trigger) => Some(trigger_source(&current, &trigger)?),
            None => None,
        };
    }
    Ok(())
}

fn trigger_source(branch: &BranchKey, trigger: &Trigger) -> Result<BranchKey> {
    Ok(BranchKey::new(
        branch.repo.clone(),
        BranchName::try_parse(trigger.branch.as_str())?,
    ))
}

/// Jobs from `head` back to, not including, `old`; stops at `limit`. An
/// alias and its source count once.
fn commits_since(txn: &mut Txn, head: &CommitInfo, old: Option<&CommitInfo>, limit: u64) -> u64 {
    let mut count = 0;
    let mut counted = None;
    let mut current = Some(head.clone());
    while let Some(info) = current {
        if count >= limit || old.is_some_and(|old| old.commit.id == info.commit.id) {
            break;
        }
        if counted.as_ref() != Some(&info.commit.id) {
            count += 1;
            counted = Some(info.commit.id.clone());
        }
        current = info.parent.as_ref().and_then(|parent| txn.get_commit(parent));
    }
    count
}

/// Move every branch triggered by `moved`, then the branches triggered by
/// those. Returns the alias commits created with their trees.
pub(crate) fn fire_triggers(txn: &mut Txn, moved: &BranchKey) -> Result<Vec<(CommitKey, FileSet)>> {
    let mut adopted = Vec::new();
    let mut queue = VecDeque::from([moved.clone()]);

    while let Some(source) = queue.pop_front() {
        let Some(head) = txn
            .get_branch(&source)
            .and_then(|info| info.head)
            .and_then(|head| txn.get_commit(&head))
            .filter(CommitInfo::is_finished)
        else {
            continue;
        };

        for mut target in txn.list_branches(&source.repo) {
            let Some(trigger) = target.trigger.clone() else {
                continue;
            };
            if trigger_source(&target.branch, &trigger)? != source {
                continue;
            }
            let old = target.head.as_ref().and_then(|key| txn.get_commit(key));
            let settled = old
                .as_ref()
                .is_some_and(|old| !old.is_finished() || old.commit.id == head.commit.id);
            if settled {
                continue;
            }
            let commits = commits_since(txn, &head, old.as_ref(), trigger.commits);
            if !trigger.fires(old.as_ref(), &head, commits)? {
                continue;
            }

            let key = alias(txn, &target, head.clone())?;
            adopted.push((key.clone(), head.fileset.clone().unwrap_or_default()));
            target.head = Some(key.clone());
            txn.put_branch(target.clone());
            let advanced = BTreeSet::from([target.branch.clone()]);
            propagate(txn, &BTreeSet::new(), &advanced, Some(&key.id))?;
            debug!(branch = %target.branch, commit = %key, "trigger fired");

            queue.push_back(target.branch);
        }
    }

    Ok(adopted)
}

impl Pfs {
    /// Create `branch`, or update it when `options.update` is set.
    ///
    /// - `provenance` replaces the branch's direct provenance; missing
    ///   provenance branches are created, their repos must exist
    /// - `head` moves the branch: to that commit if it is on this branch,
    ///   otherwise to a new alias commit of it
    /// - `options.trigger` makes the branch follow another branch of its
    ///   repo; it excludes provenance
    ///
    /// Downstream branches whose inputs changed get new commits, and
    /// branches triggered by a moved head follow it.
    pub fn create_branch(
        &self,
        branch: &BranchKey,
        head: Option<&CommitRef>,
        provenance: &[BranchKey],
        options: BranchOptions,
    ) -> Result<BranchInfo> {
        let provenance: BTreeSet<BranchKey> = provenance.iter().cloned().collect();
        if provenance.contains(branch) {
            return Err(Error::invalid_argument(format!(
                "branch {branch} cannot be in the provenance of its own branch"
            )));
        }

        let (info, adopted) = self.metadata().transact(|txn| {
            txn.require_repo(&branch.repo)?;
            let existing = txn.get_branch(branch);
            if existing.is_some() && !options.update {
                return Err(Error::already_exists(format!("branch {branch}")));
            }
            if let Some(trigger) = &options.trigger {
                check_trigger(txn, branch, trigger, &provenance)?;
            }
            for upstream in &provenance {
                txn.require_repo(&upstream.repo)?;
                if txn.get_branch(upstream).is_none() {
                    debug!(branch = %upstream, "creating missing provenance branch");
                    txn.put_branch(BranchInfo::new(upstream.clone()));
                }
            }

            let mut info = existing.unwrap_or_else(|| BranchInfo::new(branch.clone()));
            let mut affected = info.subvenance.clone();
            affected.insert(branch.clone());
            info.direct_provenance = provenance.clone();
            info.auto_finish = options.auto_finish;
            info.trigger = options.trigger.clone();
            txn.put_branch(info);
            let mut grown = recompute_branches(txn, &affected)?;

            let mut advanced = BTreeSet::new();
            let mut adopted = Vec::new();
            let mut job = None;
            if let Some(head) = head {
                let target = resolve(txn, head)?;
                let mut info = txn.require_branch(branch)?;
                let key = if target.commit.branch == *branch {
                    target.commit
                } else {
                    let fileset = target.fileset.clone().unwrap_or_default();
                    let key = alias(txn, &info, target)?;
                    adopted.push((key.clone(), fileset));
                    key
                };
                job = Some(key.id.clone());
                info.head = Some(key);
                txn.put_branch(info);

                grown.remove(branch);
                advanced.insert(branch.clone());
            }

            let created = propagate(txn, &grown, &advanced, job.as_ref())?;
            debug!(%branch, created = created.len(), "propagated branch change");
            if head.is_some() {
                adopted.extend(fire_triggers(txn, branch)?);
            }

            Ok((txn.require_branch(branch)?, adopted))
        })?;

        for (key, fileset) in adopted {
            self.storage().adopt(&key, fileset)?;
        }
        info!(%branch, provenance = info.provenance.len(), "created branch");

        self.finish_ready_commits()?;
        Ok(info)
    }

    pub fn inspect_branch(&self, branch: &BranchKey) -> Result<BranchInfo> {
        self.metadata().read(|txn| txn.require_branch(branch))
    }

    /// Branches of `repo`, newest first.
    pub fn list_branch(&self, repo: &str) -> Result<Vec<BranchInfo>> {
        let repo = RepoName::try_parse(repo)?;

        self.metadata().read(|txn| {
            txn.require_repo(&repo)?;
            let mut branches = txn.list_branches(&repo);
            branches.reverse();
            Ok(branches)
        })
    }

    /// Delete `branch` and its commits. Deleting a missing branch succeeds.
    ///
    /// Fails if other branches depend on it, unless `force` is set; they
    /// then lose it from their provenance.
    pub fn delete_branch(&self, branch: &BranchKey, force: bool) -> Result<()> {
        let removed = self.metadata().transact(|txn| {
            let Some(info) = txn.get_branch(branch) else {
                return Ok(Vec::new());
            };
            if !force && !info.subvenance.is_empty() {
                let dependents: Vec<String> =
                    info.subvenance.iter().map(ToString::to_string).collect();
                return Err(Error::failed_precondition(format!(
                    "branch {branch} has dependents {}; deleting it would break their provenance",
                    dependents.join(", ")
                )));
            }

            remove_branch(txn, branch)
        })?;
        self.storage().forget(&removed)?;

        info!(%branch, commits = removed.len(), "deleted branch");
        self.finish_ready_commits()?;
        Ok(())
    }
}
