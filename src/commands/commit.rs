use crate::areas::metadata::Txn;
use crate::areas::pfs::Pfs;
use crate::artifacts::branch::names::{BranchName, RepoName};
use crate::artifacts::branch::revision::Revision;
use crate::artifacts::fileset::FileSet;
use crate::artifacts::metadata::branch_info::BranchInfo;
use crate::artifacts::metadata::commit_info::{CommitInfo, CommitOrigin, CommitState};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey, CommitRef};
use crate::artifacts::objects::job_id::JobId;
use crate::artifacts::provenance::propagate::propagate;
use crate::artifacts::provenance::{is_transitively_ready, open_state, promote, relink_provenance};
use crate::commands::branch::{fire_triggers, upstream_heads};
use crate::errors::{Error, ErrorKind, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Resolve a caller's commit reference, including ancestry suffixes.
pub(crate) fn resolve(txn: &mut Txn, commit: &CommitRef) -> Result<CommitInfo> {
    txn.require_repo(&commit.repo)?;

    if commit.id.is_empty() {
        let branch = commit
            .branch_key()
            .ok_or_else(|| Error::invalid_argument("a commit needs a branch, an ID, or both"))?;
        let head = txn
            .require_branch(&branch)?
            .head
            .ok_or_else(|| Error::not_found(format!("head of branch {branch}")))?;
        return txn.require_commit(&head);
    }

    let revision = Revision::try_parse(&commit.id)?;
    resolve_revision(txn, commit, &revision)
}

fn resolve_revision(txn: &mut Txn, commit: &CommitRef, revision: &Revision) -> Result<CommitInfo> {
    match revision {
        Revision::Base(base) => resolve_base(txn, commit, base),
        Revision::Ancestor(inner, generations) => {
            let mut current = resolve_revision(txn, commit, inner)?;
            for _ in 0..*generations {
                let parent = current
                    .parent
                    .clone()
                    .ok_or_else(|| Error::not_found(format!("ancestor of {commit}")))?;
                current = txn.require_commit(&parent)?;
            }
            Ok(current)
        }
        Revision::FromRoot(inner, position) => {
            let tip = resolve_revision(txn, commit, inner)?;
            let mut lineage = vec![tip];
            while let Some(parent) = lineage.last().and_then(|info| info.parent.clone()) {
                lineage.push(txn.require_commit(&parent)?);
            }
            lineage.reverse();

            lineage
                .into_iter()
                .nth(*position - 1)
                .ok_or_else(|| Error::not_found(format!("commit {commit}")))
        }
    }
}

fn resolve_base(txn: &mut Txn, commit: &CommitRef, base: &str) -> Result<CommitInfo> {
    if !JobId::looks_like_id(base) {
        let branch = BranchKey::new(commit.repo.clone(), BranchName::try_parse(base)?);
        let head = txn
            .require_branch(&branch)?
            .head
            .ok_or_else(|| Error::not_found(format!("head of branch {branch}")))?;
        return txn.require_commit(&head);
    }

    let id = JobId::try_parse(base)?;
    match commit.branch_key() {
        Some(branch) => txn.require_commit(&CommitKey::new(branch, id)),
        None => txn
            .list_commits(&commit.repo)
            .into_iter()
            .find(|info| info.commit.id == id)
            .ok_or_else(|| Error::not_found(format!("commit {commit}"))),
    }
}

/// Commits of `repo` (on `branch` if given), oldest first.
fn commits_of(txn: &mut Txn, repo: &RepoName, branch: Option<&BranchKey>) -> Vec<CommitInfo> {
    txn.list_commits(repo)
        .into_iter()
        .filter(|info| branch.is_none_or(|branch| info.commit.branch == *branch))
        .collect()
}

/// Creation sequence below which `from` and everything older lies.
fn cutoff(txn: &mut Txn, commit: Option<&CommitRef>) -> Result<Option<u64>> {
    let Some(commit) = commit else {
        return Ok(None);
    };
    let info = resolve(txn, commit)?;

    txn.commit_seq(&info.commit)
        .map(Some)
        .ok_or_else(|| Error::not_found(format!("commit {commit}")))
}

fn newer_than(txn: &Txn, info: &CommitInfo, cutoff: Option<u64>) -> bool {
    match (cutoff, txn.commit_seq(&info.commit)) {
        (Some(cutoff), Some(seq)) => seq > cutoff,
        _ => true,
    }
}

impl Pfs {
    /// Open a commit on `branch`, creating the branch if needed.
    ///
    /// The new commit's parent is `parent` or the branch head, and must be
    /// finished; a branch whose head is still open cannot take another
    /// commit. Downstream branches get commits of the same job.
    pub fn start_commit(
        &self,
        branch: &BranchKey,
        parent: Option<&CommitRef>,
        description: &str,
    ) -> Result<CommitInfo> {
        let commit = self.metadata().transact(|txn| {
            txn.require_repo(&branch.repo)?;
            let mut info = match txn.get_branch(branch) {
                Some(info) => info,
                None => {
                    let info = BranchInfo::new(branch.clone());
                    txn.put_branch(info.clone());
                    info
                }
            };

            let head = info.head.as_ref().map(|head| txn.require_commit(head)).transpose()?;
            if let Some(head) = head.as_ref().filter(|head| !head.is_finished()) {
                return Err(Error::failed_precondition(format!(
                    "branch {branch} already has open commit {}; finish it before starting another",
                    head.commit
                )));
            }
            let parent = match parent {
                Some(parent) => Some(resolve(txn, parent)?),
                None => head,
            };
            if let Some(parent) = parent.as_ref().filter(|parent| !parent.is_finished()) {
                return Err(Error::failed_precondition(format!(
                    "parent commit {} is not finished",
                    parent.commit
                )));
            }

            let id = JobId::generate();
            let key = CommitKey::new(branch.clone(), id.clone());
            let mut commit = CommitInfo::new(
                key.clone(),
                CommitOrigin::User,
                parent.as_ref().map(|parent| parent.commit.clone()),
            );
            commit.description = description.to_string();
            let upstream = upstream_heads(txn, &info);
            relink_provenance(txn, &mut commit, upstream);
            commit.state = open_state(txn, &commit);

            if let Some(mut parent) = parent {
                parent.children.insert(key.clone());
                txn.put_commit(parent);
            }
            txn.put_commit(commit.clone());
            info.head = Some(key);
            txn.put_branch(info);

            let advanced = BTreeSet::from([branch.clone()]);
            let created = propagate(txn, &BTreeSet::new(), &advanced, Some(&id))?;
            debug!(commit = %commit.commit, downstream = created.len(), "started commit");

            Ok(commit)
        })?;

        info!(commit = %commit.commit, "started commit");
        Ok(commit)
    }

    /// Seal `commit` and record its final tree and size.
    ///
    /// The commit's parent must be finished and every commit in its
    /// transitive provenance must be finished.
    pub fn finish_commit(&self, commit: &CommitRef, description: Option<&str>) -> Result<CommitInfo> {
        let key = self.metadata().read(|txn| resolve(txn, commit))?.commit;
        let finished = self.finish_key(&key, description)?;

        self.finish_ready_commits()?;
        Ok(finished)
    }

    /// Drop every write made to the open `commit`. The commit stays open.
    pub fn clear_commit(&self, commit: &CommitRef) -> Result<()> {
        let info = self.metadata().read(|txn| resolve(txn, commit))?;
        if info.is_finished() {
            return Err(Error::failed_precondition(format!(
                "cannot clear finished commit {}",
                info.commit
            )));
        }

        self.storage().clear(&info.commit)?;
        info!(commit = %info.commit, "cleared commit");
        Ok(())
    }

    fn finishable(txn: &mut Txn, key: &CommitKey) -> Result<(CommitInfo, FileSet)> {
        let info = txn.require_commit(key)?;
        if info.is_finished() {
            return Err(Error::failed_precondition(format!(
                "commit {key} is already finished"
            )));
        }

        let base = match &info.parent {
            Some(parent) => {
                let parent = txn.require_commit(parent)?;
                if !parent.is_finished() {
                    return Err(Error::failed_precondition(format!(
                        "cannot finish {key}: parent {} is not finished",
                        parent.commit
                    )));
                }
                parent.fileset.unwrap_or_default()
            }
            None => FileSet::empty(),
        };
        if !is_transitively_ready(txn, &info) {
            return Err(Error::failed_precondition(format!(
                "cannot finish {key}: its provenance is not finished"
            )));
        }

        Ok((info, base))
    }

    pub(crate) fn finish_key(&self, key: &CommitKey, description: Option<&str>) -> Result<CommitInfo> {
        let (_, base) = self.metadata().read(|txn| Self::finishable(txn, key))?;

        let mut finished = None;
        self.storage().finish(key, &base, |fileset, size| {
            let recorded = self.metadata().transact(|txn| {
                let (mut info, current_base) = Self::finishable(txn, key)?;
                if current_base != base {
                    return Err(Error::failed_precondition(format!(
                        "parent of {key} changed while finishing"
                    )));
                }

                info.state = CommitState::Finished;
                info.finished = Some(Utc::now());
                info.size_bytes = size;
                info.fileset = Some(fileset.clone());
                if let Some(description) = description {
                    info.description = description.to_string();
                }
                txn.put_commit(info.clone());
                promote(txn, info.direct_subvenance.iter().cloned());

                let is_head = txn
                    .get_branch(&key.branch)
                    .is_some_and(|branch| branch.head.as_ref() == Some(key));
                let adopted = if is_head {
                    fire_triggers(txn, &key.branch)?
                } else {
                    Vec::new()
                };

                Ok((info, adopted))
            })?;
            finished = Some(recorded);
            Ok(())
        })?;

        let (finished, adopted) =
            finished.ok_or_else(|| Error::internal(format!("commit {key} finished without a record")))?;
        for (alias, fileset) in adopted {
            self.storage().adopt(&alias, fileset)?;
        }
        info!(commit = %key, size = finished.size_bytes, "finished commit");
        Ok(finished)
    }

    /// Finish ready commits of auto-finishing branches until none is left.
    pub(crate) fn finish_ready_commits(&self) -> Result<()> {
        loop {
            let ready: Vec<CommitKey> = self.metadata().read(|txn| {
                let mut ready = Vec::new();
                for commit in txn.list_all_commits() {
                    if commit.state != CommitState::Ready {
                        continue;
                    }
                    let auto_finish = txn
                        .get_branch(&commit.commit.branch)
                        .is_some_and(|branch| branch.auto_finish);
                    let parent_finished = commit
                        .parent
                        .as_ref()
                        .is_none_or(|parent| txn.get_commit(parent).is_some_and(|p| p.is_finished()));
                    if auto_finish && parent_finished {
                        ready.push(commit.commit);
                    }
                }
                Ok(ready)
            })?;

            let mut progressed = false;
            for key in ready {
                match self.finish_key(&key, None) {
                    Ok(_) => progressed = true,
                    Err(err) if err.kind() == ErrorKind::FailedPrecondition => {
                        debug!(commit = %key, %err, "skipping auto-finish");
                    }
                    Err(err) => return Err(err),
                }
            }
            if !progressed {
                return Ok(());
            }
        }
    }

    pub fn inspect_commit(&self, commit: &CommitRef) -> Result<CommitInfo> {
        self.metadata().read(|txn| resolve(txn, commit))
    }

    /// Block until `commit` reaches `state`.
    pub async fn wait_for_commit(
        &self,
        commit: &CommitRef,
        state: CommitState,
        deadline: Option<Duration>,
    ) -> Result<CommitInfo> {
        self.wait_until(deadline, &format!("{commit} to be {state}"), |txn| {
            let info = resolve(txn, commit)?;
            Ok(info.reached(state).then_some(info))
        })
        .await
    }

    /// Commits of `repo`, newest first.
    ///
    /// - `branch`: only commits created on this branch
    /// - `from`: only commits created after this one
    /// - `limit`: at most this many, 0 for all
    /// - `reverse`: oldest first instead
    pub fn list_commit(
        &self,
        repo: &str,
        branch: Option<&str>,
        from: Option<&str>,
        limit: usize,
        reverse: bool,
    ) -> Result<Vec<CommitInfo>> {
        let repo = RepoName::try_parse(repo)?;
        let branch = branch
            .map(|name| BranchName::try_parse(name).map(|name| BranchKey::new(repo.clone(), name)))
            .transpose()?;
        let from = from.map(|id| CommitRef {
            repo: repo.clone(),
            branch: branch.as_ref().map(|branch| branch.name.clone()),
            id: id.to_string(),
        });

        self.metadata().read(|txn| {
            txn.require_repo(&repo)?;
            if let Some(branch) = &branch {
                txn.require_branch(branch)?;
            }
            let cutoff = cutoff(txn, from.as_ref())?;

            let mut commits: Vec<CommitInfo> = commits_of(txn, &repo, branch.as_ref())
                .into_iter()
                .filter(|info| newer_than(txn, info, cutoff))
                .collect();
            if !reverse {
                commits.reverse();
            }
            if limit > 0 {
                commits.truncate(limit);
            }

            Ok(commits)
        })
    }

    /// Follow the commits of `repo` (on `branch` if given) in creation
    /// order, starting after `from` or at the first commit.
    pub fn subscribe_commit(
        &self,
        repo: &str,
        branch: Option<&str>,
        from: Option<&str>,
        state: CommitState,
    ) -> Result<CommitSubscription<'_>> {
        let repo = RepoName::try_parse(repo)?;
        let branch = branch
            .map(|name| BranchName::try_parse(name).map(|name| BranchKey::new(repo.clone(), name)))
            .transpose()?;
        let from = from.map(|id| CommitRef {
            repo: repo.clone(),
            branch: branch.as_ref().map(|branch| branch.name.clone()),
            id: id.to_string(),
        });

        let cutoff = self.metadata().read(|txn| {
            txn.require_repo(&repo)?;
            cutoff(txn, from.as_ref())
        })?;

        Ok(CommitSubscription {
            pfs: self,
            repo,
            branch,
            state,
            cutoff,
            delivered: BTreeSet::new(),
            revisions: self.metadata().subscribe(),
        })
    }
}

/// Commits of one repo or branch, delivered once each in creation order.
///
/// A commit is delivered when it reaches the subscribed state; later commits
/// wait for it.
pub struct CommitSubscription<'p> {
    pfs: &'p Pfs,
    repo: RepoName,
    branch: Option<BranchKey>,
    state: CommitState,
    cutoff: Option<u64>,
    delivered: BTreeSet<CommitKey>,
    revisions: watch::Receiver<u64>,
}

impl CommitSubscription<'_> {
    pub async fn next(&mut self) -> Result<CommitInfo> {
        loop {
            self.revisions.borrow_and_update();
            let next = self.pfs.metadata().read(|txn| {
                let pending = commits_of(txn, &self.repo, self.branch.as_ref())
                    .into_iter()
                    .filter(|info| newer_than(txn, info, self.cutoff))
                    .find(|info| !self.delivered.contains(&info.commit));
                Ok(pending.filter(|info| info.reached(self.state)))
            })?;

            if let Some(info) = next {
                self.delivered.insert(info.commit.clone());
                return Ok(info);
            }
            self.revisions
                .changed()
                .await
                .map_err(|_| Error::internal("metadata store shut down"))?;
        }
    }
}
