use crate::areas::metadata::Txn;
use crate::areas::pfs::Pfs;
use crate::artifacts::metadata::JobInfo;
use crate::artifacts::metadata::commit_info::CommitInfo;
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::objects::job_id::JobId;
use crate::artifacts::provenance::squash;
use crate::errors::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::info;

fn parse_job(id: &str) -> Result<JobId> {
    JobId::try_parse(id).map_err(|err| Error::invalid_argument(err.to_string()))
}

/// Commits of `id`, upstream branches first.
fn job_commits(txn: &mut Txn, id: &JobId) -> Vec<CommitInfo> {
    let mut commits: Vec<(usize, u64, CommitInfo)> = txn
        .list_all_commits()
        .into_iter()
        .filter(|info| info.commit.id == *id)
        .map(|info| {
            let depth = txn
                .get_branch(&info.commit.branch)
                .map_or(0, |branch| branch.provenance.len());
            let seq = txn.commit_seq(&info.commit).unwrap_or(u64::MAX);
            (depth, seq, info)
        })
        .collect();
    commits.sort_by_key(|(depth, seq, _)| (*depth, *seq));

    commits.into_iter().map(|(_, _, info)| info).collect()
}

impl Pfs {
    /// Every commit of job `id`, in topological order.
    pub fn inspect_job(&self, id: &str) -> Result<JobInfo> {
        let id = parse_job(id)?;

        let commits = self.metadata().read(|txn| Ok(job_commits(txn, &id)))?;
        if commits.is_empty() {
            return Err(Error::not_found(format!("job {id}")));
        }

        Ok(JobInfo { id, commits })
    }

    /// Every job, newest first.
    pub fn list_job(&self) -> Result<Vec<JobInfo>> {
        self.metadata().read(|txn| {
            let mut first_seen: BTreeMap<JobId, u64> = BTreeMap::new();
            for info in txn.list_all_commits() {
                let seq = txn.commit_seq(&info.commit).unwrap_or(u64::MAX);
                first_seen
                    .entry(info.commit.id)
                    .and_modify(|first| *first = (*first).min(seq))
                    .or_insert(seq);
            }

            let mut jobs: Vec<(u64, JobId)> =
                first_seen.into_iter().map(|(id, seq)| (seq, id)).collect();
            jobs.sort_by(|a, b| b.cmp(a));

            Ok(jobs
                .into_iter()
                .map(|(_, id)| {
                    let commits = job_commits(txn, &id);
                    JobInfo { id, commits }
                })
                .collect())
        })
    }

    /// Wait until the commits of job `id` on `branches` (all of them if
    /// empty) are finished, and return them in topological order.
    ///
    /// Branches that took no part in the job yield no commits.
    pub async fn flush_job(
        &self,
        id: &str,
        branches: &[BranchKey],
        deadline: Option<Duration>,
    ) -> Result<Vec<CommitInfo>> {
        let id = parse_job(id)?;
        let selected: BTreeSet<BranchKey> = branches.iter().cloned().collect();

        self.metadata().read(|txn| {
            if job_commits(txn, &id).is_empty() {
                return Err(Error::not_found(format!("job {id}")));
            }
            for branch in &selected {
                txn.require_branch(branch)?;
            }
            Ok(())
        })?;

        self.wait_until(deadline, &format!("job {id} to finish"), |txn| {
            let commits: Vec<CommitInfo> = job_commits(txn, &id)
                .into_iter()
                .filter(|info| selected.is_empty() || selected.contains(&info.commit.branch))
                .collect();
            Ok(commits
                .iter()
                .all(CommitInfo::is_finished)
                .then_some(commits))
        })
        .await
    }

    /// Remove every commit of job `id`, re-parenting their children.
    pub fn squash_job(&self, id: &str) -> Result<()> {
        let id = parse_job(id)?;

        let removed = self.metadata().transact(|txn| {
            let doomed: BTreeSet<CommitKey> = job_commits(txn, &id)
                .into_iter()
                .map(|info| info.commit)
                .collect();
            if doomed.is_empty() {
                return Err(Error::not_found(format!("job {id}")));
            }
            squash::remove_commits(txn, &doomed)
        })?;
        self.storage().forget(&removed)?;

        info!(job = %id, commits = removed.len(), "squashed job");
        self.finish_ready_commits()
    }
}
