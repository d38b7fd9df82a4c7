use crate::areas::metadata::Txn;
use crate::areas::pfs::Pfs;
use crate::artifacts::branch::names::{BranchName, RepoName};
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::metadata::repo_info::RepoInfo;
use crate::artifacts::provenance::squash;
use crate::commands::branch::remove_branch;
use crate::errors::{Error, Result};
use std::collections::BTreeSet;
use tracing::info;

/// Size of the finished `master` head, or 0.
fn repo_size(txn: &mut Txn, repo: &RepoName) -> u64 {
    let master = BranchKey::new(repo.clone(), BranchName::default_branch());
    txn.get_branch(&master)
        .and_then(|info| info.head)
        .and_then(|head| txn.get_commit(&head))
        .filter(|commit| commit.is_finished())
        .map_or(0, |commit| commit.size_bytes)
}

/// Remove `repo` with all its branches and commits. Returns the removed
/// commits.
pub(crate) fn remove_repo(txn: &mut Txn, repo: &RepoName, force: bool) -> Result<Vec<CommitKey>> {
    txn.require_repo(repo)?;
    let branches = txn.list_branches(repo);

    if !force {
        let dependents: BTreeSet<BranchKey> = branches
            .iter()
            .flat_map(|info| info.subvenance.iter())
            .filter(|branch| branch.repo != *repo)
            .cloned()
            .collect();
        if let Some(dependent) = dependents.first() {
            return Err(Error::failed_precondition(format!(
                "cannot delete repo {repo}: branch {dependent} depends on it, deleting it would break its provenance"
            )));
        }
    }

    let mut removed = Vec::new();
    for info in branches {
        removed.extend(remove_branch(txn, &info.branch)?);
    }

    let leftovers: BTreeSet<CommitKey> = txn
        .list_commits(repo)
        .into_iter()
        .map(|info| info.commit)
        .collect();
    if !leftovers.is_empty() {
        removed.extend(squash::remove_commits(txn, &leftovers)?);
    }
    txn.delete_repo(repo);

    Ok(removed)
}

impl Pfs {
    /// Create `name`. With `update`, an existing repo keeps its creation
    /// time and gets the new description.
    pub fn create_repo(&self, name: &str, description: &str, update: bool) -> Result<RepoInfo> {
        let name = RepoName::try_parse(name)?;

        let (info, created) = self.metadata().transact(|txn| match txn.get_repo(&name) {
            Some(_) if !update => Err(Error::already_exists(format!("repo {name}"))),
            Some(mut existing) => {
                existing.description = description.to_string();
                txn.put_repo(existing.clone());
                Ok((existing, false))
            }
            None => {
                let info = RepoInfo::new(name.clone(), description);
                txn.put_repo(info.clone());
                Ok((info, true))
            }
        })?;

        if created {
            info!(repo = %name, "created repo");
        }
        Ok(info)
    }

    pub fn inspect_repo(&self, name: &str) -> Result<RepoInfo> {
        let name = RepoName::try_parse(name)?;

        self.metadata().read(|txn| {
            let mut info = txn.require_repo(&name)?;
            info.size_bytes = repo_size(txn, &name);
            Ok(info)
        })
    }

    /// Every repo, newest first.
    pub fn list_repo(&self) -> Result<Vec<RepoInfo>> {
        self.metadata().read(|txn| {
            let mut repos = txn.list_repos();
            repos.reverse();
            for info in &mut repos {
                info.size_bytes = repo_size(txn, &info.name);
            }
            Ok(repos)
        })
    }

    /// Delete `name` and everything in it.
    ///
    /// Fails if a branch of another repo depends on one of its branches,
    /// unless `force` is set; those branches then lose that provenance.
    pub fn delete_repo(&self, name: &str, force: bool) -> Result<()> {
        let name = RepoName::try_parse(name)?;

        let removed = self
            .metadata()
            .transact(|txn| remove_repo(txn, &name, force))?;
        self.storage().forget(&removed)?;

        info!(repo = %name, commits = removed.len(), "deleted repo");
        Ok(())
    }

    /// Delete every repo.
    pub fn delete_all(&self) -> Result<()> {
        let removed = self.metadata().transact(|txn| {
            let mut removed = Vec::new();
            for info in txn.list_repos() {
                removed.extend(remove_repo(txn, &info.name, true)?);
            }
            Ok(removed)
        })?;
        self.storage().forget(&removed)?;

        info!(commits = removed.len(), "deleted all repos");
        Ok(())
    }
}
