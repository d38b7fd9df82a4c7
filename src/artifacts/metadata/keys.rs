use crate::artifacts::branch::names::{BranchName, RepoName};
use crate::artifacts::objects::job_id::JobId;
use crate::errors::Result;
use derive_new::new;

/// `(repo, branch)` identity of a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct BranchKey {
    pub repo: RepoName,
    pub name: BranchName,
}

impl BranchKey {
    pub fn parse(repo: &str, name: &str) -> Result<Self> {
        Ok(BranchKey {
            repo: RepoName::try_parse(repo)?,
            name: BranchName::try_parse(name)?,
        })
    }
}

/// `(repo, branch, id)` identity of a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct CommitKey {
    pub branch: BranchKey,
    pub id: JobId,
}

impl CommitKey {
    pub fn repo(&self) -> &RepoName {
        &self.branch.repo
    }
}

impl std::fmt::Display for BranchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.repo, self.name)
    }
}

impl std::fmt::Display for CommitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.branch, self.id)
    }
}

/// A commit as named by a caller.
///
/// `id` is empty for the branch head, or a job ID, or any expression
/// accepted by [`crate::artifacts::branch::revision::Revision`]. `branch` may
/// be omitted when `id` names a job, in which case the job's first commit in
/// the repo is meant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitRef {
    pub repo: RepoName,
    pub branch: Option<BranchName>,
    pub id: String,
}

impl CommitRef {
    pub fn parse(repo: &str, branch: &str, id: &str) -> Result<Self> {
        let branch = match branch {
            "" => None,
            name => Some(BranchName::try_parse(name)?),
        };
        if branch.is_none() && id.is_empty() {
            return Err(crate::errors::Error::invalid_argument(
                "a commit needs a branch, an ID, or both",
            ));
        }

        Ok(CommitRef {
            repo: RepoName::try_parse(repo)?,
            branch,
            id: id.to_string(),
        })
    }

    /// The head of `branch`.
    pub fn head(branch: &BranchKey) -> Self {
        CommitRef {
            repo: branch.repo.clone(),
            branch: Some(branch.name.clone()),
            id: String::new(),
        }
    }

    /// `id` on `branch`, where `id` may carry ancestry suffixes.
    pub fn on(branch: &BranchKey, id: impl Into<String>) -> Self {
        CommitRef {
            repo: branch.repo.clone(),
            branch: Some(branch.name.clone()),
            id: id.into(),
        }
    }

    pub fn branch_key(&self) -> Option<BranchKey> {
        self.branch
            .as_ref()
            .map(|name| BranchKey::new(self.repo.clone(), name.clone()))
    }
}

impl From<&CommitKey> for CommitRef {
    fn from(commit: &CommitKey) -> Self {
        CommitRef::on(&commit.branch, commit.id.to_string())
    }
}

impl From<CommitKey> for CommitRef {
    fn from(commit: CommitKey) -> Self {
        CommitRef::from(&commit)
    }
}

impl std::fmt::Display for CommitRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.branch {
            Some(branch) => write!(f, "{}@{}", self.repo, branch)?,
            None => write!(f, "{}", self.repo)?,
        }
        if !self.id.is_empty() {
            write!(f, "={}", self.id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    #[test]
    fn keys_render_as_repo_at_branch() {
        let branch = BranchKey::parse("images", "master").unwrap();
        let id = JobId::generate();
        let commit = CommitKey::new(branch.clone(), id.clone());

        assert_eq!(branch.to_string(), "images@master");
        assert_eq!(commit.to_string(), format!("images@master={id}"));
        assert_eq!(CommitRef::from(&commit).to_string(), commit.to_string());
    }

    #[test]
    fn commit_refs_need_a_branch_or_an_id() {
        assert_eq!(
            CommitRef::parse("images", "", "").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );

        let by_id = CommitRef::parse("images", "", "abc").unwrap();
        assert_eq!(by_id.branch_key(), None);
    }
}
