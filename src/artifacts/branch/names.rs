//! Repo and branch names
//!
//! Both names are restricted to ASCII alphanumerics, `_` and `-`. Branch
//! names additionally may not have the shape of a job ID, otherwise
//! `inspect_commit(repo, "", <id>)` would be ambiguous.

use crate::artifacts::branch::VALID_NAME_REGEX;
use crate::artifacts::objects::job_id::JobId;
use crate::errors::{Error, Result};

fn is_valid_name(name: &str) -> Result<bool> {
    let re = regex::Regex::new(VALID_NAME_REGEX)
        .map_err(|err| Error::internal(format!("invalid name regex {VALID_NAME_REGEX}: {err}")))?;

    Ok(re.is_match(name))
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct RepoName(String);

impl RepoName {
    pub fn try_parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_name(&name)? {
            return Err(Error::invalid_argument(format!(
                "repo name ({name}) invalid: only alphanumeric characters, underscores, and dashes are allowed"
            )));
        }

        Ok(Self(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BranchName(String);

impl BranchName {
    pub fn try_parse(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !is_valid_name(&name)? {
            return Err(Error::invalid_argument(format!(
                "branch name ({name}) invalid: only alphanumeric characters, underscores, and dashes are allowed"
            )));
        }
        if JobId::looks_like_id(&name) {
            return Err(Error::invalid_argument(format!(
                "branch name ({name}) cannot have the same format as a commit ID"
            )));
        }

        Ok(Self(name))
    }

    pub fn default_branch() -> Self {
        Self("master".to_string())
    }

    pub fn is_default_branch(&self) -> bool {
        self.0 == "master"
    }
}

impl AsRef<str> for RepoName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for BranchName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepoName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for BranchName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
