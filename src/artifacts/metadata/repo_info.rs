use crate::artifacts::branch::names::RepoName;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoInfo {
    pub name: RepoName,
    pub description: String,
    pub created: DateTime<Utc>,
    /// Size of the finished `master` head; filled in when the repo is inspected
    pub size_bytes: u64,
}

impl RepoInfo {
    pub fn new(name: RepoName, description: impl Into<String>) -> Self {
        RepoInfo {
            name,
            description: description.into(),
            created: Utc::now(),
            size_bytes: 0,
        }
    }
}
