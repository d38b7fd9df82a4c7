//! Rows kept by the metadata store
//!
//! - `keys`: branch and commit identities
//! - `repo_info`, `branch_info`, `commit_info`: the three row types
//! - `trigger`: conditions under which a branch follows another
//! - `JobInfo`: a read-only view over every commit sharing one job ID

pub mod branch_info;
pub mod commit_info;
pub mod keys;
pub mod repo_info;
pub mod trigger;

use crate::artifacts::metadata::commit_info::CommitInfo;
use crate::artifacts::objects::job_id::JobId;

/// Every commit created by one job, in topological order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub id: JobId,
    pub commits: Vec<CommitInfo>,
}
