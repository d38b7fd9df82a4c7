//! Job identifier
//!
//! Every commit created by one logical event (an explicit start, a branch
//! head move, a provenance change) carries the same job ID. The ID is also
//! the commit's identity within its branch, so `(repo, branch, id)` names a
//! single commit while `id` alone names the whole job.

use crate::artifacts::objects::JOB_ID_LENGTH;
use fake::rand;

/// `Default` is the empty ID, which sorts before every real one and is never
/// produced by `generate` or accepted by `try_parse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh random ID (32 lowercase hex chars).
    pub fn generate() -> Self {
        JobId(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn try_parse(id: impl Into<String>) -> anyhow::Result<Self> {
        let id = id.into();
        if !Self::looks_like_id(&id) {
            anyhow::bail!("invalid job ID {:?}", id);
        }

        Ok(JobId(id))
    }

    /// Whether `candidate` has the shape of a job ID.
    pub fn looks_like_id(candidate: &str) -> bool {
        candidate.len() == JOB_ID_LENGTH
            && candidate
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
