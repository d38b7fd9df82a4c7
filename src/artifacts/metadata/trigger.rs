//! Branch triggers
//!
//! A branch with a trigger follows another branch of the same repo: when the
//! followed branch's head is finished and the trigger's conditions hold, the
//! triggered branch moves to that head. With no conditions it moves on every
//! finished head.

use crate::artifacts::metadata::commit_info::CommitInfo;
use crate::errors::{Error, Result};
use bytesize::ByteSize;
use chrono::{DateTime, Utc};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Trigger {
    /// Followed branch, in the triggered branch's repo
    pub branch: String,
    /// Minimum growth since the current head, e.g. `"1K"` or `"100"`
    pub size: Option<String>,
    /// Five or six field cron schedule
    pub cron: Option<String>,
    /// Number of new commits on the followed branch; zero means unset
    pub commits: u64,
    /// Require every condition instead of any one of them
    pub all: bool,
}

impl Trigger {
    pub fn on(branch: impl Into<String>) -> Self {
        Trigger {
            branch: branch.into(),
            ..Trigger::default()
        }
    }

    pub fn size(mut self, size: impl Into<String>) -> Self {
        self.size = Some(size.into());
        self
    }

    pub fn cron(mut self, cron: impl Into<String>) -> Self {
        self.cron = Some(cron.into());
        self
    }

    pub fn commits(mut self, commits: u64) -> Self {
        self.commits = commits;
        self
    }

    pub fn all(mut self) -> Self {
        self.all = true;
        self
    }

    /// Reject conditions that can never be evaluated.
    pub fn validate(&self) -> Result<()> {
        if self.branch.is_empty() {
            return Err(Error::invalid_argument("trigger must name a branch"));
        }
        self.size_bytes()?;
        self.schedule()?;
        Ok(())
    }

    fn size_bytes(&self) -> Result<Option<u64>> {
        self.size
            .as_deref()
            .map(|size| {
                ByteSize::from_str(size).map(|size| size.as_u64()).map_err(|err| {
                    Error::invalid_argument(format!("trigger size {size:?} invalid: {err}"))
                })
            })
            .transpose()
    }

    fn schedule(&self) -> Result<Option<cron::Schedule>> {
        self.cron
            .as_deref()
            .map(|spec| {
                let fields = spec.split_whitespace().count();
                let full = if fields == 5 {
                    format!("0 {spec}")
                } else {
                    spec.to_string()
                };
                cron::Schedule::from_str(&full).map_err(|err| {
                    Error::invalid_argument(format!("trigger cron {spec:?} invalid: {err}"))
                })
            })
            .transpose()
    }

    /// Whether the triggered branch should move from `old` to `new`.
    ///
    /// `commits` is the number of commits from `new` back to `old`, counted
    /// up to `self.commits`.
    pub fn fires(&self, old: Option<&CommitInfo>, new: &CommitInfo, commits: u64) -> Result<bool> {
        let mut conditions = Vec::new();

        if let Some(size) = self.size_bytes()? {
            let old_size = old.map_or(0, |old| old.size_bytes);
            conditions.push(new.size_bytes.saturating_sub(old_size) >= size);
        }
        if let Some(schedule) = self.schedule()? {
            let since = old
                .and_then(|old| old.finished)
                .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
            let now = new.finished.unwrap_or_else(Utc::now);
            conditions.push(schedule.after(&since).next().is_some_and(|next| next <= now));
        }
        if self.commits > 0 {
            conditions.push(commits >= self.commits);
        }

        Ok(match (conditions.is_empty(), self.all) {
            (true, _) => true,
            (false, true) => conditions.iter().all(|&met| met),
            (false, false) => conditions.iter().any(|&met| met),
        })
    }
}
