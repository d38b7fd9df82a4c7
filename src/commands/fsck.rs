use crate::areas::pfs::Pfs;
use crate::artifacts::metadata::branch_info::BranchInfo;
use crate::artifacts::provenance::fsck::{self, Finding};
use crate::errors::Result;
use tracing::info;

impl Pfs {
    /// Check the derived provenance fields and commit links against the
    /// direct edges they are computed from.
    ///
    /// With `fix`, the derived fields are rebuilt. The findings returned are
    /// always the ones seen before repairing.
    pub fn fsck(&self, fix: bool) -> Result<Vec<Finding>> {
        let findings = if fix {
            self.metadata().transact(|txn| Ok(fsck::repair(txn)))?
        } else {
            self.metadata().read(|txn| Ok(fsck::check(txn)))?
        };

        info!(findings = findings.len(), fix, "checked metadata");
        Ok(findings)
    }

    /// Store `info` as given, leaving every other row untouched. Derived
    /// fields are not recomputed, which is what `fsck` is there to catch.
    #[doc(hidden)]
    pub fn write_branch_unchecked(&self, info: BranchInfo) -> Result<()> {
        self.metadata().transact(|txn| {
            txn.require_branch(&info.branch)?;
            txn.put_branch(info.clone());
            Ok(())
        })
    }

    /// Delete chunks no commit references any more. Returns how many were
    /// deleted.
    pub fn garbage_collect(&self) -> Result<usize> {
        self.storage().garbage_collect(|| {
            self.metadata().read(|txn| {
                Ok(txn
                    .list_all_commits()
                    .into_iter()
                    .filter_map(|commit| commit.fileset)
                    .collect())
            })
        })
    }
}
