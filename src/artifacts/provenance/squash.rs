use crate::areas::metadata::Txn;
use crate::artifacts::metadata::keys::CommitKey;
use crate::artifacts::provenance::promote;
use crate::errors::Result;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Remove `doomed` from the commit graph.
///
/// - children are re-parented to the nearest ancestor outside `doomed`
/// - heads pointing into `doomed` fall back to that ancestor when it is on
///   the same branch, and to no head otherwise
/// - provenance links are dropped on both sides, and downstream commits
///   that lost an unfinished upstream are promoted if they became ready
///
/// Returns the removed commits.
pub fn remove_commits(
    txn: &mut Txn,
    doomed: &BTreeSet<CommitKey>,
) -> Result<Vec<CommitKey>> {
    let mut survivors: BTreeMap<CommitKey, Option<CommitKey>> = BTreeMap::new();
    for key in doomed {
        survivors.insert(key.clone(), surviving_ancestor(txn, key, doomed)?);
    }

    let mut revalidate = BTreeSet::new();
    for key in doomed {
        let info = txn.require_commit(key)?;
        let survivor = survivors.get(key).cloned().flatten();

        for child in info.children.iter().filter(|child| !doomed.contains(*child)) {
            if let Some(mut child_info) = txn.get_commit(child) {
                child_info.parent = survivor.clone();
                txn.put_commit(child_info);
            }
        }
        if let Some(survivor) = &survivor
            && let Some(mut ancestor) = txn.get_commit(survivor)
        {
            ancestor.children.remove(key);
            ancestor.children.extend(
                info.children
                    .iter()
                    .filter(|child| !doomed.contains(*child))
                    .cloned(),
            );
            txn.put_commit(ancestor);
        }

        for upstream in info.direct_provenance.iter().filter(|c| !doomed.contains(*c)) {
            if let Some(mut upstream_info) = txn.get_commit(upstream) {
                upstream_info.direct_subvenance.remove(key);
                txn.put_commit(upstream_info);
            }
        }
        for downstream in info.direct_subvenance.iter().filter(|c| !doomed.contains(*c)) {
            if let Some(mut downstream_info) = txn.get_commit(downstream) {
                downstream_info.direct_provenance.remove(key);
                txn.put_commit(downstream_info);
                revalidate.insert(downstream.clone());
            }
        }

        if let Some(mut branch) = txn.get_branch(&key.branch)
            && branch.head.as_ref() == Some(key)
        {
            branch.head = survivor.filter(|survivor| survivor.branch == key.branch);
            txn.put_branch(branch);
        }

        debug!(commit = %key, "removing commit");
        txn.delete_commit(key);
    }

    promote(txn, revalidate);

    Ok(doomed.iter().cloned().collect())
}

fn surviving_ancestor(
    txn: &mut Txn,
    key: &CommitKey,
    doomed: &BTreeSet<CommitKey>,
) -> Result<Option<CommitKey>> {
    let mut current = txn.require_commit(key)?.parent;

    while let Some(parent) = current {
        if !doomed.contains(&parent) {
            return Ok(Some(parent));
        }
        current = txn.get_commit(&parent).and_then(|info| info.parent);
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::areas::metadata::MetadataStore;
    use crate::artifacts::metadata::branch_info::BranchInfo;
    use crate::artifacts::metadata::commit_info::{CommitInfo, CommitOrigin};
    use crate::artifacts::metadata::keys::BranchKey;
    use crate::artifacts::objects::job_id::JobId;
    use pretty_assertions::assert_eq;

    #[test]
    fn siblings_converge_on_the_surviving_grandparent() {
        let store = MetadataStore::new(4);
        let master = BranchKey::parse("repo", "master").unwrap();
        let key = |id: &JobId| CommitKey::new(master.clone(), id.clone());
        let (root, middle, left, right) = (
            JobId::generate(),
            JobId::generate(),
            JobId::generate(),
            JobId::generate(),
        );

        store
            .transact(|txn| {
                let mut root_info = CommitInfo::new(key(&root), CommitOrigin::User, None);
                root_info.children.insert(key(&middle));
                let mut middle_info =
                    CommitInfo::new(key(&middle), CommitOrigin::User, Some(key(&root)));
                middle_info.children.extend([key(&left), key(&right)]);
                txn.put_commit(root_info);
                txn.put_commit(middle_info);
                txn.put_commit(CommitInfo::new(key(&left), CommitOrigin::User, Some(key(&middle))));
                txn.put_commit(CommitInfo::new(key(&right), CommitOrigin::User, Some(key(&middle))));

                let mut branch = BranchInfo::new(master.clone());
                branch.head = Some(key(&right));
                txn.put_branch(branch);
                Ok(())
            })
            .unwrap();

        store
            .transact(|txn| remove_commits(txn, &BTreeSet::from([key(&middle)])))
            .unwrap();

        store
            .read(|txn| {
                assert_eq!(txn.require_commit(&key(&left))?.parent, Some(key(&root)));
                assert_eq!(txn.require_commit(&key(&right))?.parent, Some(key(&root)));
                assert_eq!(
                    txn.require_commit(&key(&root))?.children,
                    BTreeSet::from([key(&left), key(&right)])
                );
                assert!(txn.get_commit(&key(&middle)).is_none());
                Ok(())
            })
            .unwrap();
    }
}
