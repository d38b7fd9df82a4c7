use common::{Sandbox, chain, head, master, read, sandbox};
use pfs::{CommitRef, ErrorKind, JobInfo, PutFileOptions};
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::collections::BTreeSet;

mod common;

fn history(pfs: &pfs::Pfs, versions: usize) -> Result<Vec<pfs::CommitKey>, pfs::Error> {
    pfs.create_repo("repo", "", false)?;
    (0..versions)
        .map(|n| pfs.put_file(&head("repo"), "/file", format!("v{n}"), PutFileOptions::default()))
        .collect()
}

#[rstest]
fn children_are_relinked_to_the_surviving_ancestor(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    let commits = history(&sandbox, 3)?;

    sandbox.squash_job(&commits[1].id.to_string())?;

    let child = sandbox.inspect_commit(&CommitRef::from(&commits[2]))?;
    assert_eq!(child.parent, Some(commits[0].clone()));
    let root = sandbox.inspect_commit(&CommitRef::from(&commits[0]))?;
    assert_eq!(root.children, BTreeSet::from([commits[2].clone()]));
    assert_eq!(read(&sandbox, &head("repo"), "/file")?, "v2");

    let err = sandbox
        .inspect_commit(&CommitRef::from(&commits[1]))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(sandbox.fsck(false)?.is_empty());

    Ok(())
}

#[rstest]
fn siblings_stay_siblings(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    let commits = history(&sandbox, 2)?;
    let first = sandbox.start_commit(&master("repo"), Some(&CommitRef::from(&commits[1])), "")?;
    sandbox.finish_commit(&CommitRef::from(&first.commit), None)?;
    let second = sandbox.start_commit(&master("repo"), Some(&CommitRef::from(&commits[1])), "")?;

    sandbox.squash_job(&commits[1].id.to_string())?;

    for survivor in [&first.commit, &second.commit] {
        let info = sandbox.inspect_commit(&CommitRef::from(survivor))?;
        assert_eq!(info.parent, Some(commits[0].clone()));
    }
    let root = sandbox.inspect_commit(&CommitRef::from(&commits[0]))?;
    assert_eq!(
        root.children,
        BTreeSet::from([first.commit.clone(), second.commit.clone()])
    );

    Ok(())
}

#[rstest]
fn squashing_the_head_moves_the_branch_back(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    let commits = history(&sandbox, 2)?;

    sandbox.squash_job(&commits[1].id.to_string())?;
    assert_eq!(sandbox.inspect_branch(&master("repo"))?.head, Some(commits[0].clone()));
    assert_eq!(read(&sandbox, &head("repo"), "/file")?, "v0");

    sandbox.squash_job(&commits[0].id.to_string())?;
    let branch = sandbox.inspect_branch(&master("repo"))?;
    assert_eq!(branch.head, None);
    assert!(sandbox.list_commit("repo", None, None, 0, false)?.is_empty());

    Ok(())
}

#[rstest]
fn a_job_is_squashed_on_every_branch(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    chain(&sandbox, &["in", "out"])?;
    let first = sandbox.put_file(&head("in"), "/file", "a", PutFileOptions::default())?;
    sandbox.finish_commit(&head("out"), None)?;
    let second = sandbox.put_file(&head("in"), "/file", "b", PutFileOptions::default())?;

    sandbox.squash_job(&second.id.to_string())?;

    assert_eq!(sandbox.inspect_commit(&head("in"))?.commit.id, first.id);
    assert_eq!(sandbox.inspect_commit(&head("out"))?.commit.id, first.id);
    let jobs: Vec<String> = sandbox
        .list_job()?
        .into_iter()
        .map(|JobInfo { id, .. }| id.to_string())
        .collect();
    assert_eq!(jobs, vec![first.id.to_string()]);
    assert!(sandbox.fsck(false)?.is_empty());

    Ok(())
}

#[rstest]
#[case::unknown_job("0123456789abcdef0123456789abcdef", ErrorKind::NotFound)]
#[case::malformed_job("not-a-job", ErrorKind::InvalidArgument)]
fn squashing_an_unknown_job_fails(
    sandbox: Sandbox,
    #[case] id: &str,
    #[case] kind: ErrorKind,
) -> Result<(), Box<dyn std::error::Error>> {
    history(&sandbox, 1)?;

    assert_eq!(sandbox.squash_job(id).unwrap_err().kind(), kind);
    assert_eq!(sandbox.list_commit("repo", None, None, 0, false)?.len(), 1);

    Ok(())
}

#[rstest]
fn garbage_collection_keeps_what_commits_reference(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    let commits = history(&sandbox, 3)?;
    sandbox.squash_job(&commits[1].id.to_string())?;

    let swept = sandbox.garbage_collect()?;

    assert!(swept > 0);
    assert_eq!(read(&sandbox, &CommitRef::from(&commits[0]), "/file")?, "v0");
    assert_eq!(read(&sandbox, &head("repo"), "/file")?, "v2");
    assert_eq!(sandbox.garbage_collect()?, 0);

    Ok(())
}
