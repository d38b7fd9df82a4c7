use common::{Sandbox, master, sandbox};
use pfs::{BranchKey, BranchOptions, CommitKey, CommitRef, ErrorKind, Pfs, PutFileOptions, Trigger};
use pretty_assertions::assert_eq;
use rstest::rstest;

mod common;

fn branch(name: &str) -> BranchKey {
    BranchKey::parse("repo", name).expect("valid branch")
}

fn triggered(trigger: Trigger) -> BranchOptions {
    BranchOptions {
        trigger: Some(trigger),
        ..BranchOptions::default()
    }
}

/// Commit a new file of `size` bytes to `name`.
fn grow(pfs: &Pfs, name: &str, size: usize) -> Result<CommitKey, pfs::Error> {
    let path = format!("/file-{}", pfs.list_commit("repo", None, None, 0, false)?.len());
    pfs.put_file(
        &CommitRef::head(&branch(name)),
        &path,
        "x".repeat(size),
        PutFileOptions::default(),
    )
}

fn head_of(pfs: &Pfs, name: &str) -> Result<Option<CommitKey>, pfs::Error> {
    Ok(pfs.inspect_branch(&branch(name))?.head)
}

/// Whether branch `name` sits on the job of `commit`.
fn follows(pfs: &Pfs, name: &str, commit: &CommitKey) -> Result<bool, pfs::Error> {
    Ok(head_of(pfs, name)?.is_some_and(|head| head.id == commit.id))
}

#[rstest]
fn a_size_trigger_moves_the_branch(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let options = triggered(Trigger::on("staging").size("1B"));
    sandbox.create_branch(&master("repo"), None, &[], options)?;

    let written = grow(&sandbox, "staging", 5)?;

    assert!(follows(&sandbox, "master", &written)?);
    let moved = sandbox.inspect_commit(&CommitRef::head(&master("repo")))?;
    assert_eq!(moved.origin, pfs::CommitOrigin::Alias);
    assert_eq!(
        common::read(&sandbox, &CommitRef::head(&master("repo")), "/file-0")?,
        "xxxxx"
    );

    Ok(())
}

#[rstest]
fn a_count_trigger_fires_every_n_commits(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let options = triggered(Trigger::on("staging").commits(2));
    sandbox.create_branch(&master("repo"), None, &[], options)?;

    let first = grow(&sandbox, "staging", 1)?;
    assert_eq!(head_of(&sandbox, "master")?, None);
    let second = grow(&sandbox, "staging", 1)?;
    assert!(follows(&sandbox, "master", &second)?);
    grow(&sandbox, "staging", 1)?;
    assert!(follows(&sandbox, "master", &second)?);
    let fourth = grow(&sandbox, "staging", 1)?;
    assert!(follows(&sandbox, "master", &fourth)?);
    assert!(!follows(&sandbox, "master", &first)?);

    Ok(())
}

#[rstest]
#[case(false, [false, true, false, false, true])]
#[case(true, [false, true, false, true, false])]
fn size_and_count_conditions_combine(
    sandbox: Sandbox,
    #[case] all: bool,
    #[case] fired: [bool; 5],
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let mut trigger = Trigger::on("staging").size("100");
    trigger.commits = if all { 2 } else { 3 };
    trigger.all = all;
    sandbox.create_branch(&master("repo"), None, &[], triggered(trigger))?;

    let sizes = if all {
        [150, 10, 200, 10, 10]
    } else {
        [50, 60, 10, 10, 10]
    };
    for (size, fired) in sizes.into_iter().zip(fired) {
        let written = grow(&sandbox, "staging", size)?;
        assert_eq!(follows(&sandbox, "master", &written)?, fired, "after {size} bytes");
    }

    Ok(())
}

#[rstest]
fn triggers_cascade_along_a_chain(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.create_branch(&branch("b"), None, &[], triggered(Trigger::on("a")))?;
    let options = triggered(Trigger::on("b").commits(2));
    sandbox.create_branch(&branch("c"), None, &[], options)?;

    let first = grow(&sandbox, "a", 1)?;
    assert!(follows(&sandbox, "b", &first)?);
    assert_eq!(head_of(&sandbox, "c")?, None);

    let second = grow(&sandbox, "a", 1)?;
    assert!(follows(&sandbox, "b", &second)?);
    assert!(follows(&sandbox, "c", &second)?);

    let third = grow(&sandbox, "a", 1)?;
    assert!(follows(&sandbox, "b", &third)?);
    assert!(follows(&sandbox, "c", &second)?);

    Ok(())
}

#[rstest]
fn moving_a_branch_by_hand_fires_its_triggers(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.create_branch(&branch("c"), None, &[], triggered(Trigger::on("b")))?;

    let first = grow(&sandbox, "master", 1)?;
    let tip = CommitRef::head(&master("repo"));
    sandbox.create_branch(&branch("b"), Some(&tip), &[], BranchOptions::default())?;
    assert!(follows(&sandbox, "c", &first)?);

    let second = grow(&sandbox, "master", 1)?;
    assert!(follows(&sandbox, "c", &first)?);
    sandbox.create_branch(&branch("b"), Some(&tip), &[], BranchOptions::update())?;
    assert!(follows(&sandbox, "c", &second)?);

    Ok(())
}

#[rstest]
fn a_triggered_branch_feeds_its_subvenance(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.create_repo("out", "", false)?;
    let options = triggered(Trigger::on("master").size("1K"));
    sandbox.create_branch(&branch("trigger"), None, &[], options)?;
    let upstream = [branch("trigger")];
    sandbox.create_branch(&master("out"), None, &upstream, BranchOptions::default())?;

    grow(&sandbox, "master", 500)?;
    assert!(sandbox.list_commit("out", None, None, 0, false)?.is_empty());

    let written = grow(&sandbox, "master", 600)?;
    let downstream = sandbox.list_commit("out", None, None, 0, false)?;
    assert_eq!(downstream.len(), 1);
    assert_eq!(downstream[0].commit.id, written.id);

    Ok(())
}

#[rstest]
fn a_cron_trigger_waits_for_the_next_scheduled_time(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let options = triggered(Trigger::on("staging").cron("0 0 1 1 *"));
    sandbox.create_branch(&master("repo"), None, &[], options)?;

    let first = grow(&sandbox, "staging", 1)?;
    assert!(follows(&sandbox, "master", &first)?);

    grow(&sandbox, "staging", 1)?;
    assert!(follows(&sandbox, "master", &first)?);

    Ok(())
}

#[rstest]
#[case(Trigger::on(""))]
#[case(Trigger::on("master"))]
#[case(Trigger::on("staging").size("this is not a size"))]
#[case(Trigger::on("staging").cron("this is not a cron spec"))]
fn unusable_triggers_are_rejected(
    sandbox: Sandbox,
    #[case] trigger: Trigger,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;

    let err = sandbox
        .create_branch(&master("repo"), None, &[], triggered(trigger))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(sandbox.list_branch("repo")?.is_empty());
    Ok(())
}

#[rstest]
fn triggers_cannot_loop(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.create_branch(&branch("b"), None, &[], triggered(Trigger::on("a")))?;
    sandbox.create_branch(&branch("c"), None, &[], triggered(Trigger::on("b")))?;

    let err = sandbox
        .create_branch(&branch("a"), None, &[], triggered(Trigger::on("c")))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("loop"));
    Ok(())
}

#[rstest]
fn triggers_exclude_provenance(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.create_repo("in", "", false)?;

    let err = sandbox
        .create_branch(
            &master("repo"),
            None,
            &[master("in")],
            triggered(Trigger::on("staging")),
        )
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.to_string().contains("provenance"));
    Ok(())
}
