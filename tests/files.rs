use common::{Sandbox, head, master, paths, read, sandbox};
use fake::Fake;
use fake::faker::lorem::en::{Word, Words};
use pfs::{
    BranchKey, CommitRef, Config, ErrorKind, FileBatch, FileType, Pfs, PutFileOptions,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;
use std::collections::BTreeMap;

mod common;

fn small_chunks() -> Pfs {
    let config = Config {
        chunk_size: 4,
        compaction_max_fan_in: 2,
        ..Config::default()
    };
    Pfs::in_memory(config).expect("Failed to open pfs")
}

fn files_only(pfs: &Pfs, commit: &CommitRef) -> Result<Vec<String>, pfs::Error> {
    Ok(pfs
        .walk_file(commit, "/")?
        .into_iter()
        .filter(|info| !info.is_dir())
        .map(|info| info.path)
        .collect())
}

#[rstest]
fn globs_match_within_one_directory(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let batch = ["dir1/file1.1", "dir1/file1.2", "dir2/file2.1"]
        .into_iter()
        .fold(FileBatch::new(), |batch, path| {
            batch.put(path, Words(3..6).fake::<Vec<String>>().join(" "), PutFileOptions::default())
        });
    sandbox.modify_file(&head("repo"), batch)?;

    let matched = sandbox.glob_file(&head("repo"), "dir1/*")?;
    assert_eq!(paths(&matched), vec!["/dir1/file1.1", "/dir1/file1.2"]);

    let everything = sandbox.glob_file(&head("repo"), "/**")?;
    assert_eq!(
        paths(&everything),
        vec![
            "/dir1/",
            "/dir1/file1.1",
            "/dir1/file1.2",
            "/dir2/",
            "/dir2/file2.1"
        ]
    );

    let err = sandbox.glob_file(&head("repo"), "/[dir").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);

    Ok(())
}

#[rstest]
#[case::delete_then_put(true, Some("b"))]
#[case::put_then_delete(false, None)]
fn deletes_apply_in_write_order(
    sandbox: Sandbox,
    #[case] put_last: bool,
    #[case] expected: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.start_commit(&master("repo"), None, "")?;

    sandbox.put_file(&head("repo"), "/f", "a", PutFileOptions::default())?;
    if put_last {
        sandbox.delete_file(&head("repo"), "/")?;
        sandbox.put_file(&head("repo"), "/f", "b", PutFileOptions::default())?;
    } else {
        sandbox.put_file(&head("repo"), "/f", "b", PutFileOptions::default())?;
        sandbox.delete_file(&head("repo"), "/")?;
    }

    let check = || -> Result<(), pfs::Error> {
        match expected {
            Some(content) => assert_eq!(read(&sandbox, &head("repo"), "/f")?, content),
            None => assert_eq!(
                sandbox.get_file(&head("repo"), "/f").unwrap_err().kind(),
                ErrorKind::NotFound
            ),
        }
        Ok(())
    };
    check()?;
    sandbox.finish_commit(&head("repo"), None)?;
    check()?;

    Ok(())
}

#[rstest]
fn one_batch_applies_in_order(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.put_file(&head("repo"), "/keep", "k", PutFileOptions::default())?;

    sandbox.modify_file(
        &head("repo"),
        FileBatch::new()
            .put("/f", "a", PutFileOptions::default())
            .delete("/")
            .put("/f", "b", PutFileOptions::default()),
    )?;

    assert_eq!(files_only(&sandbox, &head("repo"))?, vec!["/f"]);
    assert_eq!(read(&sandbox, &head("repo"), "/f")?, "b");

    Ok(())
}

#[rstest]
fn open_commits_read_through_to_their_parent(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.put_file(&head("repo"), "/old", "1", PutFileOptions::default())?;
    sandbox.put_file(&head("repo"), "/gone", "2", PutFileOptions::default())?;

    sandbox.start_commit(&master("repo"), None, "")?;
    sandbox.put_file(&head("repo"), "/new", "3", PutFileOptions::default())?;
    sandbox.delete_file(&head("repo"), "/gone")?;

    assert_eq!(files_only(&sandbox, &head("repo"))?, vec!["/new", "/old"]);
    assert_eq!(
        files_only(&sandbox, &CommitRef::on(&master("repo"), "master^"))?,
        vec!["/gone", "/old"]
    );

    Ok(())
}

#[rstest]
fn tags_of_one_file_coexist_in_tag_order(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.start_commit(&master("repo"), None, "")?;

    sandbox.put_file(&head("repo"), "/f", "second", PutFileOptions::tagged("b"))?;
    sandbox.put_file(&head("repo"), "/f", "first", PutFileOptions::tagged("a"))?;
    sandbox.put_file(&head("repo"), "/f", "SECOND", PutFileOptions::tagged("b"))?;

    let info = sandbox.inspect_file(&head("repo"), "/f")?;
    assert_eq!(info.tags, vec!["a", "b"]);
    assert_eq!(info.size_bytes, 11);
    assert_eq!(read(&sandbox, &head("repo"), "/f")?, "firstSECOND");

    Ok(())
}

#[rstest]
fn appends_extend_the_content(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let word: String = Word().fake();

    sandbox.put_file(&head("repo"), "/log", word.clone(), PutFileOptions::default())?;
    sandbox.put_file(&head("repo"), "/log", "-tail", PutFileOptions::append())?;

    assert_eq!(read(&sandbox, &head("repo"), "/log")?, format!("{word}-tail"));
    assert_eq!(sandbox.list_commit("repo", None, None, 0, false)?.len(), 2);

    Ok(())
}

#[test]
fn ranged_reads_cross_chunk_boundaries() -> Result<(), Box<dyn std::error::Error>> {
    let pfs = small_chunks();
    pfs.create_repo("repo", "", false)?;
    pfs.put_file(&head("repo"), "/f", "0123456789", PutFileOptions::default())?;

    assert_eq!(&pfs.get_file_range(&head("repo"), "/f", 3, Some(4))?[..], b"3456");
    assert_eq!(&pfs.get_file_range(&head("repo"), "/f", 8, None)?[..], b"89");
    assert!(pfs.get_file_range(&head("repo"), "/f", 20, Some(2))?.is_empty());

    Ok(())
}

#[rstest]
fn directories_are_synthesized(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    sandbox.modify_file(
        &head("repo"),
        FileBatch::new()
            .put("/a/b/c", "123", PutFileOptions::default())
            .put("/a/d", "45", PutFileOptions::default())
            .put("/e", "6", PutFileOptions::default()),
    )?;

    let dir = sandbox.inspect_file(&head("repo"), "/a")?;
    assert_eq!(dir.path, "/a/");
    assert_eq!(dir.file_type, FileType::Dir);
    assert_eq!(dir.size_bytes, 5);

    assert_eq!(paths(&sandbox.list_file(&head("repo"), "/")?), vec!["/a/", "/e"]);
    assert_eq!(paths(&sandbox.list_file(&head("repo"), "/a")?), vec!["/a/b/", "/a/d"]);
    assert_eq!(
        paths(&sandbox.walk_file(&head("repo"), "/a")?),
        vec!["/a/", "/a/b/", "/a/b/c", "/a/d"]
    );
    assert_eq!(
        sandbox.inspect_file(&head("repo"), "/missing").unwrap_err().kind(),
        ErrorKind::NotFound
    );

    Ok(())
}

#[rstest]
fn diffs_compare_with_the_parent_by_default(
    sandbox: Sandbox,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let first = sandbox.modify_file(
        &head("repo"),
        FileBatch::new()
            .put("/a", "1", PutFileOptions::default())
            .put("/dir/b", "2", PutFileOptions::default()),
    )?;
    sandbox.modify_file(
        &head("repo"),
        FileBatch::new()
            .put("/dir/b", "22", PutFileOptions::default())
            .put("/c", "3", PutFileOptions::default()),
    )?;

    let diff = sandbox.diff_file(&head("repo"), None, "/")?;
    assert_eq!(paths(&diff.new_files), vec!["/c", "/dir/", "/dir/b"]);
    assert_eq!(paths(&diff.old_files), vec!["/dir/", "/dir/b"]);

    let explicit = sandbox.diff_file(&head("repo"), Some(&CommitRef::from(&first)), "/")?;
    assert_eq!(explicit, diff);

    let initial = sandbox.diff_file(&CommitRef::from(&first), None, "/")?;
    assert_eq!(paths(&initial.new_files), vec!["/a", "/dir/", "/dir/b"]);
    assert!(initial.old_files.is_empty());

    Ok(())
}

#[rstest]
fn copies_share_content_across_repos(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("src", "", false)?;
    sandbox.create_repo("dst", "", false)?;
    sandbox.modify_file(
        &head("src"),
        FileBatch::new()
            .put("/data/x", "x", PutFileOptions::default())
            .put("/data/sub/y", "y", PutFileOptions::default()),
    )?;

    sandbox.copy_file(&head("src"), "/data", &head("dst"), "/copy", false)?;

    assert_eq!(files_only(&sandbox, &head("dst"))?, vec!["/copy/sub/y", "/copy/x"]);
    assert_eq!(read(&sandbox, &head("dst"), "/copy/sub/y")?, "y");
    assert_eq!(
        sandbox.inspect_file(&head("dst"), "/copy/x")?.data,
        sandbox.inspect_file(&head("src"), "/data/x")?.data
    );

    let err = sandbox
        .copy_file(&head("src"), "/nothing", &head("dst"), "/copy", false)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    Ok(())
}

#[rstest]
#[case::parent_component("../etc/passwd")]
#[case::nested_parent("/a/../b")]
#[case::control_character("/bad\nname")]
fn unsafe_paths_are_rejected(
    sandbox: Sandbox,
    #[case] path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;

    let err = sandbox
        .put_file(&head("repo"), path, "x", PutFileOptions::default())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(sandbox.list_commit("repo", None, None, 0, false)?.is_empty());
    Ok(())
}

#[rstest]
fn finished_commits_reject_writes(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let written = sandbox.put_file(&head("repo"), "/f", "x", PutFileOptions::default())?;

    let err = sandbox
        .put_file(&CommitRef::from(&written), "/g", "y", PutFileOptions::default())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::FailedPrecondition);
    Ok(())
}

#[rstest]
fn writes_to_a_new_branch_create_it(sandbox: Sandbox) -> Result<(), Box<dyn std::error::Error>> {
    sandbox.create_repo("repo", "", false)?;
    let feature = BranchKey::parse("repo", "feature")?;

    let written = sandbox.put_file(&CommitRef::head(&feature), "/f", "x", PutFileOptions::default())?;

    let branch = sandbox.inspect_branch(&feature)?;
    assert_eq!(branch.head, Some(written));
    assert_eq!(read(&sandbox, &CommitRef::head(&feature), "/f")?, "x");
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Put(&'static str, String),
    Delete(&'static str),
}

fn op() -> impl Strategy<Value = Op> {
    let files = prop::sample::select(vec!["/a", "/b", "/d/a", "/d/b", "/d/e/f"]);
    let targets = prop::sample::select(vec!["/a", "/d", "/d/e", "/"]);
    prop_oneof![
        3 => (files, "[a-z]{1,6}").prop_map(|(path, content)| Op::Put(path, content)),
        1 => targets.prop_map(Op::Delete),
    ]
}

fn apply(model: &mut BTreeMap<String, String>, op: &Op) {
    match op {
        Op::Put(path, content) => {
            model.insert(path.to_string(), content.clone());
        }
        Op::Delete(target) => {
            let dir = if *target == "/" { "/".to_string() } else { format!("{target}/") };
            model.retain(|path, _| path != target && !path.starts_with(&dir));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn layered_writes_match_a_sequential_model(ops in prop::collection::vec(op(), 1..16)) {
        let pfs = small_chunks();
        pfs.create_repo("repo", "", false).unwrap();
        pfs.put_file(&head("repo"), "/d/b", "base", PutFileOptions::default()).unwrap();
        pfs.start_commit(&master("repo"), None, "").unwrap();

        let mut model = BTreeMap::from([("/d/b".to_string(), "base".to_string())]);
        for op in &ops {
            match op {
                Op::Put(path, content) => {
                    pfs.put_file(&head("repo"), path, content.clone(), PutFileOptions::default()).unwrap();
                }
                Op::Delete(target) => {
                    pfs.delete_file(&head("repo"), target).unwrap();
                }
            }
            apply(&mut model, op);
        }

        for finished in [false, true] {
            if finished {
                pfs.finish_commit(&head("repo"), None).unwrap();
            }
            let listed = files_only(&pfs, &head("repo")).unwrap();
            prop_assert_eq!(listed, model.keys().cloned().collect::<Vec<_>>());
            for (path, content) in &model {
                prop_assert_eq!(&read(&pfs, &head("repo"), path).unwrap(), content);
            }
        }
    }
}
