#![allow(dead_code)]

use assert_fs::TempDir;
use pfs::{BranchKey, BranchOptions, CommitRef, Config, Pfs};
use rstest::fixture;
use std::ops::Deref;
use tracing_subscriber::EnvFilter;

/// Route library events to the test output, filtered by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A file system whose chunks live in a temp dir removed on drop.
pub struct Sandbox {
    pub pfs: Pfs,
    pub dir: TempDir,
}

impl Deref for Sandbox {
    type Target = Pfs;

    fn deref(&self) -> &Pfs {
        &self.pfs
    }
}

#[fixture]
pub fn sandbox() -> Sandbox {
    init_tracing();
    let dir = TempDir::new().expect("Failed to create temp dir");
    let pfs = Pfs::open_local(Config::default(), dir.path().join("chunks"))
        .expect("Failed to open pfs");

    Sandbox { pfs, dir }
}

pub fn in_memory() -> Pfs {
    Pfs::in_memory(Config::default()).expect("Failed to open pfs")
}

pub fn master(repo: &str) -> BranchKey {
    BranchKey::parse(repo, "master").expect("valid branch")
}

pub fn head(repo: &str) -> CommitRef {
    CommitRef::head(&master(repo))
}

/// Create `repos` in order, each one's master depending on the previous
/// one's master.
pub fn chain(pfs: &Pfs, repos: &[&str]) -> Result<(), pfs::Error> {
    for (position, repo) in repos.iter().enumerate() {
        pfs.create_repo(repo, "", false)?;
        if position > 0 {
            pfs.create_branch(
                &master(repo),
                None,
                &[master(repos[position - 1])],
                BranchOptions::default(),
            )?;
        }
    }
    Ok(())
}

pub fn read(pfs: &Pfs, commit: &CommitRef, path: &str) -> Result<String, pfs::Error> {
    let content = pfs.get_file(commit, path)?;
    Ok(String::from_utf8_lossy(&content).into_owned())
}

pub fn paths(infos: &[pfs::FileInfo]) -> Vec<String> {
    infos.iter().map(|info| info.path.clone()).collect()
}
