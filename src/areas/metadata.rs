//! Transactional metadata store
//!
//! Holds the repo, branch and commit rows behind a single optimistic
//! concurrency scheme:
//!
//! - a transaction runs against an immutable snapshot of all tables
//! - every row it reads is remembered with the revision that last touched it
//! - every table scope it lists is remembered the same way
//! - on commit, those revisions are compared with the live tables; any
//!   mismatch aborts the attempt and the closure is run again
//!
//! Writes are buffered inside the transaction and applied atomically, so a
//! failed validation or a returned error leaves no trace. Every committed
//! revision is broadcast on a `watch` channel, which blocking readers use to
//! wake up.
//!
//! Rows carry a creation sequence number; listings are returned in that
//! order (oldest first) and callers reverse them for newest-first views.

use crate::artifacts::branch::names::{BranchName, RepoName};
use crate::artifacts::metadata::branch_info::BranchInfo;
use crate::artifacts::metadata::commit_info::CommitInfo;
use crate::artifacts::metadata::keys::{BranchKey, CommitKey};
use crate::artifacts::metadata::repo_info::RepoInfo;
use crate::artifacts::objects::job_id::JobId;
use crate::errors::{Error, Result};
use fake::rand;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum RowKey {
    Repo(RepoName),
    Branch(BranchKey),
    Commit(CommitKey),
}

#[derive(Debug, Clone)]
enum Row {
    Repo(RepoInfo),
    Branch(BranchInfo),
    Commit(CommitInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Scope {
    Repos,
    Branches(RepoName),
    Commits(RepoName),
}

impl RowKey {
    fn scope(&self) -> Scope {
        match self {
            RowKey::Repo(_) => Scope::Repos,
            RowKey::Branch(branch) => Scope::Branches(branch.repo.clone()),
            RowKey::Commit(commit) => Scope::Commits(commit.repo().clone()),
        }
    }
}

impl Scope {
    fn lower_bound(&self) -> RowKey {
        match self {
            Scope::Repos => RowKey::Repo(RepoName::default()),
            Scope::Branches(repo) => {
                RowKey::Branch(BranchKey::new(repo.clone(), BranchName::default()))
            }
            Scope::Commits(repo) => RowKey::Commit(CommitKey::new(
                BranchKey::new(repo.clone(), BranchName::default()),
                JobId::default(),
            )),
        }
    }

    fn contains(&self, key: &RowKey) -> bool {
        key.scope() == *self
    }
}

#[derive(Debug, Clone)]
struct Stored {
    seq: u64,
    row: Row,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    rows: BTreeMap<RowKey, Stored>,
    /// Revision that last wrote each key, kept after deletion
    versions: HashMap<RowKey, u64>,
    /// Revision that last inserted into or deleted from each scope
    scopes: HashMap<Scope, u64>,
    next_seq: u64,
    revision: u64,
}

impl Tables {
    fn version(&self, key: &RowKey) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn scope_version(&self, scope: &Scope) -> u64 {
        self.scopes.get(scope).copied().unwrap_or(0)
    }
}

/// Raised internally when validation finds a concurrent write.
#[derive(Debug)]
struct Conflict;

#[derive(Debug)]
pub struct MetadataStore {
    tables: Mutex<Arc<Tables>>,
    max_attempts: usize,
    revisions: watch::Sender<u64>,
}

impl MetadataStore {
    pub fn new(max_attempts: usize) -> Self {
        let (revisions, _) = watch::channel(0);

        MetadataStore {
            tables: Mutex::new(Arc::new(Tables::default())),
            max_attempts: max_attempts.max(1),
            revisions,
        }
    }

    /// Run `f` inside a serializable transaction, retrying on conflicts.
    ///
    /// Errors returned by `f` abort the transaction and are passed through
    /// unchanged; only conflicts are retried.
    pub fn transact<T>(&self, mut f: impl FnMut(&mut Txn) -> Result<T>) -> Result<T> {
        for attempt in 1..=self.max_attempts {
            let mut txn = self.begin()?;
            let value = f(&mut txn)?;

            match self.commit(txn)? {
                Ok(()) => return Ok(value),
                Err(Conflict) => {
                    debug!(attempt, "metadata transaction conflicted, retrying");
                    Self::backoff(attempt);
                }
            }
        }

        Err(Error::internal(format!(
            "metadata transaction aborted after {} conflicting attempts",
            self.max_attempts
        )))
    }

    /// Run `f` against a consistent snapshot without writing anything.
    pub fn read<T>(&self, f: impl FnOnce(&mut Txn) -> Result<T>) -> Result<T> {
        let mut txn = self.begin()?;
        f(&mut txn)
    }

    /// Receiver that observes every committed revision.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revisions.subscribe()
    }

    fn begin(&self) -> Result<Txn> {
        let snapshot = self
            .tables
            .lock()
            .map_err(|_| Error::internal("metadata store lock poisoned"))?
            .clone();

        Ok(Txn {
            snapshot,
            reads: HashMap::new(),
            scans: HashMap::new(),
            writes: BTreeMap::new(),
            inserted: Vec::new(),
        })
    }

    fn commit(&self, txn: Txn) -> Result<std::result::Result<(), Conflict>> {
        if txn.writes.is_empty() {
            return Ok(Ok(()));
        }

        let mut guard = self
            .tables
            .lock()
            .map_err(|_| Error::internal("metadata store lock poisoned"))?;

        let stale_read = txn
            .reads
            .iter()
            .any(|(key, seen)| guard.version(key) != *seen);
        let stale_scan = txn
            .scans
            .iter()
            .any(|(scope, seen)| guard.scope_version(scope) != *seen);
        let stale_write = txn
            .writes
            .keys()
            .any(|key| guard.version(key) != txn.snapshot.version(key));
        if stale_read || stale_scan || stale_write {
            return Ok(Err(Conflict));
        }

        let tables = Arc::make_mut(&mut *guard);
        tables.revision += 1;
        let revision = tables.revision;

        let mut new_seqs = HashMap::new();
        for key in &txn.inserted {
            new_seqs.insert(key.clone(), tables.next_seq);
            tables.next_seq += 1;
        }

        for (key, row) in txn.writes {
            let scope = key.scope();
            match row {
                Some(row) => {
                    let seq = match tables.rows.get(&key) {
                        Some(existing) => existing.seq,
                        None => {
                            tables.scopes.insert(scope, revision);
                            match new_seqs.get(&key) {
                                Some(seq) => *seq,
                                None => {
                                    let seq = tables.next_seq;
                                    tables.next_seq += 1;
                                    seq
                                }
                            }
                        }
                    };
                    tables.rows.insert(key.clone(), Stored { seq, row });
                }
                None => {
                    if tables.rows.remove(&key).is_some() {
                        tables.scopes.insert(scope, revision);
                    }
                }
            }
            tables.versions.insert(key, revision);
        }

        drop(guard);
        self.revisions.send_replace(revision);

        Ok(Ok(()))
    }

    fn backoff(attempt: usize) {
        let ceiling = 50 * attempt as u64;
        std::thread::sleep(Duration::from_micros(rand::random::<u64>() % ceiling));
    }
}

/// A single transaction attempt.
///
/// Obtained through [`MetadataStore::transact`] or [`MetadataStore::read`].
pub struct Txn {
    snapshot: Arc<Tables>,
    reads: HashMap<RowKey, u64>,
    scans: HashMap<Scope, u64>,
    writes: BTreeMap<RowKey, Option<Row>>,
    inserted: Vec<RowKey>,
}

impl Txn {
    fn read_row(&mut self, key: RowKey) -> Option<Row> {
        if let Some(buffered) = self.writes.get(&key) {
            return buffered.clone();
        }

        let version = self.snapshot.version(&key);
        let row = self.snapshot.rows.get(&key).map(|stored| stored.row.clone());
        self.reads.insert(key, version);
        row
    }

    fn write_row(&mut self, key: RowKey, row: Row) {
        let known = self.snapshot.rows.contains_key(&key) || self.inserted.contains(&key);
        if !known {
            self.inserted.push(key.clone());
        }
        self.writes.insert(key, Some(row));
    }

    fn remove_row(&mut self, key: RowKey) {
        self.inserted.retain(|inserted| inserted != &key);
        self.writes.insert(key, None);
    }

    fn seq_of(&self, key: &RowKey) -> Option<u64> {
        if let Some(stored) = self.snapshot.rows.get(key) {
            return Some(stored.seq);
        }

        self.inserted
            .iter()
            .position(|inserted| inserted == key)
            .map(|position| self.snapshot.next_seq + position as u64)
    }

    /// Rows of `scope` in creation order, overlaid with buffered writes.
    fn scan(&mut self, scope: Scope) -> Vec<Row> {
        self.scans
            .insert(scope.clone(), self.snapshot.scope_version(&scope));

        let mut keyed: Vec<(u64, RowKey)> = self
            .snapshot
            .rows
            .range(scope.lower_bound()..)
            .take_while(|(key, _)| scope.contains(key))
            .map(|(key, stored)| (stored.seq, key.clone()))
            .collect();
        for (position, key) in self.inserted.iter().enumerate() {
            if scope.contains(key) {
                keyed.push((self.snapshot.next_seq + position as u64, key.clone()));
            }
        }
        keyed.sort();

        keyed
            .into_iter()
            .filter_map(|(_, key)| self.read_row(key))
            .collect()
    }

    pub fn get_repo(&mut self, name: &RepoName) -> Option<RepoInfo> {
        match self.read_row(RowKey::Repo(name.clone())) {
            Some(Row::Repo(info)) => Some(info),
            _ => None,
        }
    }

    pub fn require_repo(&mut self, name: &RepoName) -> Result<RepoInfo> {
        self.get_repo(name)
            .ok_or_else(|| Error::not_found(format!("repo {name}")))
    }

    pub fn put_repo(&mut self, info: RepoInfo) {
        self.write_row(RowKey::Repo(info.name.clone()), Row::Repo(info));
    }

    pub fn delete_repo(&mut self, name: &RepoName) {
        self.remove_row(RowKey::Repo(name.clone()));
    }

    /// All repos, oldest first.
    pub fn list_repos(&mut self) -> Vec<RepoInfo> {
        self.scan(Scope::Repos)
            .into_iter()
            .filter_map(|row| match row {
                Row::Repo(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn get_branch(&mut self, branch: &BranchKey) -> Option<BranchInfo> {
        match self.read_row(RowKey::Branch(branch.clone())) {
            Some(Row::Branch(info)) => Some(info),
            _ => None,
        }
    }

    pub fn require_branch(&mut self, branch: &BranchKey) -> Result<BranchInfo> {
        self.get_branch(branch)
            .ok_or_else(|| Error::not_found(format!("branch {branch}")))
    }

    pub fn put_branch(&mut self, info: BranchInfo) {
        self.write_row(RowKey::Branch(info.branch.clone()), Row::Branch(info));
    }

    pub fn delete_branch(&mut self, branch: &BranchKey) {
        self.remove_row(RowKey::Branch(branch.clone()));
    }

    /// Branches of `repo`, oldest first.
    pub fn list_branches(&mut self, repo: &RepoName) -> Vec<BranchInfo> {
        self.scan(Scope::Branches(repo.clone()))
            .into_iter()
            .filter_map(|row| match row {
                Row::Branch(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    pub fn get_commit(&mut self, commit: &CommitKey) -> Option<CommitInfo> {
        match self.read_row(RowKey::Commit(commit.clone())) {
            Some(Row::Commit(info)) => Some(info),
            _ => None,
        }
    }

    pub fn require_commit(&mut self, commit: &CommitKey) -> Result<CommitInfo> {
        self.get_commit(commit)
            .ok_or_else(|| Error::not_found(format!("commit {commit}")))
    }

    pub fn put_commit(&mut self, info: CommitInfo) {
        self.write_row(RowKey::Commit(info.commit.clone()), Row::Commit(info));
    }

    pub fn delete_commit(&mut self, commit: &CommitKey) {
        self.remove_row(RowKey::Commit(commit.clone()));
    }

    /// Commits of `repo` across all branches, oldest first.
    pub fn list_commits(&mut self, repo: &RepoName) -> Vec<CommitInfo> {
        self.scan(Scope::Commits(repo.clone()))
            .into_iter()
            .filter_map(|row| match row {
                Row::Commit(info) => Some(info),
                _ => None,
            })
            .collect()
    }

    /// Commits of every repo, oldest first within each repo.
    pub fn list_all_commits(&mut self) -> Vec<CommitInfo> {
        let repos = self.list_repos();
        repos
            .iter()
            .flat_map(|repo| self.list_commits(&repo.name))
            .collect()
    }

    /// Creation sequence of a commit, used to order commits across branches.
    pub fn commit_seq(&self, commit: &CommitKey) -> Option<u64> {
        self.seq_of(&RowKey::Commit(commit.clone()))
    }

    pub fn branch_seq(&self, branch: &BranchKey) -> Option<u64> {
        self.seq_of(&RowKey::Branch(branch.clone()))
    }
}
