//! The per-repository storage engine.
//!
//! Every CentralDogma repository is a bare git repository with a single
//! linear branch: revision N is the Nth commit from the root. The commit
//! log, packed entry store and index of the persisted layout are git's own.
//! All conflict detection happens in memory against the parent entry tree
//! before anything is written; the head revision is published atomically
//! only after the new commit is durable behind the ref.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use git2::{ObjectType, Oid, Signature, Sort, TreeWalkMode, TreeWalkResult};
use serde::{Deserialize, Serialize};

use crate::change::{self, EntryMap};
use crate::model::{
    Author, Change, ChangeContent, Commit, CommitDetail, CommitMessage, Entry, EntryContent,
    EntryType, ListEntry, Query, RepositoryInfo, Revision,
};
use crate::path::PathPattern;
use crate::query;
use crate::Error;

const BRANCH_REF: &str = "refs/heads/master";
const INITIAL_COMMIT_SUMMARY: &str = "Create a new repository";
const CREATION_FILE: &str = "creation.json";

/// Options of a find operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FindOptions {
    /// Maximum number of entries to return.
    pub max_entries: Option<usize>,
}

/// Options of a commit operation.
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    /// Permit a commit whose net effect on the tree is empty.
    /// Without this, such a commit fails with [`Error::RedundantChange`].
    pub allow_empty: bool,
}

/// Outcome of a successful commit, carrying what the watch and cache layers
/// need to react.
#[derive(Debug, Clone)]
pub struct CommitResult {
    pub revision: Revision,
    pub pushed_at: String,
    /// Paths added, removed or modified by this commit.
    pub changed_paths: Vec<String>,
}

/// The read/write contract of a single repository. Implemented by the git
/// engine and by the caching layer wrapped around it.
#[async_trait]
pub trait Repository: Send + Sync {
    fn name(&self) -> &str;

    /// Current head revision. Lock-free.
    fn head(&self) -> Revision;

    /// Resolves a relative revision to an absolute one.
    fn normalize(&self, revision: Revision) -> Result<Revision, Error>;

    /// Resolves a pair of revisions, preserving the caller-supplied
    /// traversal direction.
    fn normalize_range(
        &self,
        from: Revision,
        to: Revision,
    ) -> Result<(Revision, Revision), Error> {
        Ok((self.normalize(from)?, self.normalize(to)?))
    }

    /// Repository metadata for listings.
    fn info(&self) -> RepositoryInfo;

    /// Entries matched by `path_pattern` at `revision`, with content.
    async fn find(
        &self,
        revision: Revision,
        path_pattern: &str,
        options: &FindOptions,
    ) -> Result<Vec<Entry>, Error>;

    /// Entries matched by `path_pattern` at `revision`, without content.
    async fn list(&self, revision: Revision, path_pattern: &str) -> Result<Vec<ListEntry>, Error>;

    /// Queries a single file at `revision`.
    async fn get(&self, revision: Revision, query: &Query) -> Result<Entry, Error>;

    /// Commit metadata of the commits between `from` and `to` touching
    /// `path_pattern`, ordered newest-first when `from > to` and
    /// oldest-first otherwise.
    async fn history(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>, Error>;

    /// Per-path changes that transform `from` into `to`.
    async fn diff(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
    ) -> Result<Vec<Change>, Error>;

    /// The change of a single queried file between two revisions, or `None`
    /// when the query results are identical.
    async fn diff_file(
        &self,
        from: Revision,
        to: Revision,
        query: &Query,
    ) -> Result<Option<Change>, Error>;

    /// Appends a commit on top of `base_revision`. When the head has moved
    /// past `base_revision`, JSON changes are merged three-way; any other
    /// change kind fails with [`Error::RevisionNotFound`].
    async fn commit(
        &self,
        base_revision: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
        options: CommitOptions,
    ) -> Result<CommitResult, Error>;
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Creation {
    creator: Author,
    created_at: String,
}

struct RepoInner {
    git: git2::Repository,
    /// `revisions[i]` is the commit of revision `i + 1`.
    revisions: Vec<Oid>,
}

/// The git-backed storage engine of one repository.
pub struct GitRepository {
    name: String,
    path: PathBuf,
    creation: Creation,
    inner: Arc<Mutex<RepoInner>>,
    head: Arc<AtomicI64>,
}

impl GitRepository {
    /// Creates a new repository at `path` with the initial System commit.
    pub fn create(path: &Path, name: &str, creator: &Author) -> Result<GitRepository, Error> {
        if path.exists() {
            return Err(Error::RepositoryExists(name.to_string()));
        }
        let git = git2::Repository::init_bare(path)?;
        let now = Utc::now();
        {
            let tree_oid = git.treebuilder(None)?.write()?;
            let tree = git.find_tree(tree_oid)?;
            let sig = signature(&Author::system(), &now)?;
            git.commit(Some(BRANCH_REF), &sig, &sig, INITIAL_COMMIT_SUMMARY, &tree, &[])?;
        }
        let creation = Creation {
            creator: creator.clone(),
            created_at: now.to_rfc3339(),
        };
        std::fs::write(path.join(CREATION_FILE), serde_json::to_vec_pretty(&creation)?)?;
        log::info!("created repository {} at {}", name, path.display());
        Self::open(path, name)
    }

    /// Opens an existing repository, rebuilding the revision index.
    pub fn open(path: &Path, name: &str) -> Result<GitRepository, Error> {
        let git = git2::Repository::open(path)?;
        let creation: Creation = serde_json::from_slice(&std::fs::read(path.join(CREATION_FILE))?)?;

        let head_oid = git.refname_to_id(BRANCH_REF)?;
        let mut walk = git.revwalk()?;
        walk.push(head_oid)?;
        walk.set_sorting(Sort::TOPOLOGICAL | Sort::REVERSE)?;
        let mut revisions = Vec::new();
        for oid in walk {
            revisions.push(oid?);
        }
        if revisions.is_empty() {
            return Err(Error::Storage(format!("repository {} has no commits", name)));
        }

        let head = revisions.len() as i64;
        Ok(GitRepository {
            name: name.to_string(),
            path: path.to_path_buf(),
            creation,
            inner: Arc::new(Mutex::new(RepoInner { git, revisions })),
            head: Arc::new(AtomicI64::new(head)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(inner: &Mutex<RepoInner>) -> Result<MutexGuard<'_, RepoInner>, Error> {
        inner
            .lock()
            .map_err(|_| Error::Storage("repository lock poisoned".to_string()))
    }
}

fn signature(author: &Author, at: &DateTime<Utc>) -> Result<Signature<'static>, Error> {
    Ok(Signature::new(
        &author.name,
        &author.email,
        &git2::Time::new(at.timestamp(), 0),
    )?)
}

fn normalize_value(revision: Revision, head: i64) -> Result<i64, Error> {
    let v = revision.as_i64();
    let resolved = if v < 0 { head + v + 1 } else { v };
    if resolved < 1 || resolved > head {
        return Err(Error::RevisionNotFound(revision));
    }
    Ok(resolved)
}

/// Reads the whole entry tree at a revision (1-based).
fn tree_at(inner: &RepoInner, revision: i64) -> Result<EntryMap, Error> {
    let commit = inner.git.find_commit(inner.revisions[(revision - 1) as usize])?;
    let tree = commit.tree()?;
    let mut map = EntryMap::new();
    let mut failure: Option<git2::Error> = None;
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            let name = entry.name().unwrap_or_default();
            let path = format!("/{}{}", root, name);
            match inner.git.find_blob(entry.id()) {
                Ok(blob) => {
                    map.insert(path, blob.content().to_vec());
                }
                Err(e) => {
                    failure = Some(e);
                    return TreeWalkResult::Abort;
                }
            }
        }
        TreeWalkResult::Ok
    })?;
    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(map)
}

/// Writes an entry map as a nested git tree, bottom-up.
fn write_tree(git: &git2::Repository, entries: &EntryMap) -> Result<Oid, Error> {
    #[derive(Default)]
    struct DirNode {
        files: BTreeMap<String, Oid>,
        dirs: BTreeMap<String, DirNode>,
    }

    fn write_node(git: &git2::Repository, node: &DirNode) -> Result<Oid, git2::Error> {
        let mut builder = git.treebuilder(None)?;
        for (name, child) in &node.dirs {
            let oid = write_node(git, child)?;
            builder.insert(name, oid, 0o040000)?;
        }
        for (name, oid) in &node.files {
            builder.insert(name, *oid, 0o100644)?;
        }
        builder.write()
    }

    let mut root = DirNode::default();
    for (path, bytes) in entries {
        let oid = git.blob(bytes)?;
        let components: Vec<&str> = path[1..].split('/').collect();
        let mut node = &mut root;
        for dir in &components[..components.len() - 1] {
            node = node.dirs.entry((*dir).to_string()).or_insert_with(DirNode::default);
        }
        node.files.insert(components[components.len() - 1].to_string(), oid);
    }
    Ok(write_node(git, &root)?)
}

fn encode_message(message: &CommitMessage) -> String {
    match &message.detail {
        None => message.summary.clone(),
        Some(detail) => format!(
            "{}\n\n{}",
            message.summary,
            serde_json::to_string(detail).expect("commit detail must serialize")
        ),
    }
}

fn decode_message(raw: &str) -> CommitMessage {
    match raw.split_once("\n\n") {
        None => CommitMessage::only_summary(raw.trim_end()),
        Some((summary, rest)) => {
            let detail = serde_json::from_str::<CommitDetail>(rest.trim())
                .ok()
                .or_else(|| Some(CommitDetail::Plaintext(rest.trim().to_string())));
            CommitMessage {
                summary: summary.to_string(),
                detail,
            }
        }
    }
}

fn commit_meta(inner: &RepoInner, revision: i64) -> Result<Commit, Error> {
    let commit = inner.git.find_commit(inner.revisions[(revision - 1) as usize])?;
    let author = commit.author();
    let pushed_at = Utc
        .timestamp_opt(commit.time().seconds(), 0)
        .single()
        .map(|t| t.to_rfc3339());
    Ok(Commit {
        revision: Revision::from(revision),
        author: Author::new(
            author.name().unwrap_or("unknown"),
            author.email().unwrap_or("unknown"),
        ),
        commit_message: decode_message(commit.message().unwrap_or_default()),
        pushed_at,
    })
}

/// Paths whose stored bytes differ between two entry maps.
fn changed_paths(old: &EntryMap, new: &EntryMap) -> Vec<String> {
    let mut paths = Vec::new();
    for path in old.keys() {
        if !new.contains_key(path) {
            paths.push(path.clone());
        }
    }
    for (path, bytes) in new {
        match old.get(path) {
            Some(old_bytes) if old_bytes == bytes => {}
            _ => paths.push(path.clone()),
        }
    }
    paths.sort();
    paths
}

/// Derived directory paths of a file path, deepest last: `/a/b/c.json`
/// yields `/a` and `/a/b`.
fn parent_dirs(path: &str) -> Vec<String> {
    let mut dirs = Vec::new();
    let bytes = path.as_bytes();
    for i in 1..bytes.len() {
        if bytes[i] == b'/' {
            dirs.push(path[..i].to_string());
        }
    }
    dirs
}

fn entries_matching(
    map: &EntryMap,
    pattern: &PathPattern,
    revision: i64,
    with_content: bool,
) -> Result<BTreeMap<String, Entry>, Error> {
    let rev = Revision::from(revision);
    let mut out = BTreeMap::new();
    for (path, bytes) in map {
        if pattern.matches(path) {
            let content = if with_content {
                change::content_of(path, bytes)?
            } else {
                match EntryType::from_path(path) {
                    EntryType::Json => EntryContent::Json(serde_json::Value::Null),
                    _ => EntryContent::Text(String::new()),
                }
            };
            out.insert(
                path.clone(),
                Entry {
                    path: path.clone(),
                    content,
                    revision: rev,
                },
            );
        }
        for dir in parent_dirs(path) {
            if pattern.matches(&dir) && !out.contains_key(&dir) {
                out.insert(
                    dir.clone(),
                    Entry {
                        path: dir,
                        content: EntryContent::Directory,
                        revision: rev,
                    },
                );
            }
        }
    }
    Ok(out)
}

fn diff_maps(
    from_map: &EntryMap,
    to_map: &EntryMap,
    pattern: &PathPattern,
) -> Result<Vec<Change>, Error> {
    let mut paths: Vec<&String> = from_map
        .keys()
        .chain(to_map.keys())
        .filter(|p| pattern.matches(p))
        .collect();
    paths.sort();
    paths.dedup();

    let mut changes = Vec::new();
    for path in paths {
        match (from_map.get(path), to_map.get(path)) {
            (None, Some(bytes)) => changes.push(upsert_of(path, bytes)?),
            (Some(_), None) => changes.push(Change::remove(path)),
            (Some(a), Some(b)) if a != b => match EntryType::from_path(path) {
                EntryType::Json => {
                    let old = change::parse_json_entry(path, a)?;
                    let new = change::parse_json_entry(path, b)?;
                    changes.push(Change {
                        path: path.clone(),
                        content: ChangeContent::ApplyJsonPatch(change::json_patch::diff(
                            &old, &new,
                        )),
                    });
                }
                _ => {
                    let old = String::from_utf8_lossy(a);
                    let new = String::from_utf8_lossy(b);
                    changes.push(Change {
                        path: path.clone(),
                        content: ChangeContent::ApplyTextPatch(change::text_patch::diff(
                            &old, &new,
                        )),
                    });
                }
            },
            _ => {}
        }
    }
    Ok(changes)
}

fn upsert_of(path: &str, bytes: &[u8]) -> Result<Change, Error> {
    match change::content_of(path, bytes)? {
        EntryContent::Json(v) => Ok(Change::upsert_json(path, v)),
        EntryContent::Text(t) => Ok(Change::upsert_text(path, &t)),
        EntryContent::Directory => unreachable!("stored entries are files"),
    }
}

#[async_trait]
impl Repository for GitRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn head(&self) -> Revision {
        Revision::from(self.head.load(Ordering::Acquire))
    }

    fn normalize(&self, revision: Revision) -> Result<Revision, Error> {
        normalize_value(revision, self.head.load(Ordering::Acquire)).map(Revision::from)
    }

    fn info(&self) -> RepositoryInfo {
        RepositoryInfo {
            name: self.name.clone(),
            creator: self.creation.creator.clone(),
            head_revision: self.head(),
            created_at: Some(self.creation.created_at.clone()),
        }
    }

    async fn find(
        &self,
        revision: Revision,
        path_pattern: &str,
        options: &FindOptions,
    ) -> Result<Vec<Entry>, Error> {
        let rev = self.normalize(revision)?.as_i64();
        let pattern = PathPattern::new(path_pattern)?;
        let limit = options.max_entries;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let map = tree_at(&guard, rev)?;
            let entries = entries_matching(&map, &pattern, rev, true)?;
            let mut out: Vec<Entry> = entries.into_iter().map(|(_, e)| e).collect();
            if let Some(limit) = limit {
                out.truncate(limit);
            }
            Ok(out)
        })
        .await?
    }

    async fn list(&self, revision: Revision, path_pattern: &str) -> Result<Vec<ListEntry>, Error> {
        let rev = self.normalize(revision)?.as_i64();
        let pattern = PathPattern::new(path_pattern)?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let map = tree_at(&guard, rev)?;
            let entries = entries_matching(&map, &pattern, rev, false)?;
            Ok(entries
                .into_iter()
                .map(|(path, e)| ListEntry {
                    r#type: e.entry_type(),
                    path,
                })
                .collect())
        })
        .await?
    }

    async fn get(&self, revision: Revision, query: &Query) -> Result<Entry, Error> {
        let rev = self.normalize(revision)?;
        let query = query.clone();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let map = tree_at(&guard, rev.as_i64())?;
            let bytes = map
                .get(query.path())
                .ok_or_else(|| Error::entry_not_found(rev, query.path()))?;
            let entry = Entry {
                path: query.path().to_string(),
                content: change::content_of(query.path(), bytes)?,
                revision: rev,
            };
            query::apply(&query, &entry)
        })
        .await?
    }

    async fn history(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>, Error> {
        let (from_n, to_n) = self.normalize_range(from, to)?;
        let pattern = PathPattern::new(path_pattern)?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let (from_v, to_v) = (from_n.as_i64(), to_n.as_i64());
            let newest_first = from_v >= to_v;
            let (lo, hi) = if newest_first { (to_v, from_v) } else { (from_v, to_v) };

            let mut revs: Vec<i64> = (lo..=hi).collect();
            if newest_first {
                revs.reverse();
            }

            let mut commits = Vec::new();
            for rev in revs {
                if commits.len() >= max_commits {
                    break;
                }
                let touched = if rev == 1 {
                    // The initial commit belongs to every history range that
                    // covers it.
                    true
                } else {
                    let before = tree_at(&guard, rev - 1)?;
                    let after = tree_at(&guard, rev)?;
                    changed_paths(&before, &after)
                        .iter()
                        .any(|p| pattern.matches(p))
                };
                if touched {
                    commits.push(commit_meta(&guard, rev)?);
                }
            }
            Ok(commits)
        })
        .await?
    }

    async fn diff(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
    ) -> Result<Vec<Change>, Error> {
        let (from_n, to_n) = self.normalize_range(from, to)?;
        let pattern = PathPattern::new(path_pattern)?;
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let from_map = tree_at(&guard, from_n.as_i64())?;
            let to_map = tree_at(&guard, to_n.as_i64())?;
            diff_maps(&from_map, &to_map, &pattern)
        })
        .await?
    }

    async fn diff_file(
        &self,
        from: Revision,
        to: Revision,
        query: &Query,
    ) -> Result<Option<Change>, Error> {
        let (from_n, to_n) = self.normalize_range(from, to)?;
        let query = query.clone();
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = Self::lock(&inner)?;
            let from_map = tree_at(&guard, from_n.as_i64())?;
            let to_map = tree_at(&guard, to_n.as_i64())?;

            let queried = |map: &EntryMap| -> Result<Option<EntryContent>, Error> {
                match map.get(query.path()) {
                    None => Ok(None),
                    Some(bytes) => {
                        let content = change::content_of(query.path(), bytes)?;
                        Ok(Some(query::apply_content(&query, query.path(), &content)?))
                    }
                }
            };
            let old = queried(&from_map)?;
            let new = queried(&to_map)?;
            match (old, new) {
                (None, None) => Err(Error::entry_not_found(to_n, query.path())),
                (None, Some(content)) => Ok(Some(change_for(query.path(), &content))),
                (Some(_), None) => Ok(Some(Change::remove(query.path()))),
                (Some(a), Some(b)) if a == b => Ok(None),
                (Some(a), Some(b)) => Ok(Some(content_diff(query.path(), &a, &b))),
            }
        })
        .await?
    }

    async fn commit(
        &self,
        base_revision: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
        options: CommitOptions,
    ) -> Result<CommitResult, Error> {
        if message.summary.is_empty() {
            return Err(Error::InvalidParams("summary of commit message cannot be empty"));
        }
        // An empty change list has an empty net effect by definition and
        // falls through to the same RedundantChange check as a list of
        // no-op changes.
        let name = self.name.clone();
        let inner = self.inner.clone();
        let head = self.head.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = Self::lock(&inner)?;
            let head_value = guard.revisions.len() as i64;
            let base = normalize_value(base_revision, head_value)?;
            let head_tree = tree_at(&guard, head_value)?;

            let effective = if base == head_value {
                changes
            } else {
                // The head moved past the caller's base: JSON changes are
                // merged three-way, anything else needs a fresh base.
                if !change::mergeable(&changes) {
                    return Err(Error::RevisionNotFound(base_revision));
                }
                let base_tree = tree_at(&guard, base)?;
                change::rebase_changes(&base_tree, &head_tree, &changes)?
            };

            let new_tree = change::apply_changes(&head_tree, &effective)?;
            if new_tree == head_tree && !options.allow_empty {
                return Err(Error::RedundantChange);
            }
            let touched = changed_paths(&head_tree, &new_tree);

            let now = Utc::now();
            let parent_oid = *guard.revisions.last().expect("repository has commits");
            let oid = {
                let tree_oid = write_tree(&guard.git, &new_tree)?;
                let tree = guard.git.find_tree(tree_oid)?;
                let parent = guard.git.find_commit(parent_oid)?;
                let sig = signature(&author, &now)?;
                guard.git.commit(
                    Some(BRANCH_REF),
                    &sig,
                    &sig,
                    &encode_message(&message),
                    &tree,
                    &[&parent],
                )?
            };

            // Publish: the commit is durable behind the ref; only now does
            // the head advance for readers and normalization.
            guard.revisions.push(oid);
            let new_head = guard.revisions.len() as i64;
            head.store(new_head, Ordering::Release);
            log::debug!(
                "{}: commit {} ({}, {} path(s))",
                name,
                new_head,
                message.summary,
                touched.len()
            );
            Ok(CommitResult {
                revision: Revision::from(new_head),
                pushed_at: now.to_rfc3339(),
                changed_paths: touched,
            })
        })
        .await?
    }
}

fn change_for(path: &str, content: &EntryContent) -> Change {
    match content {
        EntryContent::Json(v) => Change::upsert_json(path, v.clone()),
        EntryContent::Text(t) => Change::upsert_text(path, t),
        EntryContent::Directory => Change {
            path: path.to_string(),
            content: ChangeContent::UpsertText(String::new()),
        },
    }
}

fn content_diff(path: &str, old: &EntryContent, new: &EntryContent) -> Change {
    match (old, new) {
        (EntryContent::Json(a), EntryContent::Json(b)) => Change {
            path: path.to_string(),
            content: ChangeContent::ApplyJsonPatch(change::json_patch::diff(a, b)),
        },
        (EntryContent::Text(a), EntryContent::Text(b)) => Change {
            path: path.to_string(),
            content: ChangeContent::ApplyTextPatch(change::text_patch::diff(a, b)),
        },
        // Queried renderings changed shape; carry the new content whole.
        (_, content) => change_for(path, content),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn new_repo(dir: &Path) -> GitRepository {
        GitRepository::create(&dir.join("r.git"), "r", &Author::new("alice", "alice@a.c")).unwrap()
    }

    fn push_message(n: u32) -> CommitMessage {
        CommitMessage::only_summary(&format!("commit {}", n))
    }

    #[tokio::test]
    async fn test_initial_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        assert_eq!(repo.head(), Revision::INIT);
        let history = repo.history(Revision::HEAD, Revision::INIT, "/**", 100).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].author, Author::system());
        assert_eq!(history[0].commit_message.summary, INITIAL_COMMIT_SUMMARY);
    }

    #[tokio::test]
    async fn test_commit_advances_head_by_one() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        let result = repo
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(1),
                vec![Change::upsert_json("/foo.json", json!({"a": "b"}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(result.revision, Revision::from(2));
        assert_eq!(repo.head(), Revision::from(2));
        assert_eq!(result.changed_paths, vec!["/foo.json".to_string()]);
    }

    #[tokio::test]
    async fn test_normalize() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_json("/foo.json", json!(1))],
            CommitOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(repo.normalize(Revision::HEAD).unwrap(), Revision::from(2));
        assert_eq!(repo.normalize(Revision::from(-2)).unwrap(), Revision::from(1));
        assert_eq!(repo.normalize(Revision::from(1)).unwrap(), Revision::from(1));
        assert!(matches!(
            repo.normalize(Revision::from(3)),
            Err(Error::RevisionNotFound(_))
        ));
        assert!(matches!(
            repo.normalize(Revision::from(-3)),
            Err(Error::RevisionNotFound(_))
        ));
        assert!(matches!(
            repo.normalize(Revision::from(0)),
            Err(Error::RevisionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_is_deterministic_across_later_commits() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_json("/foo.json", json!({"v": 1}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        let q = Query::of_json("/foo.json").unwrap();
        let before = repo.get(Revision::from(2), &q).await.unwrap();

        for n in 0..3 {
            repo.commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(n + 2),
                vec![Change::upsert_json("/foo.json", json!({"v": n + 2}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        }
        let after = repo.get(Revision::from(2), &q).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_history_filters_and_orders() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        for (path, n) in &[("/foo.json", 1), ("/bar.json", 2), ("/foo.json", 3)] {
            repo.commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(*n),
                vec![Change::upsert_json(path, json!({"n": n}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        }

        let all = repo.history(Revision::HEAD, Revision::INIT, "/**", 100).await.unwrap();
        assert_eq!(all.len(), 4); // three pushes plus the initial commit
        assert_eq!(all[0].revision, Revision::from(4));
        assert_eq!(all[3].revision, Revision::from(1));

        let oldest_first = repo.history(Revision::INIT, Revision::HEAD, "/**", 100).await.unwrap();
        assert_eq!(oldest_first[0].revision, Revision::from(1));

        let foo_only = repo
            .history(Revision::HEAD, Revision::from(2), "/foo.json", 100)
            .await
            .unwrap();
        assert_eq!(
            foo_only.iter().map(|c| c.revision.as_i64()).collect::<Vec<_>>(),
            vec![4, 2]
        );

        let capped = repo.history(Revision::HEAD, Revision::INIT, "/**", 2).await.unwrap();
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].revision, Revision::from(4));
    }

    #[tokio::test]
    async fn test_diff_produces_safe_replace() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_json("/foo.json", json!({"a": "b"}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(2),
            vec![Change::upsert_json("/foo.json", json!({"a": "d"}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();

        let changes = repo.diff(Revision::from(2), Revision::from(3), "/foo.json").await.unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(
            changes[0].content,
            ChangeContent::ApplyJsonPatch(json!([
                {"op": "safeReplace", "path": "/a", "oldValue": "b", "value": "d"}
            ]))
        );
    }

    #[tokio::test]
    async fn test_diff_roundtrip_reconstructs_target() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![
                Change::upsert_json("/keep.json", json!({"k": 1})),
                Change::upsert_json("/gone.json", json!({"g": 1})),
                Change::upsert_text("/note.txt", "one\ntwo\n"),
            ],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(2),
            vec![
                Change::upsert_json("/keep.json", json!({"k": 2})),
                Change::remove("/gone.json"),
                Change::upsert_text("/note.txt", "one\nTWO\n"),
                Change::upsert_json("/new.json", json!([1, 2])),
            ],
            CommitOptions::default(),
        )
        .await
        .unwrap();

        let changes = repo.diff(Revision::from(2), Revision::from(3), "/**").await.unwrap();
        // Replaying the diff on top of revision 2 must land exactly on
        // revision 3.
        let at2 = repo.find(Revision::from(2), "/**", &FindOptions::default()).await.unwrap();
        let at3 = repo.find(Revision::from(3), "/**", &FindOptions::default()).await.unwrap();
        let mut map = EntryMap::new();
        for e in &at2 {
            match &e.content {
                EntryContent::Json(v) => {
                    map.insert(e.path.clone(), change::canonical_json_bytes(v));
                }
                EntryContent::Text(t) => {
                    map.insert(e.path.clone(), change::text_bytes(t));
                }
                EntryContent::Directory => {}
            }
        }
        let replayed = change::apply_changes(&map, &changes).unwrap();
        let mut expected = EntryMap::new();
        for e in &at3 {
            match &e.content {
                EntryContent::Json(v) => {
                    expected.insert(e.path.clone(), change::canonical_json_bytes(v));
                }
                EntryContent::Text(t) => {
                    expected.insert(e.path.clone(), change::text_bytes(t));
                }
                EntryContent::Directory => {}
            }
        }
        assert_eq!(replayed, expected);
    }

    #[tokio::test]
    async fn test_diff_same_revision_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_json("/foo.json", json!(1))],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        let changes = repo.diff(Revision::HEAD, Revision::HEAD, "/**").await.unwrap();
        assert!(changes.is_empty());
        let single = repo
            .diff_file(Revision::HEAD, Revision::HEAD, &Query::of_json("/foo.json").unwrap())
            .await
            .unwrap();
        assert!(single.is_none());
    }

    #[tokio::test]
    async fn test_redundant_change_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        let change = Change::upsert_json("/foo.json", json!({"a": 1}));
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![change.clone()],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        let err = repo
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(2),
                vec![change.clone()],
                CommitOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::RedundantChange);

        // So does a commit with no changes at all.
        let err = repo
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(2),
                vec![],
                CommitOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err, Error::RedundantChange);

        // Opting into empty commits still advances the head.
        let ok = repo
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(3),
                vec![change],
                CommitOptions { allow_empty: true },
            )
            .await
            .unwrap();
        assert_eq!(ok.revision, Revision::from(3));
    }

    #[tokio::test]
    async fn test_stale_base_merges_json() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_json("/foo.json", json!({"x": 1, "y": 1}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        // Head moves on: x changes.
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(2),
            vec![Change::upsert_json("/foo.json", json!({"x": 2, "y": 1}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();

        // A commit based on revision 2 edits y only; it merges.
        let merged = repo
            .commit(
                Revision::from(2),
                Author::new("b", "b@b"),
                push_message(3),
                vec![Change::upsert_json("/foo.json", json!({"x": 1, "y": 9}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(merged.revision, Revision::from(4));
        let entry = repo
            .get(Revision::HEAD, &Query::of_json("/foo.json").unwrap())
            .await
            .unwrap();
        assert_eq!(entry.content, EntryContent::Json(json!({"x": 2, "y": 9})));

        // The same edit to x conflicts.
        let err = repo
            .commit(
                Revision::from(2),
                Author::new("b", "b@b"),
                push_message(4),
                vec![Change::upsert_json("/foo.json", json!({"x": 7, "y": 9}))],
                CommitOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ChangeConflict(_)));

        // Text changes cannot merge at a stale base.
        let err = repo
            .commit(
                Revision::from(2),
                Author::new("b", "b@b"),
                push_message(5),
                vec![Change::upsert_text("/note.txt", "hi")],
                CommitOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RevisionNotFound(_)));
    }

    #[tokio::test]
    async fn test_reopen_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.git");
        {
            let repo =
                GitRepository::create(&path, "r", &Author::new("alice", "alice@a.c")).unwrap();
            repo.commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                push_message(1),
                vec![Change::upsert_json("/foo.json", json!({"a": "b"}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        }
        let reopened = GitRepository::open(&path, "r").unwrap();
        assert_eq!(reopened.head(), Revision::from(2));
        let entry = reopened
            .get(Revision::HEAD, &Query::of_json("/foo.json").unwrap())
            .await
            .unwrap();
        assert_eq!(entry.content, EntryContent::Json(json!({"a": "b"})));
        assert_eq!(reopened.info().creator, Author::new("alice", "alice@a.c"));
    }

    #[tokio::test]
    async fn test_find_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![
                Change::upsert_json("/a.json", json!(1)),
                Change::upsert_text("/sub/b.txt", "b"),
            ],
            CommitOptions::default(),
        )
        .await
        .unwrap();

        let all = repo.find(Revision::HEAD, "/**", &FindOptions::default()).await.unwrap();
        let paths: Vec<&str> = all.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a.json", "/sub", "/sub/b.txt"]);
        assert_eq!(all[1].content, EntryContent::Directory);

        let top_json = repo.list(Revision::HEAD, "/*.json").await.unwrap();
        assert_eq!(top_json.len(), 1);
        assert_eq!(top_json[0].r#type, EntryType::Json);

        let limited = repo
            .find(
                Revision::HEAD,
                "/**",
                &FindOptions {
                    max_entries: Some(1),
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_entry() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        let err = repo
            .get(Revision::HEAD, &Query::of_json("/absent.json").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn test_text_patch_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = new_repo(dir.path());
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(1),
            vec![Change::upsert_text("/note.txt", "one\ntwo\n")],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        let patch = change::text_patch::diff("one\ntwo\n", "one\nTWO\n");
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            push_message(2),
            vec![Change {
                path: "/note.txt".into(),
                content: ChangeContent::ApplyTextPatch(patch),
            }],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        let entry = repo
            .get(Revision::HEAD, &Query::of_text("/note.txt").unwrap())
            .await
            .unwrap();
        assert_eq!(entry.content, EntryContent::Text("one\nTWO\n".to_string()));
    }
}
