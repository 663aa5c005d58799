//! The caching repository.
//!
//! [`RepositoryCache`] sits in front of the git engine. Keys carry
//! revision-normalized requests, so `get(HEAD, q)` and `get(10, q)` share
//! one entry while `head == 10`; normalization itself reads the delegate's
//! atomic head counter and costs no delegate round-trip. Concurrent callers
//! of an identical key share a single in-flight delegate call that runs in
//! its own task, so one caller going away never cancels the others. A
//! failed computation is handed to every waiter and then discarded; the
//! cache never converts a failure into a hit. Missing-entry answers are
//! kept as tombstones, which are values, not failures.
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex};

use crate::model::{
    Author, Change, Commit, CommitMessage, Entry, ListEntry, Query, RepositoryInfo, Revision,
};
use crate::storage::repository::{
    CommitOptions, CommitResult, FindOptions, GitRepository, Repository,
};
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheOp {
    Get {
        revision: Revision,
        query: Query,
    },
    Find {
        revision: Revision,
        pattern: String,
        options: FindOptions,
    },
    List {
        revision: Revision,
        pattern: String,
    },
    History {
        from: Revision,
        to: Revision,
        pattern: String,
    },
    Diff {
        from: Revision,
        to: Revision,
        pattern: String,
    },
    DiffFile {
        from: Revision,
        to: Revision,
        query: Query,
    },
}

impl CacheOp {
    /// The highest revision this result was computed at. Entries computed
    /// at the repository head are invalidated when the head moves.
    fn max_revision(&self) -> Revision {
        match self {
            CacheOp::Get { revision, .. }
            | CacheOp::Find { revision, .. }
            | CacheOp::List { revision, .. } => *revision,
            CacheOp::History { from, to, .. }
            | CacheOp::Diff { from, to, .. }
            | CacheOp::DiffFile { from, to, .. } => (*from).max(*to),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    repo: String,
    op: CacheOp,
}

#[derive(Debug, Clone)]
enum CacheValue {
    Entry(Entry),
    /// A query answered `EntryNotFound`; a value, so repeated misses do not
    /// stampede the store.
    Tombstone,
    Entries(Vec<Entry>),
    ListEntries(Vec<ListEntry>),
    Commits(Vec<Commit>),
    Changes(Vec<Change>),
    MaybeChange(Option<Change>),
}

fn weight_of(value: &CacheValue) -> usize {
    const OVERHEAD: usize = 64;
    let payload = match value {
        CacheValue::Entry(e) => serde_json::to_vec(e).map(|b| b.len()).unwrap_or(256),
        CacheValue::Tombstone => 0,
        CacheValue::Entries(e) => serde_json::to_vec(e).map(|b| b.len()).unwrap_or(256),
        CacheValue::ListEntries(e) => serde_json::to_vec(e).map(|b| b.len()).unwrap_or(256),
        CacheValue::Commits(c) => serde_json::to_vec(c).map(|b| b.len()).unwrap_or(256),
        CacheValue::Changes(c) => serde_json::to_vec(c).map(|b| b.len()).unwrap_or(256),
        CacheValue::MaybeChange(c) => serde_json::to_vec(c).map(|b| b.len()).unwrap_or(256),
    };
    payload + OVERHEAD
}

enum Slot {
    InFlight(Vec<oneshot::Sender<Result<CacheValue, Error>>>),
    Ready {
        value: CacheValue,
        weight: usize,
        stamp: u64,
    },
}

#[derive(Default)]
struct CacheState {
    map: HashMap<CacheKey, Slot>,
    total_weight: usize,
    /// Access order, most recent at the back. Entries whose stamp no longer
    /// matches the slot are stale leftovers and skipped on eviction.
    queue: VecDeque<(CacheKey, u64)>,
    next_stamp: u64,
}

/// Cumulative counters, mostly for tests and metrics exporters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Delegate calls actually issued; single-flight keeps this below
    /// `misses` under concurrency.
    pub loads: u64,
}

/// A weight-bounded, single-flight read cache shared by every repository of
/// a server instance.
pub struct RepositoryCache {
    state: Mutex<CacheState>,
    stats: Mutex<CacheStats>,
    capacity: usize,
}

impl RepositoryCache {
    pub fn new(capacity_bytes: usize) -> Arc<RepositoryCache> {
        Arc::new(RepositoryCache {
            state: Mutex::new(CacheState::default()),
            stats: Mutex::new(CacheStats::default()),
            capacity: capacity_bytes,
        })
    }

    pub async fn stats(&self) -> CacheStats {
        *self.stats.lock().await
    }

    async fn get_or_compute<F>(
        self: &Arc<Self>,
        key: CacheKey,
        compute: F,
    ) -> Result<CacheValue, Error>
    where
        F: Future<Output = Result<CacheValue, Error>> + Send + 'static,
    {
        let rx = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            match state.map.get_mut(&key) {
                Some(Slot::Ready { value, stamp, .. }) => {
                    let value = value.clone();
                    let new_stamp = state.next_stamp;
                    state.next_stamp += 1;
                    *stamp = new_stamp;
                    state.queue.push_back((key, new_stamp));
                    prune_stale_front(state);
                    drop(guard);
                    self.stats.lock().await.hits += 1;
                    return Ok(value);
                }
                Some(Slot::InFlight(waiters)) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.map.insert(key.clone(), Slot::InFlight(vec![tx]));
                    drop(guard);
                    {
                        let mut stats = self.stats.lock().await;
                        stats.misses += 1;
                        stats.loads += 1;
                    }
                    let cache = self.clone();
                    // The computation runs detached: a caller dropping its
                    // watch on the result must not cancel the shared call.
                    tokio::spawn(async move {
                        let result = compute.await;
                        cache.finish(key, result).await;
                    });
                    rx
                }
            }
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::Cancelled),
        }
    }

    async fn finish(self: &Arc<Self>, key: CacheKey, result: Result<CacheValue, Error>) {
        let mut state = self.state.lock().await;
        let waiters = match state.map.remove(&key) {
            Some(Slot::InFlight(waiters)) => waiters,
            other => {
                // Invalidation raced with us; deliver, do not re-insert.
                if let Some(slot) = other {
                    state.map.insert(key.clone(), slot);
                }
                Vec::new()
            }
        };
        if let Ok(value) = &result {
            let weight = weight_of(value);
            let stamp = state.next_stamp;
            state.next_stamp += 1;
            state.map.insert(
                key.clone(),
                Slot::Ready {
                    value: value.clone(),
                    weight,
                    stamp,
                },
            );
            state.total_weight += weight;
            state.queue.push_back((key, stamp));
            evict_overflow(&mut state, self.capacity);
        }
        drop(state);
        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }

    /// Drops the entries of `repo` whose result was computed at the given
    /// head revision. Results pinned below it stay; revisions bound their
    /// freshness.
    pub(crate) async fn invalidate_at_head(&self, repo: &str, head: Revision) {
        let mut state = self.state.lock().await;
        let keys: Vec<CacheKey> = state
            .map
            .keys()
            .filter(|k| k.repo == repo && k.op.max_revision() == head)
            .cloned()
            .collect();
        for key in keys {
            remove_key(&mut state, &key);
        }
    }

    /// Drops every entry of `repo`.
    pub(crate) async fn invalidate_repo(&self, repo: &str) {
        let mut state = self.state.lock().await;
        let keys: Vec<CacheKey> = state
            .map
            .keys()
            .filter(|k| k.repo == repo)
            .cloned()
            .collect();
        for key in keys {
            remove_key(&mut state, &key);
        }
    }
}

fn remove_key(state: &mut CacheState, key: &CacheKey) {
    if let Some(Slot::Ready { weight, .. }) = state.map.get(key) {
        state.total_weight -= *weight;
        state.map.remove(key);
    }
    // In-flight computations are left to finish; their results are
    // revision-pinned and remain correct.
}

fn prune_stale_front(state: &mut CacheState) {
    while let Some((key, stamp)) = state.queue.front() {
        let stale = match state.map.get(key) {
            Some(Slot::Ready { stamp: current, .. }) => current != stamp,
            _ => true,
        };
        if stale {
            state.queue.pop_front();
        } else {
            break;
        }
    }
}

fn evict_overflow(state: &mut CacheState, capacity: usize) {
    while state.total_weight > capacity {
        let (key, stamp) = match state.queue.pop_front() {
            Some(front) => front,
            None => break,
        };
        let evict = match state.map.get(&key) {
            Some(Slot::Ready { stamp: current, .. }) => *current == stamp,
            _ => false,
        };
        if evict {
            if let Some(Slot::Ready { weight, .. }) = state.map.remove(&key) {
                state.total_weight -= weight;
            }
        }
    }
}

/// A [`Repository`] that answers reads from the shared cache and funnels
/// writes to the git engine, invalidating what the new head makes stale.
pub struct CachingRepository {
    delegate: Arc<GitRepository>,
    cache: Arc<RepositoryCache>,
    /// Cache key scope. The on-disk path is unique across projects even
    /// when repository names repeat.
    scope: String,
}

impl CachingRepository {
    pub fn new(delegate: Arc<GitRepository>, cache: Arc<RepositoryCache>) -> CachingRepository {
        let scope = delegate.path().display().to_string();
        CachingRepository {
            delegate,
            cache,
            scope,
        }
    }

    pub fn delegate(&self) -> &Arc<GitRepository> {
        &self.delegate
    }

    pub(crate) fn cache_scope(&self) -> &str {
        &self.scope
    }

    fn key(&self, op: CacheOp) -> CacheKey {
        CacheKey {
            repo: self.scope.clone(),
            op,
        }
    }
}

#[async_trait]
impl Repository for CachingRepository {
    fn name(&self) -> &str {
        self.delegate.name()
    }

    fn head(&self) -> Revision {
        self.delegate.head()
    }

    fn normalize(&self, revision: Revision) -> Result<Revision, Error> {
        self.delegate.normalize(revision)
    }

    fn info(&self) -> RepositoryInfo {
        self.delegate.info()
    }

    async fn find(
        &self,
        revision: Revision,
        path_pattern: &str,
        options: &FindOptions,
    ) -> Result<Vec<Entry>, Error> {
        let revision = self.normalize(revision)?;
        let key = self.key(CacheOp::Find {
            revision,
            pattern: path_pattern.to_string(),
            options: options.clone(),
        });
        let delegate = self.delegate.clone();
        let pattern = path_pattern.to_string();
        let options = options.clone();
        let value = self
            .cache
            .get_or_compute(key, async move {
                delegate
                    .find(revision, &pattern, &options)
                    .await
                    .map(CacheValue::Entries)
            })
            .await?;
        match value {
            CacheValue::Entries(entries) => Ok(entries),
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn list(&self, revision: Revision, path_pattern: &str) -> Result<Vec<ListEntry>, Error> {
        let revision = self.normalize(revision)?;
        let key = self.key(CacheOp::List {
            revision,
            pattern: path_pattern.to_string(),
        });
        let delegate = self.delegate.clone();
        let pattern = path_pattern.to_string();
        let value = self
            .cache
            .get_or_compute(key, async move {
                delegate
                    .list(revision, &pattern)
                    .await
                    .map(CacheValue::ListEntries)
            })
            .await?;
        match value {
            CacheValue::ListEntries(entries) => Ok(entries),
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn get(&self, revision: Revision, query: &Query) -> Result<Entry, Error> {
        let revision = self.normalize(revision)?;
        let key = self.key(CacheOp::Get {
            revision,
            query: query.clone(),
        });
        let delegate = self.delegate.clone();
        let query = query.clone();
        let path = query.path().to_string();
        let value = self
            .cache
            .get_or_compute(key, async move {
                match delegate.get(revision, &query).await {
                    Ok(entry) => Ok(CacheValue::Entry(entry)),
                    Err(Error::EntryNotFound { .. }) => Ok(CacheValue::Tombstone),
                    Err(e) => Err(e),
                }
            })
            .await?;
        match value {
            CacheValue::Entry(entry) => Ok(entry),
            CacheValue::Tombstone => Err(Error::entry_not_found(revision, &path)),
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn history(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
        max_commits: usize,
    ) -> Result<Vec<Commit>, Error> {
        let (from, to) = self.normalize_range(from, to)?;
        let key = self.key(CacheOp::History {
            from,
            to,
            pattern: path_pattern.to_string(),
        });
        let delegate = self.delegate.clone();
        let pattern = path_pattern.to_string();
        // The full walk is cached; any `max_commits` is a prefix of it.
        let value = self
            .cache
            .get_or_compute(key, async move {
                delegate
                    .history(from, to, &pattern, usize::MAX)
                    .await
                    .map(CacheValue::Commits)
            })
            .await?;
        match value {
            CacheValue::Commits(mut commits) => {
                commits.truncate(max_commits);
                Ok(commits)
            }
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn diff(
        &self,
        from: Revision,
        to: Revision,
        path_pattern: &str,
    ) -> Result<Vec<Change>, Error> {
        let (from, to) = self.normalize_range(from, to)?;
        let key = self.key(CacheOp::Diff {
            from,
            to,
            pattern: path_pattern.to_string(),
        });
        let delegate = self.delegate.clone();
        let pattern = path_pattern.to_string();
        let value = self
            .cache
            .get_or_compute(key, async move {
                delegate
                    .diff(from, to, &pattern)
                    .await
                    .map(CacheValue::Changes)
            })
            .await?;
        match value {
            CacheValue::Changes(changes) => Ok(changes),
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn diff_file(
        &self,
        from: Revision,
        to: Revision,
        query: &Query,
    ) -> Result<Option<Change>, Error> {
        let (from, to) = self.normalize_range(from, to)?;
        let key = self.key(CacheOp::DiffFile {
            from,
            to,
            query: query.clone(),
        });
        let delegate = self.delegate.clone();
        let query = query.clone();
        let value = self
            .cache
            .get_or_compute(key, async move {
                delegate
                    .diff_file(from, to, &query)
                    .await
                    .map(CacheValue::MaybeChange)
            })
            .await?;
        match value {
            CacheValue::MaybeChange(change) => Ok(change),
            _ => Err(Error::Storage("unexpected cache value".to_string())),
        }
    }

    async fn commit(
        &self,
        base_revision: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
        options: CommitOptions,
    ) -> Result<CommitResult, Error> {
        let result = self
            .delegate
            .commit(base_revision, author, message, changes, options)
            .await?;
        // Entries computed at the old head are stale for HEAD-shaped
        // requests now; pinned older revisions stay valid.
        self.cache
            .invalidate_at_head(&self.scope, result.revision.backward())
            .await;
        Ok(result)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::EntryContent;
    use serde_json::json;

    async fn fixture(dir: &std::path::Path) -> (Arc<GitRepository>, Arc<RepositoryCache>) {
        let repo = Arc::new(
            GitRepository::create(&dir.join("r.git"), "r", &Author::new("a", "a@a")).unwrap(),
        );
        repo.commit(
            Revision::HEAD,
            Author::new("a", "a@a"),
            CommitMessage::only_summary("seed"),
            vec![Change::upsert_json("/foo.json", json!({"a": "b"}))],
            CommitOptions::default(),
        )
        .await
        .unwrap();
        (repo, RepositoryCache::new(1 << 20))
    }

    #[tokio::test]
    async fn test_head_and_normalized_share_one_load() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, cache) = fixture(dir.path()).await;
        let caching = CachingRepository::new(repo, cache.clone());
        let q = Query::of_json("/foo.json").unwrap();

        let a = caching.get(Revision::HEAD, &q).await.unwrap();
        let b = caching.get(Revision::from(2), &q).await.unwrap();
        assert_eq!(a, b);
        let stats = cache.stats().await;
        assert_eq!(stats.loads, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_concurrent_identical_reads_single_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, cache) = fixture(dir.path()).await;
        let caching = Arc::new(CachingRepository::new(repo, cache.clone()));
        let q = Query::of_json("/foo.json").unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let caching = caching.clone();
            let q = q.clone();
            tasks.push(tokio::spawn(async move {
                caching.get(Revision::HEAD, &q).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert_eq!(cache.stats().await.loads, 1);
    }

    #[tokio::test]
    async fn test_missing_entry_tombstoned() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, cache) = fixture(dir.path()).await;
        let caching = CachingRepository::new(repo, cache.clone());
        let q = Query::of_json("/absent.json").unwrap();

        for _ in 0..3 {
            let err = caching.get(Revision::HEAD, &q).await.unwrap_err();
            assert!(matches!(err, Error::EntryNotFound { .. }));
        }
        assert_eq!(cache.stats().await.loads, 1);
    }

    #[tokio::test]
    async fn test_commit_invalidates_head_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, cache) = fixture(dir.path()).await;
        let caching = CachingRepository::new(repo, cache.clone());
        let q = Query::of_json("/foo.json").unwrap();

        // Pin revision 2 and the head-shaped read (also revision 2 now).
        caching.get(Revision::from(2), &q).await.unwrap();
        caching
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                CommitMessage::only_summary("update"),
                vec![Change::upsert_json("/foo.json", json!({"a": "c"}))],
                CommitOptions::default(),
            )
            .await
            .unwrap();

        let fresh = caching.get(Revision::HEAD, &q).await.unwrap();
        assert_eq!(fresh.content, EntryContent::Json(json!({"a": "c"})));
        // The rev-2 entry was computed at the old head and re-loads; the
        // new head load is the second since the seed read.
        let stats = cache.stats().await;
        assert_eq!(stats.loads, 2);
    }

    #[tokio::test]
    async fn test_history_prefix_served_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, cache) = fixture(dir.path()).await;
        let caching = CachingRepository::new(repo, cache.clone());

        let full = caching
            .history(Revision::HEAD, Revision::INIT, "/**", 100)
            .await
            .unwrap();
        assert_eq!(full.len(), 2);
        let capped = caching
            .history(Revision::HEAD, Revision::INIT, "/**", 1)
            .await
            .unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(cache.stats().await.loads, 1);
    }

    #[tokio::test]
    async fn test_weight_bound_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let (repo, _) = fixture(dir.path()).await;
        // A cache too small for two entries.
        let cache = RepositoryCache::new(96);
        let caching = CachingRepository::new(repo, cache.clone());
        let q = Query::of_json("/foo.json").unwrap();

        caching.get(Revision::from(2), &q).await.unwrap();
        caching.get(Revision::from(1), &Query::identity("/foo.json").unwrap()).await.unwrap_err();
        caching.get(Revision::from(2), &q).await.unwrap();
        // Everything kept falling out, so each read loaded.
        assert_eq!(cache.stats().await.loads, 3);
    }
}
