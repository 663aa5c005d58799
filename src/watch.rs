//! The watch engine.
//!
//! A watcher names a baseline revision and either a path pattern or a
//! query. If a matching commit past the baseline already exists, the
//! smallest one answers immediately; otherwise the watcher parks in the
//! repository's FIFO waiter list and is signalled at most once by the first
//! matching commit. Waiters hold commit metadata only; content is fetched
//! through the caching layer after the watcher fires. A timeout answers
//! `Ok(None)` and dropping the future cancels the watch: a cancelled
//! watcher is never signalled.
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{oneshot, Mutex};

use crate::model::{
    Commit, EntryContent, Query, Revision, WatchFileResult, Watchable,
};
use crate::path::PathPattern;
use crate::storage::{CachingRepository, Repository};
use crate::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DELAY_ON_SUCCESS: Duration = Duration::from_secs(1);
const MAX_FAILED_COUNT: usize = 5; // Max base wait time 2 << 5 = 64 secs
const JITTER_RATE: f32 = 0.2;

enum WatchTarget {
    Pattern(PathPattern),
    Query {
        query: Query,
        /// Last known query result; `None` while the entry does not exist.
        baseline: Option<EntryContent>,
    },
}

struct Waiter {
    target: WatchTarget,
    tx: oneshot::Sender<Commit>,
}

/// Per-repository waiter lists plus the server-wide timeout clamp.
pub struct WatchManager {
    max_timeout: Duration,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
}

impl WatchManager {
    pub fn new(max_timeout: Duration) -> Arc<WatchManager> {
        Arc::new(WatchManager {
            max_timeout,
            waiters: Mutex::new(HashMap::new()),
        })
    }

    /// Waits for the first commit after `baseline` that touches
    /// `path_pattern`. `Ok(None)` on timeout.
    pub async fn watch_repo(
        &self,
        repo: &Arc<CachingRepository>,
        baseline: Revision,
        path_pattern: &str,
        timeout: Duration,
    ) -> Result<Option<Commit>, Error> {
        let pattern = PathPattern::new(path_pattern)?;
        let baseline = repo.normalize(baseline)?;

        // Answer from history when the head is already past the baseline.
        let head = repo.head();
        if head > baseline {
            let commits = repo
                .history(baseline.forward(), head, path_pattern, 1)
                .await?;
            if let Some(commit) = commits.into_iter().next() {
                return Ok(Some(commit));
            }
        }

        let rx = self
            .park(repo, WatchTarget::Pattern(pattern))
            .await;
        // A commit may have slipped in between the scan and the
        // registration; the notifier could not have seen this waiter.
        let head_after = repo.head();
        if head_after > head {
            let commits = repo
                .history(head.forward(), head_after, path_pattern, 1)
                .await?;
            if let Some(commit) = commits.into_iter().next() {
                return Ok(Some(commit));
            }
        }
        self.await_signal(repo, rx, timeout).await
    }

    /// Waits until the result of `query` differs from its value at
    /// `baseline`, returning the commit that changed it. `Ok(None)` on
    /// timeout.
    pub async fn watch_query(
        &self,
        repo: &Arc<CachingRepository>,
        baseline: Revision,
        query: &Query,
        timeout: Duration,
    ) -> Result<Option<Commit>, Error> {
        let baseline = repo.normalize(baseline)?;
        let base_result = query_result(repo, baseline, query).await?;

        let head = repo.head();
        if head > baseline {
            let candidates = repo
                .history(baseline.forward(), head, query.path(), usize::MAX)
                .await?;
            for commit in candidates {
                if query_result(repo, commit.revision, query).await? != base_result {
                    return Ok(Some(commit));
                }
            }
        }

        let rx = self
            .park(
                repo,
                WatchTarget::Query {
                    query: query.clone(),
                    baseline: base_result.clone(),
                },
            )
            .await;
        // Close the scan-to-registration gap, as in watch_repo.
        let head_after = repo.head();
        if head_after > head {
            let candidates = repo
                .history(head.forward(), head_after, query.path(), usize::MAX)
                .await?;
            for commit in candidates {
                if query_result(repo, commit.revision, query).await? != base_result {
                    return Ok(Some(commit));
                }
            }
        }
        self.await_signal(repo, rx, timeout).await
    }

    async fn park(
        &self,
        repo: &Arc<CachingRepository>,
        target: WatchTarget,
    ) -> oneshot::Receiver<Commit> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.waiters.lock().await;
        waiters
            .entry(repo.cache_scope().to_string())
            .or_insert_with(Vec::new)
            .push(Waiter { target, tx });
        rx
    }

    async fn await_signal(
        &self,
        repo: &Arc<CachingRepository>,
        rx: oneshot::Receiver<Commit>,
        timeout: Duration,
    ) -> Result<Option<Commit>, Error> {
        // A longer client timeout is clamped silently.
        let timeout = timeout.min(self.max_timeout);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(commit)) => Ok(Some(commit)),
            // The waiter was dropped wholesale (repository removed).
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                // Timed out: the waiter must not fire later. Dropping the
                // receiver makes any subsequent signal a no-op, and the
                // dead waiter is reaped on the next notification.
                self.reap_closed(repo.cache_scope()).await;
                Ok(None)
            }
        }
    }

    async fn reap_closed(&self, scope: &str) {
        let mut waiters = self.waiters.lock().await;
        if let Some(list) = waiters.get_mut(scope) {
            list.retain(|w| !w.tx.is_closed());
            if list.is_empty() {
                waiters.remove(scope);
            }
        }
    }

    /// Called after a successful commit: walks the repository's waiters in
    /// arrival order and signals every match exactly once.
    pub(crate) async fn notify(
        &self,
        repo: &Arc<CachingRepository>,
        commit: &Commit,
        changed_paths: &[String],
    ) {
        let mut waiters = self.waiters.lock().await;
        let list = match waiters.get_mut(repo.cache_scope()) {
            Some(list) => list,
            None => return,
        };
        let mut kept = Vec::with_capacity(list.len());
        for mut waiter in list.drain(..) {
            if waiter.tx.is_closed() {
                continue; // cancelled or timed out
            }
            let fire = match &mut waiter.target {
                WatchTarget::Pattern(pattern) => {
                    changed_paths.iter().any(|p| pattern.matches(p))
                }
                WatchTarget::Query { query, baseline } => {
                    if !changed_paths.iter().any(|p| p == query.path()) {
                        false
                    } else {
                        match query_result(repo, commit.revision, query).await {
                            Ok(result) if &result != baseline => true,
                            Ok(result) => {
                                // The file changed but the queried value did
                                // not; keep waiting from the new content.
                                *baseline = result;
                                false
                            }
                            Err(e) => {
                                log::warn!(
                                    "failed to evaluate watch query for {}: {}",
                                    query.path(),
                                    e
                                );
                                false
                            }
                        }
                    }
                }
            };
            if fire {
                let _ = waiter.tx.send(commit.clone());
            } else {
                kept.push(waiter);
            }
        }
        *list = kept;
    }

    /// Drops every waiter of a repository; their watchers observe
    /// cancellation.
    pub(crate) async fn remove_repository(&self, scope: &str) {
        self.waiters.lock().await.remove(scope);
    }

    #[cfg(test)]
    async fn waiter_count(&self, scope: &str) -> usize {
        self.waiters
            .lock()
            .await
            .get(scope)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

async fn query_result(
    repo: &Arc<CachingRepository>,
    revision: Revision,
    query: &Query,
) -> Result<Option<EntryContent>, Error> {
    match repo.get(revision, query).await {
        Ok(entry) => Ok(Some(entry.content)),
        Err(Error::EntryNotFound { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}

fn delay_time_for(failed_count: usize) -> Duration {
    let base_time_ms = (2u64 << failed_count) * 1000;
    let jitter = (fastrand::f32() * JITTER_RATE * base_time_ms as f32) as u64;

    Duration::from_millis(base_time_ms + jitter)
}

struct StreamState<F> {
    manager: Arc<WatchManager>,
    repo: Arc<CachingRepository>,
    fetch: F,
    last_known_revision: Option<Revision>,
    failed_count: usize,
    success_delay: Option<Duration>,
}

fn watch_stream<D, F, Fut>(
    manager: Arc<WatchManager>,
    repo: Arc<CachingRepository>,
    fetch: F,
) -> impl Stream<Item = D> + Send
where
    D: Watchable + 'static,
    F: Fn(Arc<WatchManager>, Arc<CachingRepository>, Revision) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Option<D>, Error>> + Send,
{
    let init_state = StreamState {
        manager,
        repo,
        fetch,
        last_known_revision: None,
        failed_count: 0,
        success_delay: None,
    };
    futures::stream::unfold(init_state, |mut state| async move {
        if let Some(d) = state.success_delay.take() {
            tokio::time::sleep(d).await;
        }
        loop {
            let baseline = match state.last_known_revision {
                Some(revision) => revision,
                None => state.repo.head(),
            };
            let result =
                (state.fetch)(state.manager.clone(), state.repo.clone(), baseline).await;
            let next_delay = match result {
                Ok(Some(watch_result)) => {
                    state.last_known_revision = Some(watch_result.revision());
                    state.failed_count = 0;
                    state.success_delay = Some(DELAY_ON_SUCCESS);

                    return Some((watch_result, state));
                }
                Ok(None) => {
                    state.failed_count = 0;
                    Duration::from_secs(1)
                }
                Err(e) => {
                    log::debug!("watch error: {}", e);
                    if state.failed_count < MAX_FAILED_COUNT {
                        state.failed_count += 1;
                    }
                    delay_time_for(state.failed_count)
                }
            };
            tokio::time::sleep(next_delay).await;
        }
    })
}

/// A stream of commits touching `path_pattern`, starting from the current
/// head.
pub fn watch_repo_stream(
    manager: Arc<WatchManager>,
    repo: Arc<CachingRepository>,
    path_pattern: &str,
) -> Result<Pin<Box<dyn Stream<Item = Commit> + Send>>, Error> {
    PathPattern::new(path_pattern)?;
    let pattern = path_pattern.to_string();
    Ok(watch_stream(manager, repo, move |manager, repo, baseline| {
        let pattern = pattern.clone();
        async move {
            manager
                .watch_repo(&repo, baseline, &pattern, DEFAULT_TIMEOUT)
                .await
        }
    })
    .boxed())
}

/// A stream of [`WatchFileResult`]s produced whenever the query result
/// changes.
pub fn watch_file_stream(
    manager: Arc<WatchManager>,
    repo: Arc<CachingRepository>,
    query: &Query,
) -> Result<Pin<Box<dyn Stream<Item = WatchFileResult> + Send>>, Error> {
    let query = query.clone();
    Ok(watch_stream(manager, repo, move |manager, repo, baseline| {
        let query = query.clone();
        async move {
            match manager
                .watch_query(&repo, baseline, &query, DEFAULT_TIMEOUT)
                .await?
            {
                None => Ok(None),
                Some(commit) => {
                    let entry = repo.get(commit.revision, &query).await?;
                    Ok(Some(WatchFileResult {
                        revision: commit.revision,
                        entry,
                    }))
                }
            }
        }
    })
    .boxed())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::{Author, Change, CommitMessage};
    use crate::storage::{CommitOptions, GitRepository, RepositoryCache};
    use serde_json::json;

    async fn fixture(dir: &std::path::Path) -> (Arc<WatchManager>, Arc<CachingRepository>) {
        let repo = Arc::new(
            GitRepository::create(&dir.join("r.git"), "r", &Author::new("a", "a@a")).unwrap(),
        );
        let caching = Arc::new(CachingRepository::new(repo, RepositoryCache::new(1 << 20)));
        (WatchManager::new(Duration::from_secs(60)), caching)
    }

    async fn push(
        manager: &Arc<WatchManager>,
        repo: &Arc<CachingRepository>,
        path: &str,
        value: serde_json::Value,
    ) -> Commit {
        let result = repo
            .commit(
                Revision::HEAD,
                Author::new("a", "a@a"),
                CommitMessage::only_summary(&format!("update {}", path)),
                vec![Change::upsert_json(path, value)],
                CommitOptions::default(),
            )
            .await
            .unwrap();
        let commit = Commit {
            revision: result.revision,
            author: Author::new("a", "a@a"),
            commit_message: CommitMessage::only_summary("x"),
            pushed_at: Some(result.pushed_at.clone()),
        };
        manager.notify(repo, &commit, &result.changed_paths).await;
        commit
    }

    #[tokio::test]
    async fn test_immediate_answer_with_smallest_match() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;
        push(&manager, &repo, "/foo.json", json!(1)).await; // rev 2
        push(&manager, &repo, "/foo.json", json!(2)).await; // rev 3

        let got = manager
            .watch_repo(&repo, Revision::INIT, "/foo.json", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.revision, Revision::from(2));
    }

    #[tokio::test]
    async fn test_parked_watcher_ignores_unrelated_commit() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;

        let m = manager.clone();
        let r = repo.clone();
        let watcher = tokio::spawn(async move {
            m.watch_repo(&r, Revision::HEAD, "/foo.json", Duration::from_secs(10))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        push(&manager, &repo, "/bar.json", json!(1)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watcher.is_finished());

        let fired = push(&manager, &repo, "/foo.json", json!(1)).await;
        let got = watcher.await.unwrap().unwrap().unwrap();
        assert_eq!(got.revision, fired.revision);
    }

    #[tokio::test]
    async fn test_timeout_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;
        let got = manager
            .watch_repo(&repo, Revision::HEAD, "/**", Duration::from_millis(100))
            .await
            .unwrap();
        assert!(got.is_none());
        // The dead waiter is gone after the next notification.
        push(&manager, &repo, "/foo.json", json!(1)).await;
        assert_eq!(manager.waiter_count(repo.cache_scope()).await, 0);
    }

    #[tokio::test]
    async fn test_cancelled_watch_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;

        let m = manager.clone();
        let r = repo.clone();
        let watcher = tokio::spawn(async move {
            m.watch_repo(&r, Revision::HEAD, "/**", Duration::from_secs(30)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        watcher.abort();
        let _ = watcher.await;

        // The commit after cancellation signals nobody and reaps the dead
        // waiter.
        push(&manager, &repo, "/foo.json", json!(1)).await;
        assert_eq!(manager.waiter_count(repo.cache_scope()).await, 0);
    }

    #[tokio::test]
    async fn test_query_watch_fires_on_result_change_only() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;
        push(&manager, &repo, "/foo.json", json!({"watched": 1, "other": 1})).await;

        let query = Query::of_json_path("/foo.json", vec!["$.watched".to_string()]).unwrap();
        let m = manager.clone();
        let r = repo.clone();
        let q = query.clone();
        let watcher = tokio::spawn(async move {
            m.watch_query(&r, Revision::HEAD, &q, Duration::from_secs(10)).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Same queried value: no fire.
        push(&manager, &repo, "/foo.json", json!({"watched": 1, "other": 2})).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!watcher.is_finished());

        let fired = push(&manager, &repo, "/foo.json", json!({"watched": 2, "other": 2})).await;
        let got = watcher.await.unwrap().unwrap().unwrap();
        assert_eq!(got.revision, fired.revision);
    }

    #[tokio::test]
    async fn test_repo_stream_delivers_commits() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, repo) = fixture(dir.path()).await;
        let stream = watch_repo_stream(manager.clone(), repo.clone(), "/foo.json").unwrap();
        tokio::pin!(stream);

        let m = manager.clone();
        let r = repo.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            push(&m, &r, "/foo.json", json!(1)).await;
        });

        let first = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.revision, Revision::from(2));
    }
}
