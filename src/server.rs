//! Server configuration and wiring.
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::cluster::{ClusterCoordinator, Membership};
use crate::command::{Command, CommandExecutor, CommandResult, ServerStatus, StatusScope};
use crate::mirror::{MirroringOptions, MirroringService};
use crate::model::{Commit, Query, Revision, WatchFileResult};
use crate::project::ProjectManager;
use crate::storage::{CacheStats, CachingRepository, Repository, RepositoryCache};
use crate::watch::{watch_file_stream, watch_repo_stream, WatchManager};
use crate::Error;

/// Configuration the host hands to [`CentralDogma::open`]. Every field has
/// a default; environment variables play no part.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CentralDogmaConfig {
    /// Where projects, repositories, mirror workspaces and `status.json`
    /// live.
    pub data_dir: PathBuf,
    pub cache_capacity_bytes: usize,
    /// Upper bound on watch timeouts; longer client timeouts are clamped.
    pub max_watch_timeout_millis: u64,
    pub num_mirroring_threads: usize,
    pub max_num_files_per_mirror: usize,
    pub max_num_bytes_per_mirror: u64,
    pub mirror_tick_interval_millis: u64,
    /// Availability zone of this node; `None` runs standalone.
    pub zone: Option<String>,
}

impl Default for CentralDogmaConfig {
    fn default() -> Self {
        CentralDogmaConfig {
            data_dir: PathBuf::from("data"),
            cache_capacity_bytes: 64 * 1024 * 1024,
            max_watch_timeout_millis: 60 * 60 * 1000,
            num_mirroring_threads: 16,
            max_num_files_per_mirror: 8192,
            max_num_bytes_per_mirror: 32 * 1024 * 1024,
            mirror_tick_interval_millis: 1000,
            zone: None,
        }
    }
}

/// The assembled engine: storage, cache, watch, command executor, mirrors
/// and zone leadership, wired the way a transport expects to use them.
pub struct CentralDogma {
    config: CentralDogmaConfig,
    projects: Arc<ProjectManager>,
    cache: Arc<RepositoryCache>,
    watch: Arc<WatchManager>,
    executor: Arc<CommandExecutor>,
    mirroring: Arc<MirroringService>,
    coordinator: Arc<ClusterCoordinator>,
    _membership: Option<Membership>,
}

impl CentralDogma {
    pub async fn open(config: CentralDogmaConfig) -> Result<CentralDogma, Error> {
        std::fs::create_dir_all(&config.data_dir)?;
        let cache = RepositoryCache::new(config.cache_capacity_bytes);
        let projects = Arc::new(ProjectManager::open(&config.data_dir, cache.clone()).await?);
        let watch = WatchManager::new(Duration::from_millis(config.max_watch_timeout_millis));
        let executor = CommandExecutor::start(projects.clone(), watch.clone(), &config.data_dir)?;
        let mirroring = MirroringService::start(
            projects.clone(),
            executor.clone(),
            MirroringOptions {
                work_dir: config.data_dir.join("_mirrors"),
                num_mirroring_threads: config.num_mirroring_threads,
                max_num_files_per_mirror: config.max_num_files_per_mirror,
                max_num_bytes_per_mirror: config.max_num_bytes_per_mirror,
                tick_interval: Duration::from_millis(config.mirror_tick_interval_millis),
                // A zoned node mirrors only once its zone elects it.
                initially_leading: config.zone.is_none(),
            },
        );
        let coordinator = ClusterCoordinator::new();
        let membership = config.zone.as_ref().map(|zone| {
            coordinator.join(
                zone,
                &format!("node-{}", std::process::id()),
                mirroring.leader_listener(),
            )
        });
        log::info!(
            "CentralDogma opened at {} (zone: {:?})",
            config.data_dir.display(),
            config.zone
        );
        Ok(CentralDogma {
            config,
            projects,
            cache,
            watch,
            executor,
            mirroring,
            coordinator,
            _membership: membership,
        })
    }

    pub fn config(&self) -> &CentralDogmaConfig {
        &self.config
    }

    /// Applies a mutation through the totally-ordered executor.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
        self.executor.execute(command).await
    }

    /// The cached handle all reads of `project`/`repo` go through.
    pub async fn repo(&self, project: &str, repo: &str) -> Result<Arc<CachingRepository>, Error> {
        self.projects.repo(project, repo).await
    }

    pub fn projects(&self) -> &Arc<ProjectManager> {
        &self.projects
    }

    pub fn mirroring(&self) -> &Arc<MirroringService> {
        &self.mirroring
    }

    pub fn cluster(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    pub fn status(&self) -> ServerStatus {
        self.executor.status()
    }

    pub async fn update_status(
        &self,
        patch: &serde_json::Value,
        scope: StatusScope,
    ) -> Result<Option<ServerStatus>, Error> {
        self.executor.update_status(patch, scope).await
    }

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Long-polls for the next commit after `baseline` touching
    /// `path_pattern`. `Ok(None)` on timeout.
    pub async fn watch_repo(
        &self,
        project: &str,
        repo: &str,
        baseline: Revision,
        path_pattern: &str,
        timeout: Duration,
    ) -> Result<Option<Commit>, Error> {
        let handle = self.repo(project, repo).await?;
        self.watch
            .watch_repo(&handle, baseline, path_pattern, timeout)
            .await
    }

    /// Long-polls until the query result changes from its value at
    /// `baseline`. `Ok(None)` on timeout.
    pub async fn watch_file(
        &self,
        project: &str,
        repo: &str,
        baseline: Revision,
        query: &Query,
        timeout: Duration,
    ) -> Result<Option<WatchFileResult>, Error> {
        let handle = self.repo(project, repo).await?;
        match self.watch.watch_query(&handle, baseline, query, timeout).await? {
            None => Ok(None),
            Some(commit) => {
                let entry = handle.get(commit.revision, query).await?;
                Ok(Some(WatchFileResult {
                    revision: commit.revision,
                    entry,
                }))
            }
        }
    }

    /// An endless stream of commits touching `path_pattern`.
    pub async fn watch_repo_stream(
        &self,
        project: &str,
        repo: &str,
        path_pattern: &str,
    ) -> Result<Pin<Box<dyn Stream<Item = Commit> + Send>>, Error> {
        let handle = self.repo(project, repo).await?;
        watch_repo_stream(self.watch.clone(), handle, path_pattern)
    }

    /// An endless stream of query results, one per change.
    pub async fn watch_file_stream(
        &self,
        project: &str,
        repo: &str,
        query: &Query,
    ) -> Result<Pin<Box<dyn Stream<Item = WatchFileResult> + Send>>, Error> {
        let handle = self.repo(project, repo).await?;
        watch_file_stream(self.watch.clone(), handle, query)
    }
}
