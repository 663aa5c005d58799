//! The periodic Git mirror engine.
//!
//! Mirror specs live in each project's `meta:/mirrors.json`, credentials in
//! `meta:/credentials.json`; both are read through the caching layer on
//! every scheduling pass, so committing a config change takes effect on the
//! next tick. Mirrors fire on six-field cron schedules, run on a bounded
//! worker pool, and are single-flight per mirror id. Only the zone leader
//! schedules; losing leadership cancels in-flight work at the safe
//! checkpoints (between fetch and commit, between commit and push).
mod cron;
mod credential;
mod git;

pub use credential::{Credential, CredentialKind};
pub use cron::CronSchedule;
pub use git::MirrorRemote;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};

use crate::command::{Command, CommandExecutor};
use crate::model::{Author, Change, CommitMessage, EntryContent, EntryType, Query, Revision};
use crate::project::ProjectManager;
use crate::storage::{FindOptions, Repository};
use crate::Error;

const DEFAULT_SCHEDULE: &str = "0 * * * * ?";
const MIRROR_STATE_PATH: &str = "/mirror_state.json";
const ACCESS_CONTROL_PATH: &str = "/mirror_access_control.json";
const MIRRORS_PATH: &str = "/mirrors.json";
const CREDENTIALS_PATH: &str = "/credentials.json";
const MAX_PUSH_ATTEMPTS: usize = 3;

/// Which way a mirror synchronizes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MirrorDirection {
    RemoteToLocal,
    LocalToRemote,
}

/// Gitignore contents in a mirror spec: a whole file or individual lines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum GitignoreSpec {
    Text(String),
    Lines(Vec<String>),
}

impl GitignoreSpec {
    pub fn lines(&self) -> Vec<String> {
        match self {
            GitignoreSpec::Text(text) => text.lines().map(|l| l.to_string()).collect(),
            GitignoreSpec::Lines(lines) => lines.clone(),
        }
    }
}

/// One entry of `meta:/mirrors.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSpec {
    pub id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Six-field cron schedule; every minute when omitted.
    #[serde(default)]
    pub schedule: Option<String>,
    pub direction: MirrorDirection,
    pub local_repo: String,
    /// Directory inside the local repository, `/` when omitted.
    #[serde(default)]
    pub local_path: Option<String>,
    pub remote_uri: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub gitignore: Option<GitignoreSpec>,
}

fn default_true() -> bool {
    true
}

/// One entry of the server-wide mirror access control list, stored at
/// `dogma:/mirror_access_control.json` of the internal project.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MirrorAccessControl {
    #[serde(default)]
    pub id: Option<String>,
    /// Regular expression over the mirror's remote URI.
    pub target_pattern: String,
    pub allow: bool,
    pub order: i64,
    #[serde(default)]
    pub description: Option<String>,
}

/// First matching rule in ascending `order` wins; no rule means allowed.
pub(crate) fn mirror_allowed(rules: &[MirrorAccessControl], remote_uri: &str) -> bool {
    let mut sorted: Vec<&MirrorAccessControl> = rules.iter().collect();
    sorted.sort_by_key(|r| r.order);
    for rule in sorted {
        match regex::Regex::new(&rule.target_pattern) {
            Ok(re) if re.is_match(remote_uri) => return rule.allow,
            Ok(_) => {}
            Err(e) => {
                log::warn!("bad access control pattern '{}': {}", rule.target_pattern, e);
            }
        }
    }
    true
}

/// What a finished mirror pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// Content moved.
    Synced,
    /// Both sides already agreed; no commit, no push.
    UpToDate,
}

/// In-process observer of mirror lifecycle and execution.
pub trait MirrorListener: Send + Sync {
    fn on_create(&self, _project: &str, _mirror: &MirrorSpec) {}
    fn on_update(&self, _project: &str, _mirror: &MirrorSpec) {}
    fn on_run(&self, _project: &str, _mirror_id: &str) {}
    fn on_complete(&self, _project: &str, _mirror_id: &str, _result: &Result<MirrorOutcome, Error>) {
    }
}

pub struct MirroringOptions {
    pub work_dir: PathBuf,
    pub num_mirroring_threads: usize,
    pub max_num_files_per_mirror: usize,
    pub max_num_bytes_per_mirror: u64,
    pub tick_interval: Duration,
    /// Standalone servers lead from the start; clustered ones wait for
    /// election.
    pub initially_leading: bool,
}

impl Default for MirroringOptions {
    fn default() -> Self {
        MirroringOptions {
            work_dir: PathBuf::from("_mirrors"),
            num_mirroring_threads: 16,
            max_num_files_per_mirror: 8192,
            max_num_bytes_per_mirror: 32 * 1024 * 1024,
            tick_interval: Duration::from_secs(1),
            initially_leading: true,
        }
    }
}

/// The scheduler and runner of every configured mirror.
pub struct MirroringService {
    projects: Arc<ProjectManager>,
    executor: Arc<CommandExecutor>,
    work_dir: PathBuf,
    max_files: usize,
    max_bytes: u64,
    semaphore: Arc<Semaphore>,
    leading: Arc<AtomicBool>,
    running: Mutex<HashSet<String>>,
    schedules: Mutex<HashMap<String, (String, Option<DateTime<Utc>>)>>,
    known: Mutex<HashMap<String, MirrorSpec>>,
    listeners: std::sync::Mutex<Vec<Arc<dyn MirrorListener>>>,
}

impl MirroringService {
    pub fn start(
        projects: Arc<ProjectManager>,
        executor: Arc<CommandExecutor>,
        options: MirroringOptions,
    ) -> Arc<MirroringService> {
        let service = Arc::new(MirroringService {
            projects,
            executor,
            work_dir: options.work_dir,
            max_files: options.max_num_files_per_mirror,
            max_bytes: options.max_num_bytes_per_mirror,
            semaphore: Arc::new(Semaphore::new(options.num_mirroring_threads.max(1))),
            leading: Arc::new(AtomicBool::new(options.initially_leading)),
            running: Mutex::new(HashSet::new()),
            schedules: Mutex::new(HashMap::new()),
            known: Mutex::new(HashMap::new()),
            listeners: std::sync::Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&service);
        let tick_interval = options.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                let service = match weak.upgrade() {
                    Some(service) => service,
                    None => break,
                };
                if !service.leading.load(Ordering::SeqCst) {
                    continue;
                }
                service.tick().await;
            }
        });
        service
    }

    pub fn add_listener(&self, listener: Arc<dyn MirrorListener>) {
        self.listeners.lock().expect("listeners lock").push(listener);
    }

    /// A [`crate::cluster::LeaderListener`] driving this service: mirrors
    /// run only while this node leads its zone.
    pub fn leader_listener(self: &Arc<Self>) -> Arc<dyn crate::cluster::LeaderListener> {
        struct Hook(std::sync::Weak<MirroringService>);
        impl crate::cluster::LeaderListener for Hook {
            fn on_elected(&self) {
                if let Some(service) = self.0.upgrade() {
                    log::info!("mirroring enabled: this node leads its zone");
                    service.leading.store(true, Ordering::SeqCst);
                }
            }
            fn on_revoked(&self) {
                if let Some(service) = self.0.upgrade() {
                    log::info!("mirroring disabled: zone leadership lost");
                    service.leading.store(false, Ordering::SeqCst);
                }
            }
        }
        Arc::new(Hook(Arc::downgrade(self)))
    }

    fn check_leadership(&self) -> Result<(), Error> {
        if self.leading.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Mirror specs of a project, as currently committed.
    pub async fn list_mirrors(&self, project: &str) -> Result<Vec<MirrorSpec>, Error> {
        let meta = self.projects.repo(project, "meta").await?;
        let query = Query::of_json(MIRRORS_PATH).expect("static path");
        match meta.get(Revision::HEAD, &query).await {
            Ok(entry) => match entry.content {
                EntryContent::Json(value) => serde_json::from_value(value)
                    .map_err(|e| Error::Mirror(format!("malformed {}: {}", MIRRORS_PATH, e))),
                _ => Ok(Vec::new()),
            },
            Err(Error::EntryNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn credentials(&self, project: &str) -> Result<Vec<Credential>, Error> {
        let meta = self.projects.repo(project, "meta").await?;
        let query = Query::of_json(CREDENTIALS_PATH).expect("static path");
        match meta.get(Revision::HEAD, &query).await {
            Ok(entry) => match entry.content {
                EntryContent::Json(value) => serde_json::from_value(value)
                    .map_err(|e| Error::Mirror(format!("malformed {}: {}", CREDENTIALS_PATH, e))),
                _ => Ok(Vec::new()),
            },
            Err(Error::EntryNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn access_rules(&self) -> Result<Vec<MirrorAccessControl>, Error> {
        let dogma = self
            .projects
            .repo(crate::project::INTERNAL_PROJECT, "dogma")
            .await?;
        let query = Query::of_json(ACCESS_CONTROL_PATH).expect("static path");
        match dogma.get(Revision::HEAD, &query).await {
            Ok(entry) => match entry.content {
                EntryContent::Json(value) => serde_json::from_value(value).map_err(|e| {
                    Error::Mirror(format!("malformed {}: {}", ACCESS_CONTROL_PATH, e))
                }),
                _ => Ok(Vec::new()),
            },
            Err(Error::EntryNotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn tick(self: &Arc<Self>) {
        let rules = match self.access_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                log::warn!("failed to load mirror access control: {}", e);
                return;
            }
        };
        for project in self.projects.list_projects().await {
            let specs = match self.list_mirrors(&project.name).await {
                Ok(specs) => specs,
                Err(e) => {
                    log::warn!("skipping mirrors of {}: {}", project.name, e);
                    continue;
                }
            };
            for spec in specs {
                let key = format!("{}/{}", project.name, spec.id);
                self.emit_spec_events(&project.name, &key, &spec);
                if !spec.enabled || !mirror_allowed(&rules, &spec.remote_uri) {
                    continue;
                }
                if self.due(&key, &spec).await {
                    self.spawn_run(project.name.clone(), spec.clone(), key).await;
                }
            }
        }
    }

    fn emit_spec_events(&self, project: &str, key: &str, spec: &MirrorSpec) {
        let event = {
            let mut known = match self.known.try_lock() {
                Ok(known) => known,
                Err(_) => return,
            };
            let created = !known.contains_key(key);
            let changed = known.get(key).map(|previous| previous != spec).unwrap_or(true);
            if changed {
                known.insert(key.to_string(), spec.clone());
                Some(created)
            } else {
                None
            }
        };
        if let Some(created) = event {
            let listeners = self.listeners.lock().expect("listeners lock").clone();
            for listener in listeners {
                if created {
                    listener.on_create(project, spec);
                } else {
                    listener.on_update(project, spec);
                }
            }
        }
    }

    /// Whether the mirror's cron gate opened since the last pass.
    async fn due(&self, key: &str, spec: &MirrorSpec) -> bool {
        let expr = spec
            .schedule
            .clone()
            .unwrap_or_else(|| DEFAULT_SCHEDULE.to_string());
        let cron = match CronSchedule::parse(&expr) {
            Ok(cron) => cron,
            Err(e) => {
                log::warn!("mirror {} has a bad schedule: {}", key, e);
                return false;
            }
        };
        let now = Utc::now();
        let mut schedules = self.schedules.lock().await;
        let current = schedules.get(key).cloned();
        match current {
            Some((stored_expr, next)) if stored_expr == expr => {
                if next.map(|n| now >= n).unwrap_or(false) {
                    schedules.insert(key.to_string(), (expr, cron.next_after(now)));
                    true
                } else {
                    false
                }
            }
            _ => {
                // First sighting (or a changed schedule): arm the gate.
                schedules.insert(key.to_string(), (expr, cron.next_after(now)));
                false
            }
        }
    }

    async fn spawn_run(self: &Arc<Self>, project: String, spec: MirrorSpec, key: String) {
        {
            let mut running = self.running.lock().await;
            if !running.insert(key.clone()) {
                log::debug!("mirror {} is still running; dropping this firing", key);
                return;
            }
        }
        let service = self.clone();
        tokio::spawn(async move {
            let _permit = match service.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            service.emit_run(&project, &spec.id);
            let result = service.run(&project, &spec).await;
            match &result {
                Ok(outcome) => log::info!("mirror {}: {:?}", key, outcome),
                Err(e) => log::warn!("mirror {} failed: {}", key, e),
            }
            service.emit_complete(&project, &spec.id, &result);
            service.running.lock().await.remove(&key);
        });
    }

    fn emit_run(&self, project: &str, id: &str) {
        let listeners = self.listeners.lock().expect("listeners lock").clone();
        for listener in listeners {
            listener.on_run(project, id);
        }
    }

    fn emit_complete(&self, project: &str, id: &str, result: &Result<MirrorOutcome, Error>) {
        let listeners = self.listeners.lock().expect("listeners lock").clone();
        for listener in listeners {
            listener.on_complete(project, id, result);
        }
    }

    /// Runs one configured mirror immediately, regardless of its schedule.
    /// The access control list still applies.
    pub async fn run_once(&self, project: &str, mirror_id: &str) -> Result<MirrorOutcome, Error> {
        let specs = self.list_mirrors(project).await?;
        let spec = specs
            .into_iter()
            .find(|s| s.id == mirror_id)
            .ok_or_else(|| Error::Mirror(format!("no such mirror: {}", mirror_id)))?;
        if !spec.enabled {
            return Err(Error::Mirror(format!("mirror {} is disabled", mirror_id)));
        }
        let rules = self.access_rules().await?;
        if !mirror_allowed(&rules, &spec.remote_uri) {
            return Err(Error::MirrorAccessDenied(spec.remote_uri.clone()));
        }
        self.emit_run(project, mirror_id);
        let result = self.run(project, &spec).await;
        self.emit_complete(project, mirror_id, &result);
        result
    }

    async fn run(&self, project: &str, spec: &MirrorSpec) -> Result<MirrorOutcome, Error> {
        match spec.direction {
            MirrorDirection::RemoteToLocal => self.run_remote_to_local(project, spec).await,
            MirrorDirection::LocalToRemote => self.run_local_to_remote(project, spec).await,
        }
    }

    async fn credential_for(
        &self,
        project: &str,
        spec: &MirrorSpec,
        remote: &MirrorRemote,
    ) -> Result<Option<Credential>, Error> {
        let credentials = self.credentials(project).await?;
        match (&spec.credential_id, remote.url.starts_with("file:")) {
            (Some(id), _) => Ok(Some(
                credential::resolve(&credentials, Some(id), &remote.host)?.clone(),
            )),
            // Local fixtures authenticate with nobody.
            (None, true) => Ok(None),
            (None, false) => Ok(Some(
                credential::resolve(&credentials, None, &remote.host)?.clone(),
            )),
        }
    }

    async fn run_remote_to_local(
        &self,
        project: &str,
        spec: &MirrorSpec,
    ) -> Result<MirrorOutcome, Error> {
        let remote = git::parse_remote_uri(&spec.remote_uri)?;
        let credential = self.credential_for(project, spec, &remote).await?;
        let local_repo = self.projects.repo(project, &spec.local_repo).await?;
        let local_path = normalize_local_path(&spec.local_path)?;

        let work = self.work_dir.join(project).join(&spec.id);
        let url = remote.url.clone();
        let branch = remote.branch.clone();
        let fetch_credential = credential.clone();
        let (sha, remote_files) = tokio::task::spawn_blocking(move || {
            let repo = git::open_or_init(&work)?;
            git::fetch(&repo, &url, fetch_credential.as_ref())?;
            let (_, oid) = git::resolve_branch(&repo, branch.as_deref())?;
            let files = git::read_tree(&repo, oid)?;
            Ok::<_, Error>((oid.to_string(), files))
        })
        .await??;

        // Short-circuit when the last pass already consumed this commit.
        let state_query = Query::of_json(MIRROR_STATE_PATH).expect("static path");
        let stored_sha = match local_repo.get(Revision::HEAD, &state_query).await {
            Ok(entry) => match entry.content {
                EntryContent::Json(value) => value
                    .get("sourceRevision")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string()),
                _ => None,
            },
            Err(Error::EntryNotFound { .. }) => None,
            Err(e) => return Err(e),
        };
        if stored_sha.as_deref() == Some(sha.as_str()) {
            return Ok(MirrorOutcome::UpToDate);
        }

        // Select the remote sub-path and apply the gitignore filter.
        let mut selected: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (path, bytes) in remote_files {
            if let Some(rel) = strip_dir_prefix(&path, &remote.path) {
                selected.insert(rel, bytes);
            }
        }
        if let Some(gitignore) = &spec.gitignore {
            let matcher = build_gitignore(gitignore)?;
            selected.retain(|rel, _| {
                !matcher
                    .matched_path_or_any_parents(rel.trim_start_matches('/'), false)
                    .is_ignore()
            });
        }

        if selected.len() > self.max_files {
            return Err(Error::Mirror(format!(
                "remote holds {} files, more than the per-mirror cap of {}",
                selected.len(),
                self.max_files
            )));
        }
        let total_bytes: u64 = selected.values().map(|b| b.len() as u64).sum();
        if total_bytes > self.max_bytes {
            return Err(Error::Mirror(format!(
                "remote holds {} bytes, more than the per-mirror cap of {}",
                total_bytes, self.max_bytes
            )));
        }

        // Diff the filtered remote against the local sub-tree.
        let pattern = subtree_pattern(&local_path);
        let local_entries = local_repo
            .find(Revision::HEAD, &pattern, &FindOptions::default())
            .await?;
        let mut changes = Vec::new();
        let mut mirrored_paths = HashSet::new();
        for (rel, bytes) in &selected {
            let target = join_path(&local_path, rel);
            mirrored_paths.insert(target.clone());
            let local_current = local_entries
                .iter()
                .find(|e| e.path == target)
                .map(|e| &e.content);
            match EntryType::from_path(&target) {
                EntryType::Json => {
                    let value: serde_json::Value =
                        serde_json::from_slice(bytes).map_err(|e| {
                            Error::Mirror(format!("remote file {} is not valid JSON: {}", rel, e))
                        })?;
                    match local_current {
                        Some(EntryContent::Json(current)) if *current == value => {}
                        _ => changes.push(Change::upsert_json(&target, value)),
                    }
                }
                _ => {
                    let text = String::from_utf8(bytes.clone()).map_err(|_| {
                        Error::Mirror(format!("remote file {} is not valid UTF-8", rel))
                    })?;
                    let normalized = if text.ends_with('\n') {
                        text
                    } else {
                        format!("{}\n", text)
                    };
                    match local_current {
                        Some(EntryContent::Text(current)) if *current == normalized => {}
                        _ => changes.push(Change::upsert_text(&target, &normalized)),
                    }
                }
            }
        }
        for entry in &local_entries {
            if entry.content == EntryContent::Directory {
                continue;
            }
            if entry.path == MIRROR_STATE_PATH {
                continue;
            }
            if !mirrored_paths.contains(&entry.path) {
                changes.push(Change::remove(&entry.path));
            }
        }
        changes.push(Change::upsert_json(
            MIRROR_STATE_PATH,
            serde_json::json!({ "sourceRevision": sha.clone() }),
        ));

        // Safe checkpoint: between fetch and commit.
        self.check_leadership()?;

        let summary = format!("Mirror {} of {}", short_sha(&sha), spec.remote_uri);
        self.executor
            .execute(Command::Push {
                project: project.to_string(),
                repo: spec.local_repo.clone(),
                base_revision: Revision::HEAD,
                author: Author::system(),
                message: CommitMessage::only_summary(&summary),
                changes,
            })
            .await?;
        Ok(MirrorOutcome::Synced)
    }

    async fn run_local_to_remote(
        &self,
        project: &str,
        spec: &MirrorSpec,
    ) -> Result<MirrorOutcome, Error> {
        let remote = git::parse_remote_uri(&spec.remote_uri)?;
        let credential = self.credential_for(project, spec, &remote).await?;
        let local_repo = self.projects.repo(project, &spec.local_repo).await?;
        let local_path = normalize_local_path(&spec.local_path)?;

        // Materialize the local sub-tree at HEAD.
        let head = local_repo.normalize(Revision::HEAD)?;
        let pattern = subtree_pattern(&local_path);
        let entries = local_repo
            .find(Revision::HEAD, &pattern, &FindOptions::default())
            .await?;
        let mut local_files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for entry in entries {
            if entry.path == MIRROR_STATE_PATH {
                continue;
            }
            let rel = match strip_dir_prefix(&entry.path, &local_path) {
                Some(rel) => rel,
                None => continue,
            };
            match entry.content {
                EntryContent::Json(value) => {
                    local_files.insert(rel, crate::change::canonical_json_bytes(&value));
                }
                EntryContent::Text(text) => {
                    local_files.insert(rel, text.into_bytes());
                }
                EntryContent::Directory => {}
            }
        }

        let summary = format!("Mirror {}/{} at revision {}", project, spec.local_repo, head);
        for attempt in 0..MAX_PUSH_ATTEMPTS {
            let work = self.work_dir.join(project).join(&spec.id);
            let url = remote.url.clone();
            let sub_path = remote.path.clone();
            let branch = remote.branch.clone();
            let files = local_files.clone();
            let push_credential = credential.clone();
            let message = summary.clone();
            let leading = self.leading.clone();
            self.check_leadership()?;

            let outcome = tokio::task::spawn_blocking(move || {
                let repo = git::open_or_init(&work)?;
                git::fetch(&repo, &url, push_credential.as_ref())?;
                let (branch_name, parent, base_tree) =
                    match git::resolve_branch(&repo, branch.as_deref()) {
                        Ok((name, oid)) => {
                            let tree = git::read_tree(&repo, oid)?;
                            (name, Some(oid), tree)
                        }
                        // An empty remote: the push creates the branch.
                        Err(_) => (
                            branch.clone().unwrap_or_else(|| "master".to_string()),
                            None,
                            BTreeMap::new(),
                        ),
                    };

                let mut next_tree = base_tree.clone();
                next_tree.retain(|path, _| strip_dir_prefix(path, &sub_path).is_none());
                for (rel, bytes) in &files {
                    next_tree.insert(join_path(&sub_path, rel), bytes.clone());
                }
                if next_tree == base_tree && parent.is_some() {
                    return Ok(MirrorOutcome::UpToDate);
                }

                let _commit = git::write_commit(
                    &repo,
                    &next_tree,
                    parent,
                    &branch_name,
                    &message,
                    &Author::system(),
                )?;
                // Safe checkpoint: between commit and push.
                if !leading.load(Ordering::SeqCst) {
                    return Err(Error::Cancelled);
                }
                git::push(&repo, &url, &branch_name, push_credential.as_ref())?;
                Ok(MirrorOutcome::Synced)
            })
            .await?;

            match outcome {
                Ok(result) => return Ok(result),
                Err(Error::Mirror(message)) if message.contains("push rejected") => {
                    if attempt + 1 == MAX_PUSH_ATTEMPTS {
                        return Err(Error::Mirror(format!(
                            "push kept being rejected after {} attempts: {}",
                            MAX_PUSH_ATTEMPTS, message
                        )));
                    }
                    let backoff = Duration::from_millis(
                        200 * (1 << attempt) + (fastrand::f32() * 100.0) as u64,
                    );
                    log::debug!(
                        "mirror push of {}/{} rejected; retrying in {:?}",
                        project,
                        spec.id,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
        unreachable!("push retry loop always returns")
    }
}

fn short_sha(sha: &str) -> &str {
    &sha[..sha.len().min(10)]
}

fn normalize_local_path(path: &Option<String>) -> Result<String, Error> {
    match path {
        None => Ok("/".to_string()),
        Some(p) if p == "/" => Ok("/".to_string()),
        Some(p) if p.starts_with('/') => Ok(p.trim_end_matches('/').to_string()),
        Some(p) => Err(Error::Mirror(format!("localPath must be absolute: {}", p))),
    }
}

/// Pattern selecting every entry under a directory.
fn subtree_pattern(dir: &str) -> String {
    if dir == "/" {
        "/**".to_string()
    } else {
        format!("{}/**", dir)
    }
}

/// `/a/b.json` relative to `/a` is `/b.json`; `None` when outside the
/// directory.
fn strip_dir_prefix(path: &str, dir: &str) -> Option<String> {
    if dir == "/" {
        return Some(path.to_string());
    }
    let rest = path.strip_prefix(dir)?;
    if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

fn join_path(dir: &str, rel: &str) -> String {
    if dir == "/" {
        rel.to_string()
    } else {
        format!("{}{}", dir, rel)
    }
}

fn build_gitignore(spec: &GitignoreSpec) -> Result<ignore::gitignore::Gitignore, Error> {
    let mut builder = ignore::gitignore::GitignoreBuilder::new("/");
    for line in spec.lines() {
        builder
            .add_line(None, &line)
            .map_err(|e| Error::Mirror(format!("bad gitignore line '{}': {}", line, e)))?;
    }
    builder
        .build()
        .map_err(|e| Error::Mirror(format!("bad gitignore: {}", e)))
}
