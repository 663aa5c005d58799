//! Project and repository lifecycle.
//!
//! Projects are directories under the data directory; every repository
//! inside is a bare git repository managed by the storage engine. Each
//! project is born with its two reserved repositories: `dogma` (system
//! configuration, `/tokens.json`) and `meta` (project metadata, mirrors,
//! credentials). Reserved names are compared case-insensitively and are
//! never created or removed on behalf of a user. Removal is soft: the
//! directory is renamed aside with a record of who removed it and when, and
//! can be restored until it is purged.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::model::{Author, Change, CommitMessage, Project, Query, RepositoryInfo, Revision};
use crate::storage::{
    CachingRepository, CommitOptions, GitRepository, Repository, RepositoryCache,
};
use crate::Error;

/// The repositories every project owns.
pub const RESERVED_REPOS: [&str; 2] = ["dogma", "meta"];
/// The project the server itself owns; bootstrapped at open.
pub const INTERNAL_PROJECT: &str = "dogma";

const PROJECT_FILE: &str = "project.json";
const REMOVAL_FILE: &str = "removal.json";
const REMOVED_SUFFIX: &str = ".removed";

/// A token registered in a project's `dogma:/tokens.json`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub app_id: String,
    pub secret: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Removal {
    removed_by: Author,
    removed_at: String,
}

struct ProjectHolder {
    project: Project,
    repos: HashMap<String, Arc<CachingRepository>>,
}

/// Owns every live project and repository of a server instance.
pub struct ProjectManager {
    root: PathBuf,
    cache: Arc<RepositoryCache>,
    state: Mutex<HashMap<String, ProjectHolder>>,
}

fn valid_name(name: &str) -> bool {
    let re = regex::Regex::new(r"^[0-9A-Za-z][-+._0-9A-Za-z]*$").expect("static regex");
    re.is_match(name)
}

fn is_reserved_repo(name: &str) -> bool {
    RESERVED_REPOS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

fn repo_dir(project_dir: &Path, repo: &str) -> PathBuf {
    project_dir.join(format!("{}.git", repo))
}

impl ProjectManager {
    /// Opens the data directory, loading every live project and
    /// bootstrapping the internal project.
    pub async fn open(
        root: &Path,
        cache: Arc<RepositoryCache>,
    ) -> Result<ProjectManager, Error> {
        std::fs::create_dir_all(root)?;
        let manager = ProjectManager {
            root: root.to_path_buf(),
            cache,
            state: Mutex::new(HashMap::new()),
        };

        let mut names = Vec::new();
        for dir in std::fs::read_dir(root)? {
            let dir = dir?;
            if !dir.file_type()?.is_dir() {
                continue;
            }
            let name = dir.file_name().to_string_lossy().to_string();
            if name.ends_with(REMOVED_SUFFIX) {
                continue;
            }
            if dir.path().join(PROJECT_FILE).exists() {
                names.push(name);
            }
        }
        {
            let mut state = manager.state.lock().await;
            for name in names {
                let holder = manager.load_project(&name)?;
                state.insert(name, holder);
            }
        }

        if !manager.state.lock().await.contains_key(INTERNAL_PROJECT) {
            log::info!("bootstrapping internal project '{}'", INTERNAL_PROJECT);
            manager
                .create_project_internal(INTERNAL_PROJECT, &Author::system())
                .await?;
        }
        Ok(manager)
    }

    fn project_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn load_project(&self, name: &str) -> Result<ProjectHolder, Error> {
        let dir = self.project_dir(name);
        let project: Project =
            serde_json::from_slice(&std::fs::read(dir.join(PROJECT_FILE))?)?;
        let mut repos = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            let repo_name = match file_name.strip_suffix(".git") {
                Some(name) => name.to_string(),
                None => continue,
            };
            let repo = GitRepository::open(&entry.path(), &repo_name)?;
            repos.insert(
                repo_name,
                Arc::new(CachingRepository::new(Arc::new(repo), self.cache.clone())),
            );
        }
        Ok(ProjectHolder { project, repos })
    }

    async fn create_project_internal(
        &self,
        name: &str,
        creator: &Author,
    ) -> Result<Project, Error> {
        let dir = self.project_dir(name);
        let project = Project {
            name: name.to_string(),
            creator: creator.clone(),
            created_at: Some(Utc::now().to_rfc3339()),
        };
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(PROJECT_FILE), serde_json::to_vec_pretty(&project)?)?;

        let mut repos = HashMap::new();
        for repo_name in &RESERVED_REPOS {
            let repo = GitRepository::create(&repo_dir(&dir, repo_name), repo_name, creator)?;
            let repo = Arc::new(CachingRepository::new(Arc::new(repo), self.cache.clone()));
            let (path, content, summary) = match *repo_name {
                "meta" => (
                    "/metadata.json",
                    serde_json::to_value(&project)?,
                    "Add /metadata.json",
                ),
                _ => ("/tokens.json", serde_json::json!({}), "Add /tokens.json"),
            };
            repo.commit(
                Revision::HEAD,
                Author::system(),
                CommitMessage::only_summary(summary),
                vec![Change::upsert_json(path, content)],
                CommitOptions::default(),
            )
            .await?;
            repos.insert(repo_name.to_string(), repo);
        }

        self.state.lock().await.insert(
            name.to_string(),
            ProjectHolder {
                project: project.clone(),
                repos,
            },
        );
        Ok(project)
    }

    pub async fn create_project(&self, name: &str, creator: &Author) -> Result<Project, Error> {
        if !valid_name(name) {
            return Err(Error::InvalidParams("invalid project name"));
        }
        if name.eq_ignore_ascii_case(INTERNAL_PROJECT) {
            return Err(Error::InvalidParams("project name is reserved"));
        }
        let exists_live = self.state.lock().await.contains_key(name);
        let exists_removed = self
            .project_dir(&format!("{}{}", name, REMOVED_SUFFIX))
            .exists();
        if exists_live || exists_removed {
            return Err(Error::ProjectExists(name.to_string()));
        }
        self.create_project_internal(name, creator).await
    }

    pub async fn remove_project(&self, name: &str, remover: &Author) -> Result<(), Error> {
        if name.eq_ignore_ascii_case(INTERNAL_PROJECT) {
            return Err(Error::InvalidParams("cannot remove the internal project"));
        }
        let mut state = self.state.lock().await;
        let holder = state
            .remove(name)
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))?;
        for repo in holder.repos.values() {
            self.cache.invalidate_repo(repo.cache_scope()).await;
        }
        let dir = self.project_dir(name);
        let removal = Removal {
            removed_by: remover.clone(),
            removed_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(dir.join(REMOVAL_FILE), serde_json::to_vec_pretty(&removal)?)?;
        std::fs::rename(&dir, self.project_dir(&format!("{}{}", name, REMOVED_SUFFIX)))?;
        log::info!("removed project {} by {}", name, remover.name);
        Ok(())
    }

    pub async fn restore_project(&self, name: &str) -> Result<Project, Error> {
        let removed = self.project_dir(&format!("{}{}", name, REMOVED_SUFFIX));
        if !removed.exists() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        let dir = self.project_dir(name);
        std::fs::rename(&removed, &dir)?;
        let _ = std::fs::remove_file(dir.join(REMOVAL_FILE));
        let holder = self.load_project(name)?;
        let project = holder.project.clone();
        self.state.lock().await.insert(name.to_string(), holder);
        log::info!("restored project {}", name);
        Ok(project)
    }

    pub async fn purge_project(&self, name: &str) -> Result<(), Error> {
        let removed = self.project_dir(&format!("{}{}", name, REMOVED_SUFFIX));
        if !removed.exists() {
            return Err(Error::ProjectNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(removed)?;
        log::info!("purged project {}", name);
        Ok(())
    }

    pub async fn list_projects(&self) -> Vec<Project> {
        let state = self.state.lock().await;
        let mut projects: Vec<Project> = state.values().map(|h| h.project.clone()).collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    pub async fn list_removed_projects(&self) -> Result<Vec<String>, Error> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stripped) = name.strip_suffix(REMOVED_SUFFIX) {
                names.push(stripped.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub async fn project(&self, name: &str) -> Result<Project, Error> {
        self.state
            .lock()
            .await
            .get(name)
            .map(|h| h.project.clone())
            .ok_or_else(|| Error::ProjectNotFound(name.to_string()))
    }

    pub async fn create_repo(
        &self,
        project: &str,
        name: &str,
        creator: &Author,
    ) -> Result<RepositoryInfo, Error> {
        if !valid_name(name) {
            return Err(Error::InvalidParams("invalid repository name"));
        }
        if is_reserved_repo(name) {
            return Err(Error::RepositoryNotAllowed(name.to_string()));
        }
        let mut state = self.state.lock().await;
        let holder = state
            .get_mut(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        let dir = repo_dir(&self.project_dir(project), name);
        let removed = PathBuf::from(format!("{}{}", dir.display(), REMOVED_SUFFIX));
        if holder.repos.contains_key(name) || removed.exists() {
            return Err(Error::RepositoryExists(name.to_string()));
        }
        let repo = GitRepository::create(&dir, name, creator)?;
        let repo = Arc::new(CachingRepository::new(Arc::new(repo), self.cache.clone()));
        let info = repo.info();
        holder.repos.insert(name.to_string(), repo);
        Ok(info)
    }

    pub async fn remove_repo(
        &self,
        project: &str,
        name: &str,
        remover: &Author,
    ) -> Result<(), Error> {
        if is_reserved_repo(name) {
            return Err(Error::RepositoryNotAllowed(name.to_string()));
        }
        let mut state = self.state.lock().await;
        let holder = state
            .get_mut(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        let removed_repo = holder
            .repos
            .remove(name)
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))?;
        self.cache.invalidate_repo(removed_repo.cache_scope()).await;
        let dir = repo_dir(&self.project_dir(project), name);
        let removal = Removal {
            removed_by: remover.clone(),
            removed_at: Utc::now().to_rfc3339(),
        };
        std::fs::write(dir.join(REMOVAL_FILE), serde_json::to_vec_pretty(&removal)?)?;
        std::fs::rename(&dir, format!("{}{}", dir.display(), REMOVED_SUFFIX))?;
        log::info!("removed repository {}/{} by {}", project, name, remover.name);
        Ok(())
    }

    pub async fn restore_repo(&self, project: &str, name: &str) -> Result<RepositoryInfo, Error> {
        let mut state = self.state.lock().await;
        let holder = state
            .get_mut(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        let dir = repo_dir(&self.project_dir(project), name);
        let removed = PathBuf::from(format!("{}{}", dir.display(), REMOVED_SUFFIX));
        if !removed.exists() {
            return Err(Error::RepositoryNotFound(name.to_string()));
        }
        std::fs::rename(&removed, &dir)?;
        let _ = std::fs::remove_file(dir.join(REMOVAL_FILE));
        let repo = GitRepository::open(&dir, name)?;
        let repo = Arc::new(CachingRepository::new(Arc::new(repo), self.cache.clone()));
        let info = repo.info();
        holder.repos.insert(name.to_string(), repo);
        log::info!("restored repository {}/{}", project, name);
        Ok(info)
    }

    pub async fn purge_repo(&self, project: &str, name: &str) -> Result<(), Error> {
        let state = self.state.lock().await;
        if !state.contains_key(project) {
            return Err(Error::ProjectNotFound(project.to_string()));
        }
        let dir = repo_dir(&self.project_dir(project), name);
        let removed = PathBuf::from(format!("{}{}", dir.display(), REMOVED_SUFFIX));
        if !removed.exists() {
            return Err(Error::RepositoryNotFound(name.to_string()));
        }
        std::fs::remove_dir_all(removed)?;
        log::info!("purged repository {}/{}", project, name);
        Ok(())
    }

    pub async fn list_repos(&self, project: &str) -> Result<Vec<RepositoryInfo>, Error> {
        let state = self.state.lock().await;
        let holder = state
            .get(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        let mut infos: Vec<RepositoryInfo> = holder.repos.values().map(|r| r.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    pub async fn list_removed_repos(&self, project: &str) -> Result<Vec<String>, Error> {
        {
            let state = self.state.lock().await;
            if !state.contains_key(project) {
                return Err(Error::ProjectNotFound(project.to_string()));
            }
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(self.project_dir(project))? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(stripped) = name.strip_suffix(&format!(".git{}", REMOVED_SUFFIX)) {
                names.push(stripped.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// The repository handle every read and write goes through.
    pub async fn repo(
        &self,
        project: &str,
        name: &str,
    ) -> Result<Arc<CachingRepository>, Error> {
        let state = self.state.lock().await;
        let holder = state
            .get(project)
            .ok_or_else(|| Error::ProjectNotFound(project.to_string()))?;
        holder
            .repos
            .get(name)
            .cloned()
            .ok_or_else(|| Error::RepositoryNotFound(name.to_string()))
    }

    /// Looks a token up in the project's `dogma:/tokens.json`.
    pub async fn find_token(&self, project: &str, app_id: &str) -> Result<Token, Error> {
        let repo = self.repo(project, "dogma").await?;
        let query = Query::of_json("/tokens.json").expect("static path");
        let entry = repo.get(Revision::HEAD, &query).await?;
        let tokens: HashMap<String, Token> = match entry.content {
            crate::model::EntryContent::Json(v) => serde_json::from_value(v)?,
            _ => HashMap::new(),
        };
        tokens
            .get(app_id)
            .cloned()
            .ok_or_else(|| Error::TokenNotFound(app_id.to_string()))
    }
}

/// Pushes into the reserved repositories may only touch configuration
/// files.
pub(crate) fn ensure_config_only_push(repo: &str, changes: &[Change]) -> Result<(), Error> {
    if !is_reserved_repo(repo) {
        return Ok(());
    }
    for change in changes {
        if !change.path.to_ascii_lowercase().ends_with(".json") {
            return Err(Error::RepositoryNotAllowed(format!(
                "{} accepts only .json files ({})",
                repo, change.path
            )));
        }
    }
    Ok(())
}
