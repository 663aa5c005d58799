//! The command executor.
//!
//! Every mutation of the store is a [`Command`] enqueued onto one channel
//! and applied by a single task, which is what makes mutations totally
//! ordered. Each envelope carries a oneshot for its result. Two orthogonal
//! status bits gate execution: a non-writable node refuses every mutating
//! command with [`Error::ReadOnly`], and a non-replicating node refuses
//! commands originating from the cluster. The status survives restarts in
//! `status.json`.
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::change::json_patch;
use crate::model::{
    Author, Change, Commit, CommitMessage, Project, PushResult, RepositoryInfo, Revision,
};
use crate::project::{ensure_config_only_push, ProjectManager};
use crate::storage::{CommitOptions, Repository};
use crate::watch::WatchManager;
use crate::Error;

const STATUS_FILE: &str = "status.json";

/// Whether a command was issued by a local caller or arrived through
/// cluster replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrigin {
    Local,
    Replication,
}

/// The two runtime bits of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerStatus {
    pub writable: bool,
    pub replicating: bool,
}

impl Default for ServerStatus {
    fn default() -> Self {
        ServerStatus {
            writable: true,
            replicating: true,
        }
    }
}

/// Whether a status update applies to this node only or to the whole
/// cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusScope {
    Local,
    All,
}

/// A totally-ordered mutation of the store.
#[derive(Debug, Clone)]
pub enum Command {
    CreateProject {
        name: String,
        author: Author,
    },
    RemoveProject {
        name: String,
        author: Author,
    },
    RestoreProject {
        name: String,
    },
    PurgeProject {
        name: String,
    },
    CreateRepository {
        project: String,
        name: String,
        author: Author,
    },
    RemoveRepository {
        project: String,
        name: String,
        author: Author,
    },
    RestoreRepository {
        project: String,
        name: String,
    },
    PurgeRepository {
        project: String,
        name: String,
    },
    Push {
        project: String,
        repo: String,
        base_revision: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
    },
    UpdateServerStatus {
        status: ServerStatus,
        scope: StatusScope,
    },
}

impl Command {
    pub fn create_project(name: &str, author: Author) -> Command {
        Command::CreateProject {
            name: name.to_string(),
            author,
        }
    }

    pub fn create_repository(project: &str, name: &str, author: Author) -> Command {
        Command::CreateRepository {
            project: project.to_string(),
            name: name.to_string(),
            author,
        }
    }

    pub fn push(
        project: &str,
        repo: &str,
        base_revision: Revision,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
    ) -> Command {
        Command::Push {
            project: project.to_string(),
            repo: repo.to_string(),
            base_revision,
            author,
            message,
            changes,
        }
    }

    fn mutates_content(&self) -> bool {
        !matches!(self, Command::UpdateServerStatus { .. })
    }
}

/// The typed result of a command.
#[derive(Debug, Clone)]
pub enum CommandResult {
    Project(Project),
    Repository(RepositoryInfo),
    Pushed(PushResult),
    Status(ServerStatus),
    Done,
}

impl CommandResult {
    /// Unwraps a push result; panics when applied to another command's
    /// result, which is a caller bug.
    pub fn unwrap_push(self) -> PushResult {
        match self {
            CommandResult::Pushed(result) => result,
            other => panic!("not a push result: {:?}", other),
        }
    }
}

struct Envelope {
    origin: CommandOrigin,
    command: Command,
    reply: oneshot::Sender<Result<CommandResult, Error>>,
}

/// Accepts commands and funnels them through the single applier task.
pub struct CommandExecutor {
    tx: mpsc::Sender<Envelope>,
    status: Arc<RwLock<ServerStatus>>,
}

impl CommandExecutor {
    pub fn start(
        projects: Arc<ProjectManager>,
        watch: Arc<WatchManager>,
        data_dir: &Path,
    ) -> Result<Arc<CommandExecutor>, Error> {
        let status_path = data_dir.join(STATUS_FILE);
        let status = load_status(&status_path)?;
        let status = Arc::new(RwLock::new(status));

        let (tx, rx) = mpsc::channel(256);
        let applier = Applier {
            projects,
            watch,
            status: status.clone(),
            status_path,
        };
        tokio::spawn(applier.run(rx));
        Ok(Arc::new(CommandExecutor { tx, status }))
    }

    /// Executes a locally-originated command.
    pub async fn execute(&self, command: Command) -> Result<CommandResult, Error> {
        self.execute_from(CommandOrigin::Local, command).await
    }

    pub async fn execute_from(
        &self,
        origin: CommandOrigin,
        command: Command,
    ) -> Result<CommandResult, Error> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                origin,
                command,
                reply,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read().expect("status lock")
    }

    /// Applies a JSON-Patch document over the status surface
    /// (`/writable`, `/replicating`). Returns `Ok(None)` when the update
    /// changes nothing, mirroring a NOT_MODIFIED response.
    pub async fn update_status(
        &self,
        patch: &serde_json::Value,
        scope: StatusScope,
    ) -> Result<Option<ServerStatus>, Error> {
        let current = self.status();
        let patched = json_patch::apply(&serde_json::to_value(current)?, patch)?;
        let next: ServerStatus = serde_json::from_value(patched)
            .map_err(|_| Error::InvalidParams("status accepts /writable and /replicating only"))?;
        if next == current {
            return Ok(None);
        }
        if next.writable && !next.replicating {
            return Err(Error::InvalidParams(
                "a writable node must participate in replication",
            ));
        }
        match self
            .execute(Command::UpdateServerStatus {
                status: next,
                scope,
            })
            .await?
        {
            CommandResult::Status(status) => Ok(Some(status)),
            _ => Err(Error::Storage("unexpected command result".to_string())),
        }
    }
}

fn load_status(path: &Path) -> Result<ServerStatus, Error> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerStatus::default()),
        Err(e) => Err(e.into()),
    }
}

struct Applier {
    projects: Arc<ProjectManager>,
    watch: Arc<WatchManager>,
    status: Arc<RwLock<ServerStatus>>,
    status_path: PathBuf,
}

impl Applier {
    async fn run(self, mut rx: mpsc::Receiver<Envelope>) {
        while let Some(envelope) = rx.recv().await {
            let result = self.apply(envelope.origin, envelope.command).await;
            let _ = envelope.reply.send(result);
        }
        log::debug!("command executor stopped");
    }

    async fn apply(
        &self,
        origin: CommandOrigin,
        command: Command,
    ) -> Result<CommandResult, Error> {
        let status = *self.status.read().expect("status lock");
        if origin == CommandOrigin::Replication && !status.replicating {
            return Err(Error::InvalidParams(
                "node does not accept replicated commands",
            ));
        }
        if command.mutates_content() && !status.writable {
            return Err(Error::ReadOnly);
        }

        match command {
            Command::CreateProject { name, author } => {
                let project = self.projects.create_project(&name, &author).await?;
                Ok(CommandResult::Project(project))
            }
            Command::RemoveProject { name, author } => {
                // Watchers of every repository in the project observe
                // cancellation.
                let mut scopes = Vec::new();
                if let Ok(repos) = self.projects.list_repos(&name).await {
                    for info in repos {
                        if let Ok(repo) = self.projects.repo(&name, &info.name).await {
                            scopes.push(repo.cache_scope().to_string());
                        }
                    }
                }
                self.projects.remove_project(&name, &author).await?;
                for scope in scopes {
                    self.watch.remove_repository(&scope).await;
                }
                Ok(CommandResult::Done)
            }
            Command::RestoreProject { name } => {
                let project = self.projects.restore_project(&name).await?;
                Ok(CommandResult::Project(project))
            }
            Command::PurgeProject { name } => {
                self.projects.purge_project(&name).await?;
                Ok(CommandResult::Done)
            }
            Command::CreateRepository {
                project,
                name,
                author,
            } => {
                let info = self.projects.create_repo(&project, &name, &author).await?;
                Ok(CommandResult::Repository(info))
            }
            Command::RemoveRepository {
                project,
                name,
                author,
            } => {
                let scope = self
                    .projects
                    .repo(&project, &name)
                    .await
                    .map(|r| r.cache_scope().to_string())
                    .ok();
                self.projects.remove_repo(&project, &name, &author).await?;
                if let Some(scope) = scope {
                    self.watch.remove_repository(&scope).await;
                }
                Ok(CommandResult::Done)
            }
            Command::RestoreRepository { project, name } => {
                let info = self.projects.restore_repo(&project, &name).await?;
                Ok(CommandResult::Repository(info))
            }
            Command::PurgeRepository { project, name } => {
                self.projects.purge_repo(&project, &name).await?;
                Ok(CommandResult::Done)
            }
            Command::Push {
                project,
                repo,
                base_revision,
                author,
                message,
                changes,
            } => {
                ensure_config_only_push(&repo, &changes)?;
                let handle = self.projects.repo(&project, &repo).await?;
                let result = handle
                    .commit(
                        base_revision,
                        author.clone(),
                        message.clone(),
                        changes,
                        CommitOptions::default(),
                    )
                    .await?;
                let commit = Commit {
                    revision: result.revision,
                    author,
                    commit_message: message,
                    pushed_at: Some(result.pushed_at.clone()),
                };
                self.watch
                    .notify(&handle, &commit, &result.changed_paths)
                    .await;
                Ok(CommandResult::Pushed(PushResult {
                    revision: result.revision,
                    pushed_at: Some(result.pushed_at),
                }))
            }
            Command::UpdateServerStatus { status, scope } => {
                // Enforced here, not only in the update_status() surface:
                // every entry point that can carry this command, replicated
                // ones included, must uphold the invariant.
                if status.writable && !status.replicating {
                    return Err(Error::InvalidParams(
                        "a writable node must participate in replication",
                    ));
                }
                std::fs::write(&self.status_path, serde_json::to_vec_pretty(&status)?)?;
                *self.status.write().expect("status lock") = status;
                log::info!(
                    "server status updated: writable={} replicating={} scope={:?}",
                    status.writable,
                    status.replicating,
                    scope
                );
                Ok(CommandResult::Status(status))
            }
        }
    }
}
