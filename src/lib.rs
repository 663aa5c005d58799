#![doc = include_str!("../README.md")]
mod error;
mod server;

pub mod change;
pub mod cluster;
pub mod command;
pub mod mirror;
pub mod model;
pub mod path;
pub mod project;
pub mod query;
pub mod storage;
pub mod watch;

pub use command::{Command, CommandExecutor, CommandOrigin, CommandResult, ServerStatus, StatusScope};
pub use error::Error;
pub use mirror::{
    Credential, CredentialKind, CronSchedule, GitignoreSpec, MirrorAccessControl,
    MirrorDirection, MirrorListener, MirrorOutcome, MirrorSpec, MirroringService,
};
pub use model::{
    Author, Change, ChangeContent, Commit, CommitDetail, CommitMessage, Entry, EntryContent,
    EntryType, ListEntry, Project, PushResult, Query, QueryType, RepositoryInfo, Revision,
    WatchFileResult,
};
pub use project::{ProjectManager, Token};
pub use server::{CentralDogma, CentralDogmaConfig};
pub use storage::{
    CacheStats, CachingRepository, CommitOptions, CommitResult, FindOptions, GitRepository,
    Repository, RepositoryCache,
};
pub use watch::WatchManager;
