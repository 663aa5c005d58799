//! The versioned content store: the git-backed engine and the caching
//! layer wrapped around it.
mod cache;
mod repository;

pub use cache::{CacheStats, CachingRepository, RepositoryCache};
pub use repository::{CommitOptions, CommitResult, FindOptions, GitRepository, Repository};
