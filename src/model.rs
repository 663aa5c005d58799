//! Data models of CentralDogma.
//!
//! These types are shared by every layer of the engine and double as the
//! wire format of the configuration files the server itself keeps inside
//! repositories (`metadata.json`, `mirrors.json`, `credentials.json`).
use serde::{Deserialize, Serialize};

/// A revision number of a [`Commit`].
///
/// A revision number is an integer which refers to a specific point of
/// repository history. When a repository is created, it starts with an
/// initial commit whose revision is 1. As new commits are added, each commit
/// gets its own revision number, monotonically increasing from the previous
/// commit's revision. i.e. 1, 2, 3, ...
///
/// A revision number can also be represented as a negative integer. When a
/// revision number is negative, we start from -1 which refers to the latest
/// commit in repository history, which is often called 'HEAD' of the
/// repository. A smaller revision number refers to the older commit. e.g. -2
/// refers to the commit before the latest commit, and so on.
///
/// A revision with a negative integer is called 'relative revision'. By
/// contrast, a revision with a positive integer is called 'absolute
/// revision'. Relative revisions are resolved to absolute ones by
/// [`Repository::normalize`](crate::storage::Repository::normalize).
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Revision(i64);

impl Revision {
    /// Revision `-1`, also known as `HEAD`.
    pub const HEAD: Revision = Revision(-1);
    /// Revision `1`, also known as `INIT`.
    pub const INIT: Revision = Revision(1);

    /// Create a new instance with the specified revision number.
    pub fn from(i: i64) -> Self {
        Revision(i)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }

    /// Whether this revision addresses history from the end (`HEAD`, -2, ...).
    pub fn is_relative(&self) -> bool {
        self.0 < 0
    }

    /// The revision immediately after this one. Only meaningful for an
    /// absolute revision.
    pub fn forward(&self) -> Revision {
        Revision(self.0 + 1)
    }

    /// The revision immediately before this one. Only meaningful for an
    /// absolute revision.
    pub fn backward(&self) -> Revision {
        Revision(self.0 - 1)
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creator of a project, a repository or a commit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    /// Name of this author.
    pub name: String,
    /// Email of this author.
    pub email: String,
}

impl Author {
    pub fn new(name: &str, email: &str) -> Self {
        Author {
            name: name.to_string(),
            email: email.to_string(),
        }
    }

    /// The author of commits the server creates on its own, such as the
    /// initial commit of a repository and mirror commits.
    pub fn system() -> Self {
        Author::new("System", "system@localhost")
    }
}

/// A top-level element in the CentralDogma storage model.
/// A project has "dogma" and "meta" repositories by default which contain
/// project configuration files accessible by administrators and project
/// owners respectively.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Name of this project.
    pub name: String,
    /// The author who initially created this project.
    pub creator: Author,
    /// When the project was created.
    pub created_at: Option<String>,
}

/// Repository metadata as returned by listing operations.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryInfo {
    /// Name of this repository.
    pub name: String,
    /// The author who initially created this repository.
    pub creator: Author,
    /// Head [`Revision`] of the repository.
    pub head_revision: Revision,
    /// When the repository was created.
    pub created_at: Option<String>,
}

/// The content of an [`Entry`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum EntryContent {
    /// Content as a JSON value.
    Json(serde_json::Value),
    /// Content as a string.
    Text(String),
    /// This entry is a directory.
    Directory,
}

/// A file or a directory in a repository.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    /// Path of this entry.
    pub path: String,
    /// Content of this entry.
    #[serde(flatten)]
    pub content: EntryContent,
    /// Revision this entry was read at.
    pub revision: Revision,
}

impl Entry {
    pub fn entry_type(&self) -> EntryType {
        match self.content {
            EntryContent::Json(_) => EntryType::Json,
            EntryContent::Text(_) => EntryType::Text,
            EntryContent::Directory => EntryType::Directory,
        }
    }
}

/// The type of an [`Entry`] or a [`ListEntry`].
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryType {
    /// A UTF-8 encoded JSON file.
    Json,
    /// A UTF-8 encoded text file.
    Text,
    /// A directory.
    Directory,
}

impl EntryType {
    /// The entry type a file at `path` is stored and served as.
    /// Paths ending in `.json` (case-insensitive) hold JSON.
    pub fn from_path(path: &str) -> EntryType {
        if path.to_ascii_lowercase().ends_with(".json") {
            EntryType::Json
        } else {
            EntryType::Text
        }
    }
}

/// A metadata of a file or a directory in a repository.
/// A `ListEntry` has no content.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ListEntry {
    pub path: String,
    pub r#type: EntryType,
}

/// Type of a [`Query`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryType {
    Identity,
    IdentityJson,
    IdentityText,
    JsonPath(Vec<String>),
}

/// A query on a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub(crate) path: String,
    pub(crate) r#type: QueryType,
}

impl Query {
    fn normalize_path(path: &str) -> String {
        if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{}", path)
        }
    }

    /// Returns a newly-created [`Query`] that retrieves the content as it is.
    /// Returns `None` if path is empty.
    pub fn identity(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::Identity,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the textual content
    /// as it is. Returns `None` if path is empty.
    pub fn of_text(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityText,
        })
    }

    /// Returns a newly-created [`Query`] that retrieves the JSON content as
    /// it is. Returns `None` if path is empty.
    pub fn of_json(path: &str) -> Option<Self> {
        if path.is_empty() {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::IdentityJson,
        })
    }

    /// Returns a newly-created [`Query`] that applies a series of
    /// [JSON path expressions](https://github.com/json-path/JsonPath/blob/master/README.md)
    /// to the content, left to right.
    /// Returns `None` if path is empty or does not end with `.json`.
    pub fn of_json_path(path: &str, exprs: Vec<String>) -> Option<Self> {
        if !path.to_lowercase().ends_with("json") {
            return None;
        }
        Some(Query {
            path: Self::normalize_path(path),
            r#type: QueryType::JsonPath(exprs),
        })
    }

    /// Path of the file this query runs over.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_type(&self) -> &QueryType {
        &self.r#type
    }
}

/// Typed detail of a [`CommitMessage`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "markup", content = "detail")]
pub enum CommitDetail {
    /// Commit details as markdown.
    Markdown(String),
    /// Commit details as plaintext.
    Plaintext(String),
}

/// Description of a [`Commit`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommitMessage {
    /// Summary of this commit message. Must not be empty.
    pub summary: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    /// Detailed description of this commit message.
    pub detail: Option<CommitDetail>,
}

impl CommitMessage {
    pub fn only_summary(summary: &str) -> Self {
        CommitMessage {
            summary: summary.to_string(),
            detail: None,
        }
    }
}

/// Result of a push operation.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    /// Revision of the new commit.
    pub revision: Revision,
    /// When the commit was pushed.
    pub pushed_at: Option<String>,
}

/// Metadata of a set of [`Change`]s applied at one revision.
/// The changes themselves are retrieved with
/// [`Repository::diff`](crate::storage::Repository::diff).
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    /// Revision of this commit.
    pub revision: Revision,
    /// Author of this commit.
    pub author: Author,
    /// Description of this commit.
    pub commit_message: CommitMessage,
    /// When this commit was pushed.
    pub pushed_at: Option<String>,
}

/// Typed content of a [`Change`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(tag = "type", content = "content")]
pub enum ChangeContent {
    /// Adds a new JSON file or replaces an existing file with the provided
    /// JSON.
    UpsertJson(serde_json::Value),

    /// Adds a new text file or replaces an existing file with the provided
    /// content.
    UpsertText(String),

    /// Removes an existing file.
    Remove,

    /// Renames an existing file to the provided path.
    Rename(String),

    /// Applies a JSON patch to a JSON file with the provided JSON patch
    /// object, as defined in [RFC 6902](https://tools.ietf.org/html/rfc6902),
    /// plus the `safeReplace` extension which asserts the old value before
    /// replacing it.
    ApplyJsonPatch(serde_json::Value),

    /// Applies a textual patch to a text file with the provided
    /// [unified format](https://en.wikipedia.org/wiki/Diff_utility#Unified_format)
    /// string.
    ApplyTextPatch(String),
}

/// A modification of an individual [`Entry`].
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    /// Path of the file change.
    pub path: String,
    /// Content of the file change.
    #[serde(flatten)]
    pub content: ChangeContent,
}

impl Change {
    pub fn upsert_json(path: &str, value: serde_json::Value) -> Self {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertJson(value),
        }
    }

    pub fn upsert_text(path: &str, text: &str) -> Self {
        Change {
            path: path.to_string(),
            content: ChangeContent::UpsertText(text.to_string()),
        }
    }

    pub fn remove(path: &str) -> Self {
        Change {
            path: path.to_string(),
            content: ChangeContent::Remove,
        }
    }
}

/// A change delivered by a file watch. The entry is fetched through the
/// caching layer after the watcher fires; waiters themselves hold commit
/// metadata only.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct WatchFileResult {
    /// Revision of the change.
    pub revision: Revision,
    /// Content of the change.
    pub entry: Entry,
}

pub(crate) trait Watchable: Send {
    fn revision(&self) -> Revision;
}

impl Watchable for WatchFileResult {
    fn revision(&self) -> Revision {
        self.revision
    }
}

impl Watchable for Commit {
    fn revision(&self) -> Revision {
        self.revision
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_entry_type_from_path() {
        assert_eq!(EntryType::from_path("/a.json"), EntryType::Json);
        assert_eq!(EntryType::from_path("/a/B.JSON"), EntryType::Json);
        assert_eq!(EntryType::from_path("/a.txt"), EntryType::Text);
        assert_eq!(EntryType::from_path("/json"), EntryType::Text);
    }

    #[test]
    fn test_query_rooted_path() {
        let q = Query::of_json("a.json").unwrap();
        assert_eq!(q.path(), "/a.json");
        assert!(Query::identity("").is_none());
        assert!(Query::of_json_path("/a.txt", vec!["$.a".into()]).is_none());
    }

    #[test]
    fn test_change_serde_shape() {
        let c = Change::upsert_json("/a.json", serde_json::json!({"a": 1}));
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "path": "/a.json",
                "type": "UPSERT_JSON",
                "content": {"a": 1}
            })
        );
        let back: Change = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }
}
