//! Git transport for the mirror engine: remote URI parsing, fetch into a
//! bare working repository, tree reads and commits under a sub-path, and
//! pushes with fast-forward detection.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use git2::{FetchOptions, ObjectType, Oid, PushOptions, Signature, TreeWalkMode, TreeWalkResult};

use crate::mirror::credential::{remote_callbacks, Credential};
use crate::model::Author;
use crate::Error;

/// A parsed `git+<scheme>://host[:port]/path.git[/sub][#branch]` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRemote {
    /// Fetchable URL with the `git+` prefix stripped.
    pub url: String,
    /// Host component; empty for `file` remotes.
    pub host: String,
    /// Directory inside the remote to mirror, `/` for the whole tree.
    pub path: String,
    /// Branch from the URI fragment, if any.
    pub branch: Option<String>,
}

pub(crate) fn parse_remote_uri(uri: &str) -> Result<MirrorRemote, Error> {
    const SCHEMES: [&str; 4] = ["git+http", "git+https", "git+ssh", "git+file"];
    let scheme_end = uri
        .find("://")
        .ok_or_else(|| Error::Mirror(format!("not a remote URI: {}", uri)))?;
    let scheme = &uri[..scheme_end];
    if !SCHEMES.contains(&scheme) {
        return Err(Error::Mirror(format!("unsupported scheme: {}", uri)));
    }

    let mut url = url::Url::parse(&uri["git+".len()..])
        .map_err(|e| Error::Mirror(format!("malformed remote URI {}: {}", uri, e)))?;
    let branch = url.fragment().map(|f| f.to_string());
    url.set_fragment(None);

    let full_path = url.path().to_string();
    let dot_git = full_path
        .find(".git")
        .ok_or_else(|| Error::Mirror(format!("remote URI must point at a .git path: {}", uri)))?;
    let repo_path = &full_path[..dot_git + 4];
    let sub_path = full_path[dot_git + 4..].trim_end_matches('/');
    let sub_path = if sub_path.is_empty() {
        "/".to_string()
    } else if sub_path.starts_with('/') {
        sub_path.to_string()
    } else {
        return Err(Error::Mirror(format!("malformed remote sub-path: {}", uri)));
    };

    let host = url.host_str().unwrap_or("").to_string();
    url.set_path(repo_path);
    Ok(MirrorRemote {
        url: url.to_string(),
        host,
        path: sub_path,
        branch,
    })
}

/// Opens the mirror's bare working repository, creating it on first use.
pub(crate) fn open_or_init(dir: &Path) -> Result<git2::Repository, Error> {
    match git2::Repository::open(dir) {
        Ok(repo) => Ok(repo),
        Err(_) => {
            std::fs::create_dir_all(dir)?;
            Ok(git2::Repository::init_bare(dir)?)
        }
    }
}

/// Fetches every remote head into the working repository's own heads.
pub(crate) fn fetch(
    repo: &git2::Repository,
    url: &str,
    credential: Option<&Credential>,
) -> Result<(), Error> {
    let mut remote = repo.remote_anonymous(url)?;
    let mut options = FetchOptions::new();
    options.remote_callbacks(remote_callbacks(credential));
    remote.fetch(
        &["+refs/heads/*:refs/heads/*"],
        Some(&mut options),
        None,
    )?;
    Ok(())
}

/// Resolves the branch to mirror: the URI fragment when present, else the
/// conventional defaults.
pub(crate) fn resolve_branch(
    repo: &git2::Repository,
    branch: Option<&str>,
) -> Result<(String, Oid), Error> {
    let candidates: Vec<String> = match branch {
        Some(b) => vec![b.to_string()],
        None => vec!["main".to_string(), "master".to_string()],
    };
    for name in &candidates {
        if let Ok(oid) = repo.refname_to_id(&format!("refs/heads/{}", name)) {
            return Ok((name.clone(), oid));
        }
    }
    Err(Error::Mirror(format!(
        "no such branch in remote: {}",
        candidates.join(", ")
    )))
}

/// Reads the full file tree of a commit as `/path -> bytes`.
pub(crate) fn read_tree(
    repo: &git2::Repository,
    commit: Oid,
) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    let tree = repo.find_commit(commit)?.tree()?;
    let mut files = BTreeMap::new();
    let mut failure: Option<git2::Error> = None;
    tree.walk(TreeWalkMode::PreOrder, |root, entry| {
        if entry.kind() == Some(ObjectType::Blob) {
            let name = entry.name().unwrap_or_default();
            let path = format!("/{}{}", root, name);
            match repo.find_blob(entry.id()) {
                Ok(blob) => {
                    files.insert(path, blob.content().to_vec());
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
    Ok(files)
}

/// Writes `files` as a commit on `branch` with the given parent, returning
/// the new commit id.
pub(crate) fn write_commit(
    repo: &git2::Repository,
    files: &BTreeMap<String, Vec<u8>>,
    parent: Option<Oid>,
    branch: &str,
    message: &str,
    author: &Author,
) -> Result<Oid, Error> {
    #[derive(Default)]
    struct DirNode {
        files: BTreeMap<String, Oid>,
        dirs: BTreeMap<String, DirNode>,
    }

    fn write_node(repo: &git2::Repository, node: &DirNode) -> Result<Oid, git2::Error> {
        let mut builder = repo.treebuilder(None)?;
        for (name, child) in &node.dirs {
            let oid = write_node(repo, child)?;
            builder.insert(name, oid, 0o040000)?;
        }
        for (name, oid) in &node.files {
            builder.insert(name, *oid, 0o100644)?;
        }
        builder.write()
    }

    let mut root = DirNode::default();
    for (path, bytes) in files {
        let oid = repo.blob(bytes)?;
        let components: Vec<&str> = path[1..].split('/').collect();
        let mut node = &mut root;
        for dir in &components[..components.len() - 1] {
            node = node.dirs.entry((*dir).to_string()).or_insert_with(DirNode::default);
        }
        node.files.insert(components[components.len() - 1].to_string(), oid);
    }
    let tree_oid = write_node(repo, &root)?;
    let tree = repo.find_tree(tree_oid)?;
    let signature = Signature::new(
        &author.name,
        &author.email,
        &git2::Time::new(Utc::now().timestamp(), 0),
    )?;

    let parents = match parent {
        Some(oid) => vec![repo.find_commit(oid)?],
        None => Vec::new(),
    };
    let parent_refs: Vec<&git2::Commit<'_>> = parents.iter().collect();
    let commit = repo.commit(
        Some(&format!("refs/heads/{}", branch)),
        &signature,
        &signature,
        message,
        &tree,
        &parent_refs,
    )?;
    Ok(commit)
}

/// Pushes `branch` without forcing; a non-fast-forward rejection surfaces
/// as an error so the caller can refetch and retry.
pub(crate) fn push(
    repo: &git2::Repository,
    url: &str,
    branch: &str,
    credential: Option<&Credential>,
) -> Result<(), Error> {
    let mut remote = repo.remote_anonymous(url)?;
    let rejection: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let mut callbacks = remote_callbacks(credential);
    {
        let rejection = rejection.clone();
        callbacks.push_update_reference(move |refname, status| {
            if let Some(message) = status {
                *rejection.lock().expect("rejection lock") =
                    Some(format!("{}: {}", refname, message));
            }
            Ok(())
        });
    }
    let mut options = PushOptions::new();
    options.remote_callbacks(callbacks);
    let refspec = format!("refs/heads/{b}:refs/heads/{b}", b = branch);
    remote.push(&[refspec.as_str()], Some(&mut options))?;
    let rejected = rejection.lock().expect("rejection lock").take();
    if let Some(message) = rejected {
        return Err(Error::Mirror(format!("push rejected: {}", message)));
    }
    Ok(())
}
