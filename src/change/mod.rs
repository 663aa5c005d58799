//! The change application engine.
//!
//! A [`Change`] list is applied against the entry tree snapshot of the
//! parent revision; every conflict is detected here, before anything is
//! persisted. The tree is a plain map of file path to raw stored bytes; the
//! entry type of a file follows from its path (`.json` holds JSON), so a
//! JSON upsert to a non-JSON path is a conflict rather than a silent
//! reinterpretation.
pub mod json_patch;
pub mod text_patch;

mod merge;

pub(crate) use merge::{mergeable, rebase_changes};

use std::collections::BTreeMap;

use serde_json::Value;

use crate::model::{Change, ChangeContent, EntryContent, EntryType};
use crate::path::validate_file_path;
use crate::Error;

/// File path to raw stored bytes at one revision. Directories are derived,
/// never stored.
pub(crate) type EntryMap = BTreeMap<String, Vec<u8>>;

/// Canonical stored form of a JSON value: compact, sorted keys (the
/// serde_json map is ordered), trailing newline.
pub(crate) fn canonical_json_bytes(value: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(value).expect("JSON value must serialize");
    bytes.push(b'\n');
    bytes
}

/// Stored form of a text file; a missing trailing newline is added.
pub(crate) fn text_bytes(text: &str) -> Vec<u8> {
    let mut bytes = text.as_bytes().to_vec();
    if !bytes.ends_with(b"\n") {
        bytes.push(b'\n');
    }
    bytes
}

/// Decodes stored bytes into the content a reader sees for `path`.
pub(crate) fn content_of(path: &str, bytes: &[u8]) -> Result<EntryContent, Error> {
    match EntryType::from_path(path) {
        EntryType::Json => {
            let value = serde_json::from_slice(bytes)
                .map_err(|e| Error::Storage(format!("corrupt JSON entry {}: {}", path, e)))?;
            Ok(EntryContent::Json(value))
        }
        _ => {
            let text = String::from_utf8(bytes.to_vec())
                .map_err(|_| Error::Storage(format!("entry {} is not valid UTF-8", path)))?;
            Ok(EntryContent::Text(text))
        }
    }
}

pub(crate) fn parse_json_entry(path: &str, bytes: &[u8]) -> Result<Value, Error> {
    serde_json::from_slice(bytes)
        .map_err(|e| Error::Storage(format!("corrupt JSON entry {}: {}", path, e)))
}

/// Applies `changes` in order on top of `tree`, returning the new tree.
/// Any conflicting change aborts the whole application.
pub(crate) fn apply_changes(tree: &EntryMap, changes: &[Change]) -> Result<EntryMap, Error> {
    let mut work = tree.clone();
    for change in changes {
        apply_one(&mut work, change)?;
    }
    Ok(work)
}

fn apply_one(tree: &mut EntryMap, change: &Change) -> Result<(), Error> {
    let path = change.path.as_str();
    validate_file_path(path)?;
    match &change.content {
        ChangeContent::UpsertJson(value) => {
            if EntryType::from_path(path) != EntryType::Json {
                return Err(Error::conflict(format!(
                    "JSON can only be upserted to a .json path: {}",
                    path
                )));
            }
            tree.insert(path.to_string(), canonical_json_bytes(value));
        }
        ChangeContent::UpsertText(text) => {
            if EntryType::from_path(path) == EntryType::Json {
                // A textual upsert into a JSON file must still parse, or
                // every later read of the entry would fail.
                serde_json::from_str::<Value>(text).map_err(|e| {
                    Error::conflict(format!("not valid JSON for {}: {}", path, e))
                })?;
            }
            tree.insert(path.to_string(), text_bytes(text));
        }
        ChangeContent::Remove => {
            if tree.remove(path).is_none() {
                return Err(Error::conflict(format!("cannot remove a missing entry: {}", path)));
            }
        }
        ChangeContent::Rename(to) => {
            validate_file_path(to)?;
            if EntryType::from_path(path) != EntryType::from_path(to) {
                return Err(Error::conflict(format!(
                    "cannot rename across entry types: {} -> {}",
                    path, to
                )));
            }
            if tree.contains_key(to.as_str()) {
                return Err(Error::conflict(format!("rename target exists: {}", to)));
            }
            match tree.remove(path) {
                Some(bytes) => {
                    tree.insert(to.clone(), bytes);
                }
                None => {
                    return Err(Error::conflict(format!("cannot rename a missing entry: {}", path)))
                }
            }
        }
        ChangeContent::ApplyJsonPatch(patch) => {
            let bytes = tree
                .get(path)
                .ok_or_else(|| Error::conflict(format!("cannot patch a missing entry: {}", path)))?;
            if EntryType::from_path(path) != EntryType::Json {
                return Err(Error::conflict(format!("not a JSON entry: {}", path)));
            }
            let doc = parse_json_entry(path, bytes)?;
            let patched = json_patch::apply(&doc, patch)?;
            tree.insert(path.to_string(), canonical_json_bytes(&patched));
        }
        ChangeContent::ApplyTextPatch(patch) => {
            let bytes = tree
                .get(path)
                .ok_or_else(|| Error::conflict(format!("cannot patch a missing entry: {}", path)))?;
            let old = String::from_utf8(bytes.clone())
                .map_err(|_| Error::Storage(format!("entry {} is not valid UTF-8", path)))?;
            let new = text_patch::apply(&old, patch)?;
            if EntryType::from_path(path) == EntryType::Json {
                serde_json::from_str::<Value>(&new).map_err(|e| {
                    Error::conflict(format!("patched {} is not valid JSON: {}", path, e))
                })?;
            }
            tree.insert(path.to_string(), text_bytes(&new));
        }
    }
    Ok(())
}
