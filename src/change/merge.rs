//! Three-way merge of JSON changes onto a moved head.
//!
//! When a commit's base revision is behind the repository head, JSON upserts
//! and JSON patches are rebased onto the head tree: the difference between
//! the base content and the submitted content is expressed as a guarded
//! patch (`safeReplace`/`test`) and replayed on the head content. Both sides
//! editing the same value non-identically fails the guard and surfaces as a
//! [`Error::ChangeConflict`]. Any other change kind cannot be merged and is
//! rejected by the storage layer before reaching here.
use crate::model::{Change, ChangeContent};
use crate::Error;

use super::{canonical_json_bytes, json_patch, parse_json_entry, EntryMap};

pub(crate) fn mergeable(changes: &[Change]) -> bool {
    changes.iter().all(|c| {
        matches!(
            c.content,
            ChangeContent::UpsertJson(_) | ChangeContent::ApplyJsonPatch(_)
        )
    })
}

/// Rewrites `changes` (expressed against `base_tree`) into changes that
/// apply cleanly on `head_tree`, or fails with a conflict.
pub(crate) fn rebase_changes(
    base_tree: &EntryMap,
    head_tree: &EntryMap,
    changes: &[Change],
) -> Result<Vec<Change>, Error> {
    let mut rebased = Vec::with_capacity(changes.len());
    for change in changes {
        match &change.content {
            ChangeContent::UpsertJson(new_value) => {
                rebased.push(rebase_upsert(base_tree, head_tree, change, new_value)?);
            }
            // A JSON patch carries its own guards; it applies directly at
            // head and conflicts there if the guarded values moved.
            ChangeContent::ApplyJsonPatch(_) => rebased.push(change.clone()),
            _ => {
                return Err(Error::conflict(format!(
                    "cannot merge non-JSON change for {}",
                    change.path
                )))
            }
        }
    }
    Ok(rebased)
}

fn rebase_upsert(
    base_tree: &EntryMap,
    head_tree: &EntryMap,
    change: &Change,
    new_value: &serde_json::Value,
) -> Result<Change, Error> {
    let path = change.path.as_str();
    let base = base_tree.get(path);
    let head = head_tree.get(path);
    match (base, head) {
        // Entry untouched since base: apply as-is.
        (Some(b), Some(h)) if b == h => Ok(change.clone()),
        (None, None) => Ok(change.clone()),
        // Head already holds exactly what we submit; collapses to a no-op
        // at tree level.
        (_, Some(h)) if h == &canonical_json_bytes(new_value) => Ok(change.clone()),
        // Both sides edited: replay our edit as a guarded patch on head.
        (Some(b), Some(h)) => {
            let base_value = parse_json_entry(path, b)?;
            let head_value = parse_json_entry(path, h)?;
            let patch = json_patch::diff(&base_value, new_value);
            let merged = json_patch::apply(&head_value, &patch).map_err(|_| {
                Error::conflict(format!("conflicting edits to {}", path))
            })?;
            Ok(Change {
                path: path.to_string(),
                content: ChangeContent::UpsertJson(merged),
            })
        }
        // Added on both sides with different content.
        (None, Some(_)) => Err(Error::conflict(format!(
            "entry was added concurrently: {}",
            path
        ))),
        // Removed at head while we edited it.
        (Some(_), None) => Err(Error::conflict(format!(
            "entry was removed concurrently: {}",
            path
        ))),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn entry(v: serde_json::Value) -> Vec<u8> {
        canonical_json_bytes(&v)
    }

    #[test]
    fn test_disjoint_edits_merge() {
        let mut base = EntryMap::new();
        base.insert("/a.json".into(), entry(json!({"x": 1, "y": 1})));
        let mut head = base.clone();
        head.insert("/a.json".into(), entry(json!({"x": 2, "y": 1})));

        // Our change edits y only.
        let ours = Change::upsert_json("/a.json", json!({"x": 1, "y": 9}));
        let rebased = rebase_changes(&base, &head, &[ours]).unwrap();
        assert_eq!(
            rebased[0].content,
            ChangeContent::UpsertJson(json!({"x": 2, "y": 9}))
        );
    }

    #[test]
    fn test_same_value_edit_conflicts() {
        let mut base = EntryMap::new();
        base.insert("/a.json".into(), entry(json!({"x": 1})));
        let mut head = base.clone();
        head.insert("/a.json".into(), entry(json!({"x": 2})));

        let ours = Change::upsert_json("/a.json", json!({"x": 3}));
        assert!(matches!(
            rebase_changes(&base, &head, &[ours]),
            Err(Error::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_identical_edit_collapses() {
        let mut base = EntryMap::new();
        base.insert("/a.json".into(), entry(json!({"x": 1})));
        let mut head = base.clone();
        head.insert("/a.json".into(), entry(json!({"x": 2})));

        // Head already holds exactly what we submit.
        let ours = Change::upsert_json("/a.json", json!({"x": 2}));
        let rebased = rebase_changes(&base, &head, &[ours]).unwrap();
        assert_eq!(
            rebased[0].content,
            ChangeContent::UpsertJson(json!({"x": 2}))
        );
    }

    #[test]
    fn test_concurrent_remove_conflicts() {
        let mut base = EntryMap::new();
        base.insert("/a.json".into(), entry(json!({"x": 1})));
        let head = EntryMap::new();

        let ours = Change::upsert_json("/a.json", json!({"x": 9}));
        assert!(rebase_changes(&base, &head, &[ours]).is_err());
    }

    #[test]
    fn test_non_json_change_rejected() {
        let base = EntryMap::new();
        let head = EntryMap::new();
        assert!(rebase_changes(&base, &head, &[Change::remove("/a.json")]).is_err());
    }
}
