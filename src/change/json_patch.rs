//! JSON patch application and generation.
//!
//! Implements [RFC 6902](https://tools.ietf.org/html/rfc6902) with one
//! extension: `safeReplace`, a replace that asserts the current value
//! (`oldValue`) before writing the new one. Diffs generated here use
//! `safeReplace` so that applying a diff elsewhere detects concurrent edits.
use serde_json::{json, Map, Value};

use crate::Error;

/// Applies `patch` (a JSON array of operations) to `doc`. The whole patch
/// applies atomically: the first failing operation aborts and `doc` is left
/// untouched by the caller contract (a fresh value is returned on success).
pub fn apply(doc: &Value, patch: &Value) -> Result<Value, Error> {
    let ops = patch
        .as_array()
        .ok_or(Error::InvalidParams("JSON patch must be an array"))?;
    let mut work = doc.clone();
    for op in ops {
        work = apply_op(work, op)?;
    }
    Ok(work)
}

fn apply_op(doc: Value, op: &Value) -> Result<Value, Error> {
    let name = op
        .get("op")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidParams("JSON patch operation has no 'op'"))?;
    let path = op
        .get("path")
        .and_then(Value::as_str)
        .ok_or(Error::InvalidParams("JSON patch operation has no 'path'"))?;
    let path = parse_pointer(path)?;

    match name {
        "add" => {
            let value = required(op, "value")?;
            add(doc, &path, value.clone())
        }
        "remove" => remove(doc, &path).map(|(doc, _)| doc),
        "replace" => {
            let value = required(op, "value")?;
            replace(doc, &path, value.clone())
        }
        "move" => {
            let from = parse_pointer(required_str(op, "from")?)?;
            let (doc, moved) = remove(doc, &from)?;
            add(doc, &path, moved)
        }
        "copy" => {
            let from = parse_pointer(required_str(op, "from")?)?;
            let copied = get(&doc, &from)
                .ok_or_else(|| Error::conflict(format!("no value at {}", render(&from))))?
                .clone();
            add(doc, &path, copied)
        }
        "test" => {
            let value = required(op, "value")?;
            match get(&doc, &path) {
                Some(actual) if actual == value => Ok(doc),
                _ => Err(Error::conflict(format!("test failed at {}", render(&path)))),
            }
        }
        "safeReplace" => {
            let old_value = required(op, "oldValue")?;
            let value = required(op, "value")?;
            match get(&doc, &path) {
                Some(actual) if actual == old_value => replace(doc, &path, value.clone()),
                _ => Err(Error::conflict(format!(
                    "old value mismatch at {}",
                    render(&path)
                ))),
            }
        }
        _ => Err(Error::InvalidParams("unknown JSON patch operation")),
    }
}

fn required<'a>(op: &'a Value, field: &'static str) -> Result<&'a Value, Error> {
    op.get(field)
        .ok_or(Error::InvalidParams("JSON patch operation lacks a field"))
}

fn required_str<'a>(op: &'a Value, field: &'static str) -> Result<&'a str, Error> {
    required(op, field)?
        .as_str()
        .ok_or(Error::InvalidParams("JSON patch field must be a string"))
}

/// A parsed JSON pointer. The empty pointer addresses the document root.
type Pointer = Vec<String>;

fn parse_pointer(s: &str) -> Result<Pointer, Error> {
    if s.is_empty() {
        return Ok(Vec::new());
    }
    if !s.starts_with('/') {
        return Err(Error::InvalidParams("JSON pointer must start with '/'"));
    }
    Ok(s[1..]
        .split('/')
        .map(|t| t.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn render(p: &Pointer) -> String {
    if p.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for token in p {
        out.push('/');
        out.push_str(&token.replace('~', "~0").replace('/', "~1"));
    }
    out
}

fn get<'a>(doc: &'a Value, path: &Pointer) -> Option<&'a Value> {
    let mut cur = doc;
    for token in path {
        match cur {
            Value::Object(map) => cur = map.get(token)?,
            Value::Array(arr) => cur = arr.get(token.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(cur)
}

fn with_parent<F>(doc: Value, path: &Pointer, f: F) -> Result<Value, Error>
where
    F: FnOnce(&mut Value, &str) -> Result<(), Error>,
{
    let mut doc = doc;
    {
        let mut cur = &mut doc;
        for token in &path[..path.len() - 1] {
            cur = match cur {
                Value::Object(map) => map
                    .get_mut(token)
                    .ok_or_else(|| Error::conflict(format!("no such member: {}", token)))?,
                Value::Array(arr) => {
                    let idx = token
                        .parse::<usize>()
                        .map_err(|_| Error::conflict(format!("bad array index: {}", token)))?;
                    arr.get_mut(idx)
                        .ok_or_else(|| Error::conflict(format!("index out of bounds: {}", idx)))?
                }
                _ => return Err(Error::conflict("cannot descend into a scalar")),
            };
        }
        f(cur, &path[path.len() - 1])?;
    }
    Ok(doc)
}

fn add(doc: Value, path: &Pointer, value: Value) -> Result<Value, Error> {
    if path.is_empty() {
        return Ok(value);
    }
    with_parent(doc, path, |parent, leaf| match parent {
        Value::Object(map) => {
            map.insert(leaf.to_string(), value);
            Ok(())
        }
        Value::Array(arr) => {
            if leaf == "-" {
                arr.push(value);
                return Ok(());
            }
            let idx = leaf
                .parse::<usize>()
                .map_err(|_| Error::conflict(format!("bad array index: {}", leaf)))?;
            if idx > arr.len() {
                return Err(Error::conflict(format!("index out of bounds: {}", idx)));
            }
            arr.insert(idx, value);
            Ok(())
        }
        _ => Err(Error::conflict("add target is a scalar")),
    })
}

fn remove(doc: Value, path: &Pointer) -> Result<(Value, Value), Error> {
    if path.is_empty() {
        return Err(Error::conflict("cannot remove the document root"));
    }
    let mut removed = None;
    let doc = with_parent(doc, path, |parent, leaf| {
        match parent {
            Value::Object(map) => {
                removed = Some(
                    map.remove(leaf)
                        .ok_or_else(|| Error::conflict(format!("no such member: {}", leaf)))?,
                );
            }
            Value::Array(arr) => {
                let idx = leaf
                    .parse::<usize>()
                    .map_err(|_| Error::conflict(format!("bad array index: {}", leaf)))?;
                if idx >= arr.len() {
                    return Err(Error::conflict(format!("index out of bounds: {}", idx)));
                }
                removed = Some(arr.remove(idx));
            }
            _ => return Err(Error::conflict("remove target is a scalar")),
        }
        Ok(())
    })?;
    Ok((doc, removed.expect("removal must have produced a value")))
}

fn replace(doc: Value, path: &Pointer, value: Value) -> Result<Value, Error> {
    if path.is_empty() {
        return Ok(value);
    }
    with_parent(doc, path, |parent, leaf| match parent {
        Value::Object(map) => match map.get_mut(leaf) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::conflict(format!("no such member: {}", leaf))),
        },
        Value::Array(arr) => {
            let idx = leaf
                .parse::<usize>()
                .map_err(|_| Error::conflict(format!("bad array index: {}", leaf)))?;
            match arr.get_mut(idx) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(Error::conflict(format!("index out of bounds: {}", idx))),
            }
        }
        _ => Err(Error::conflict("replace target is a scalar")),
    })
}

/// Generates a patch turning `a` into `b`. Replacements are emitted as
/// `safeReplace` carrying the old value, so the patch doubles as a guarded
/// three-way merge input. `apply(a, diff(a, b)) == b` holds for any pair.
pub fn diff(a: &Value, b: &Value) -> Value {
    let mut ops = Vec::new();
    diff_value(String::new(), a, b, &mut ops);
    Value::Array(ops)
}

fn diff_value(path: String, a: &Value, b: &Value, ops: &mut Vec<Value>) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Object(ao), Value::Object(bo)) => diff_object(path, ao, bo, ops),
        (Value::Array(aa), Value::Array(ba)) if aa.len() == ba.len() => {
            for (i, (av, bv)) in aa.iter().zip(ba.iter()).enumerate() {
                diff_value(format!("{}/{}", path, i), av, bv, ops);
            }
        }
        _ => ops.push(json!({
            "op": "safeReplace",
            "path": path,
            "oldValue": a,
            "value": b,
        })),
    }
}

fn diff_object(
    path: String,
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    ops: &mut Vec<Value>,
) {
    for key in a.keys() {
        if !b.contains_key(key) {
            ops.push(json!({
                "op": "remove",
                "path": format!("{}/{}", path, escape(key)),
            }));
        }
    }
    for (key, bv) in b {
        let child = format!("{}/{}", path, escape(key));
        match a.get(key) {
            Some(av) => diff_value(child, av, bv, ops),
            None => ops.push(json!({
                "op": "add",
                "path": child,
                "value": bv,
            })),
        }
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}
