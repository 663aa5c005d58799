//! The query engine.
//!
//! A [`Query`] transforms the content of an entry read at some revision:
//! identity, textual rendering, JSON tree, or a series of JSONPath
//! expressions applied left to right. Query results are cache keys, so the
//! transformation must be deterministic for a given entry.
use serde_json::Value;

use crate::model::{Entry, EntryContent, Query, QueryType};
use crate::Error;

/// Applies `query` to `entry`, returning a new entry holding the
/// transformed content.
pub fn apply(query: &Query, entry: &Entry) -> Result<Entry, Error> {
    let content = apply_content(query, &entry.path, &entry.content)?;
    Ok(Entry {
        path: entry.path.clone(),
        content,
        revision: entry.revision,
    })
}

pub(crate) fn apply_content(
    query: &Query,
    path: &str,
    content: &EntryContent,
) -> Result<EntryContent, Error> {
    match query.query_type() {
        QueryType::Identity => Ok(content.clone()),
        QueryType::IdentityText => match content {
            EntryContent::Json(v) => Ok(EntryContent::Text(render_text(v))),
            EntryContent::Text(t) => Ok(EntryContent::Text(t.clone())),
            EntryContent::Directory => {
                Err(Error::QueryTypeMismatch(format!("{} is a directory", path)))
            }
        },
        QueryType::IdentityJson => match content {
            EntryContent::Json(v) => Ok(EntryContent::Json(v.clone())),
            _ => Err(Error::QueryTypeMismatch(format!(
                "{} does not hold JSON",
                path
            ))),
        },
        QueryType::JsonPath(exprs) => match content {
            EntryContent::Json(v) => {
                let mut value = v.clone();
                for expr in exprs {
                    value = jsonpath::eval(expr, &value)?;
                }
                Ok(EntryContent::Json(value))
            }
            _ => Err(Error::QueryTypeMismatch(format!(
                "JSONPath requires a JSON entry: {}",
                path
            ))),
        },
    }
}

fn render_text(value: &Value) -> String {
    let mut text = serde_json::to_string(value).expect("JSON value must serialize");
    text.push('\n');
    text
}

/// A small JSONPath evaluator.
///
/// Supports the dialect the repository API promises: `$`, `.name`,
/// `['name']`, `[index]`, `[*]`, `.*` and recursive descent (`..name`,
/// `..*`). A bare expression is rooted, so `"a.b"` means `"$.a.b"`. A
/// definite path that matches nothing yields JSON `null`; an indefinite one
/// yields the (possibly empty) array of matches. Neither is an error.
pub(crate) mod jsonpath {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum Segment {
        Field(String),
        Index(usize),
        Wildcard,
        Descent(String),
        DescentWildcard,
    }

    pub fn eval(expr: &str, root: &Value) -> Result<Value, Error> {
        let segments = parse(expr)?;
        let mut definite = true;
        let mut selection: Vec<&Value> = vec![root];
        for segment in &segments {
            match segment {
                Segment::Field(name) => {
                    selection = selection.iter().filter_map(|v| v.get(name.as_str())).collect();
                }
                Segment::Index(i) => {
                    selection = selection
                        .iter()
                        .filter_map(|v| v.as_array().and_then(|a| a.get(*i)))
                        .collect();
                }
                Segment::Wildcard => {
                    definite = false;
                    selection = selection.iter().flat_map(|v| children(v)).collect();
                }
                Segment::Descent(name) => {
                    definite = false;
                    let mut next = Vec::new();
                    for v in &selection {
                        collect_descendants_named(v, name, &mut next);
                    }
                    selection = next;
                }
                Segment::DescentWildcard => {
                    definite = false;
                    let mut next = Vec::new();
                    for v in &selection {
                        collect_descendants(v, &mut next);
                    }
                    selection = next;
                }
            }
        }
        if definite {
            Ok(selection.first().cloned().cloned().unwrap_or(Value::Null))
        } else {
            Ok(Value::Array(selection.into_iter().cloned().collect()))
        }
    }

    fn children<'a>(v: &'a Value) -> Vec<&'a Value> {
        match v {
            Value::Object(map) => map.values().collect(),
            Value::Array(arr) => arr.iter().collect(),
            _ => Vec::new(),
        }
    }

    fn collect_descendants_named<'a>(v: &'a Value, name: &str, out: &mut Vec<&'a Value>) {
        if let Value::Object(map) = v {
            if let Some(found) = map.get(name) {
                out.push(found);
            }
        }
        for child in children(v) {
            collect_descendants_named(child, name, out);
        }
    }

    fn collect_descendants<'a>(v: &'a Value, out: &mut Vec<&'a Value>) {
        for child in children(v) {
            out.push(child);
            collect_descendants(child, out);
        }
    }

    fn syntax(expr: &str) -> Error {
        Error::QuerySyntax(expr.to_string())
    }

    fn parse(expr: &str) -> Result<Vec<Segment>, Error> {
        if expr.is_empty() {
            return Err(syntax(expr));
        }
        let mut chars = expr.chars().peekable();
        let mut segments = Vec::new();

        if chars.peek() == Some(&'$') {
            chars.next();
        } else if !matches!(chars.peek(), Some('.') | Some('[')) {
            // Bare expression: the leading token is a field name.
            segments.push(Segment::Field(read_name(&mut chars, expr)?));
        }

        while let Some(&c) = chars.peek() {
            match c {
                '.' => {
                    chars.next();
                    if chars.peek() == Some(&'.') {
                        chars.next();
                        if chars.peek() == Some(&'*') {
                            chars.next();
                            segments.push(Segment::DescentWildcard);
                        } else {
                            segments.push(Segment::Descent(read_name(&mut chars, expr)?));
                        }
                    } else if chars.peek() == Some(&'*') {
                        chars.next();
                        segments.push(Segment::Wildcard);
                    } else {
                        segments.push(Segment::Field(read_name(&mut chars, expr)?));
                    }
                }
                '[' => {
                    chars.next();
                    match chars.peek() {
                        Some('*') => {
                            chars.next();
                            segments.push(Segment::Wildcard);
                        }
                        Some('\'') | Some('"') => {
                            let quote = chars.next().unwrap();
                            let mut name = String::new();
                            loop {
                                match chars.next() {
                                    Some(ch) if ch == quote => break,
                                    Some(ch) => name.push(ch),
                                    None => return Err(syntax(expr)),
                                }
                            }
                            segments.push(Segment::Field(name));
                        }
                        Some(d) if d.is_ascii_digit() => {
                            let mut digits = String::new();
                            while let Some(&ch) = chars.peek() {
                                if ch.is_ascii_digit() {
                                    digits.push(ch);
                                    chars.next();
                                } else {
                                    break;
                                }
                            }
                            let index = digits.parse().map_err(|_| syntax(expr))?;
                            segments.push(Segment::Index(index));
                        }
                        _ => return Err(syntax(expr)),
                    }
                    if chars.next() != Some(']') {
                        return Err(syntax(expr));
                    }
                }
                _ => return Err(syntax(expr)),
            }
        }
        Ok(segments)
    }

    fn read_name(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        expr: &str,
    ) -> Result<String, Error> {
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(syntax(expr));
        }
        Ok(name)
    }
}
