//! Unified-format text patch generation and application.
//!
//! Generation runs a line-wise LCS diff and renders hunks with three lines
//! of context. Application is strict: context or removed lines that do not
//! match the base text are a [`Error::ChangeConflict`].
use crate::Error;

const CONTEXT: usize = 3;

fn split_lines(s: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = s.split('\n').collect();
    if lines.last() == Some(&"") {
        lines.pop();
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Equal,
    Delete,
    Insert,
}

/// Line-wise edit script `(op, old_index, new_index)` in order.
fn edit_script(a: &[&str], b: &[&str]) -> Vec<(Op, usize, usize)> {
    let n = a.len();
    let m = b.len();
    // LCS lengths; files here are configuration-sized, the quadratic table
    // is acceptable.
    let mut lcs = vec![vec![0usize; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }
    let mut script = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            script.push((Op::Equal, i, j));
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            script.push((Op::Delete, i, j));
            i += 1;
        } else {
            script.push((Op::Insert, i, j));
            j += 1;
        }
    }
    while i < n {
        script.push((Op::Delete, i, j));
        i += 1;
    }
    while j < m {
        script.push((Op::Insert, i, j));
        j += 1;
    }
    script
}

/// Produces a unified-format patch turning `old` into `new`.
/// Returns an empty string when the texts are equal.
pub fn diff(old: &str, new: &str) -> String {
    let a = split_lines(old);
    let b = split_lines(new);
    let script = edit_script(&a, &b);
    if script.iter().all(|(op, _, _)| *op == Op::Equal) {
        return String::new();
    }

    // Group changed script positions into hunks with surrounding context.
    let mut hunks: Vec<(usize, usize)> = Vec::new(); // [start, end) in script
    let mut idx = 0;
    while idx < script.len() {
        if script[idx].0 == Op::Equal {
            idx += 1;
            continue;
        }
        let start = idx.saturating_sub(CONTEXT);
        let mut end = idx + 1;
        let mut gap = 0;
        let mut cursor = idx + 1;
        while cursor < script.len() && gap <= CONTEXT * 2 {
            if script[cursor].0 == Op::Equal {
                gap += 1;
            } else {
                end = cursor + 1;
                gap = 0;
            }
            cursor += 1;
        }
        hunks.push((start, (end + CONTEXT).min(script.len())));
        idx = end.max(cursor);
    }

    let mut out = String::new();
    for (start, end) in hunks {
        let slice = &script[start..end];
        let a_count = slice.iter().filter(|(op, _, _)| *op != Op::Insert).count();
        let b_count = slice.iter().filter(|(op, _, _)| *op != Op::Delete).count();
        let a_start = if a_count == 0 {
            slice.first().map(|(_, i, _)| *i).unwrap_or(0)
        } else {
            slice.first().map(|(_, i, _)| *i).unwrap_or(0) + 1
        };
        let b_start = if b_count == 0 {
            slice.first().map(|(_, _, j)| *j).unwrap_or(0)
        } else {
            slice.first().map(|(_, _, j)| *j).unwrap_or(0) + 1
        };
        out.push_str(&format!(
            "@@ -{},{} +{},{} @@\n",
            a_start, a_count, b_start, b_count
        ));
        for (op, i, j) in slice {
            match op {
                Op::Equal => {
                    out.push(' ');
                    out.push_str(a[*i]);
                }
                Op::Delete => {
                    out.push('-');
                    out.push_str(a[*i]);
                }
                Op::Insert => {
                    out.push('+');
                    out.push_str(b[*j]);
                }
            }
            out.push('\n');
        }
    }
    out
}

/// Applies a unified-format `patch` to `old`.
pub fn apply(old: &str, patch: &str) -> Result<String, Error> {
    let a = split_lines(old);
    let mut out: Vec<String> = Vec::new();
    let mut pos = 0usize; // next unconsumed line of `a`

    let mut lines = patch.lines().peekable();
    while let Some(line) = lines.next() {
        if line.starts_with("---") || line.starts_with("+++") {
            continue;
        }
        if !line.starts_with("@@") {
            if line.trim().is_empty() {
                continue;
            }
            return Err(Error::conflict(format!("malformed patch line: {}", line)));
        }
        let (a_start, a_count) = parse_hunk_header(line)?;
        if a_count > 0 && a_start == 0 {
            return Err(Error::conflict("malformed hunk header position"));
        }
        let hunk_pos = if a_count == 0 { a_start } else { a_start - 1 };
        if hunk_pos < pos || hunk_pos > a.len() {
            return Err(Error::conflict("hunk is out of range"));
        }
        for copied in &a[pos..hunk_pos] {
            out.push((*copied).to_string());
        }
        pos = hunk_pos;

        while let Some(body) = lines.peek() {
            if body.starts_with("@@") {
                break;
            }
            let body = lines.next().unwrap();
            let (marker, content) = match body.chars().next() {
                None => (' ', ""),
                Some(marker) => (marker, &body[marker.len_utf8()..]),
            };
            match marker {
                ' ' => {
                    if a.get(pos).copied() != Some(content) {
                        return Err(Error::conflict(format!(
                            "context mismatch at line {}",
                            pos + 1
                        )));
                    }
                    out.push(content.to_string());
                    pos += 1;
                }
                '-' => {
                    if a.get(pos).copied() != Some(content) {
                        return Err(Error::conflict(format!(
                            "removed line mismatch at line {}",
                            pos + 1
                        )));
                    }
                    pos += 1;
                }
                '+' => out.push(content.to_string()),
                '\\' => {} // "\ No newline at end of file"
                _ => return Err(Error::conflict(format!("malformed patch line: {}", body))),
            }
        }
    }
    for copied in &a[pos..] {
        out.push((*copied).to_string());
    }

    let mut text = out.join("\n");
    text.push('\n');
    Ok(text)
}

fn parse_hunk_header(line: &str) -> Result<(usize, usize), Error> {
    // "@@ -a,b +c,d @@"
    let err = || Error::conflict(format!("malformed hunk header: {}", line));
    let rest = line.trim_start_matches('@').trim();
    let old_part = rest.split_whitespace().next().ok_or_else(err)?;
    let old_part = old_part.strip_prefix('-').ok_or_else(err)?;
    let mut nums = old_part.splitn(2, ',');
    let start = nums
        .next()
        .and_then(|n| n.parse::<usize>().ok())
        .ok_or_else(err)?;
    let count = match nums.next() {
        Some(n) => n.parse::<usize>().map_err(|_| err())?,
        None => 1,
    };
    Ok((start, count))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_diff_empty_for_equal() {
        assert_eq!(diff("a\nb\n", "a\nb\n"), "");
    }

    #[test]
    fn test_roundtrip() {
        let cases = vec![
            ("a\nb\nc\n", "a\nx\nc\n"),
            ("a\n", "a\nb\nc\n"),
            ("a\nb\nc\n", "c\n"),
            ("1\n2\n3\n4\n5\n6\n7\n8\n9\n", "1\n2\n3\nX\n5\n6\n7\n8\nnine\n"),
            ("", "hello\n"),
            ("hello\n", ""),
        ];
        for (old, new) in cases {
            let patch = diff(old, new);
            let applied = apply(old, &patch).unwrap();
            // An empty result still carries the trailing newline invariant.
            let expected = if new.is_empty() { "\n".to_string() } else { new.to_string() };
            assert_eq!(applied, expected, "patch was:\n{}", patch);
        }
    }

    #[test]
    fn test_context_mismatch_conflicts() {
        let patch = diff("a\nb\nc\n", "a\nx\nc\n");
        assert!(matches!(
            apply("a\nCHANGED\nc\n", &patch),
            Err(Error::ChangeConflict(_))
        ));
    }

    #[test]
    fn test_distant_edits_make_two_hunks() {
        let old = "1\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n12\n13\n14\n15\n";
        let new = "one\n2\n3\n4\n5\n6\n7\n8\n9\n10\n11\n12\n13\n14\nfifteen\n";
        let patch = diff(old, new);
        assert_eq!(patch.matches("@@").count(), 4); // two hunks, two markers each
        assert_eq!(apply(old, &patch).unwrap(), new);
    }
}
