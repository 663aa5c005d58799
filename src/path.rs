//! Entry paths and path patterns.
use crate::Error;

/// Checks that `path` is a valid absolute entry path: non-empty, starts with
/// `/`, no empty components, no `.` or `..` components.
pub fn validate_file_path(path: &str) -> Result<(), Error> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::InvalidParams("path must be absolute"));
    }
    if path.ends_with('/') {
        return Err(Error::InvalidParams("path must not end with '/'"));
    }
    for component in path[1..].split('/') {
        if component.is_empty() {
            return Err(Error::InvalidParams("path must not contain empty components"));
        }
        if component == "." || component == ".." {
            return Err(Error::InvalidParams("path must not contain '.' or '..'"));
        }
        if component.contains('\0') {
            return Err(Error::InvalidParams("path must not contain NUL"));
        }
    }
    Ok(())
}

/// A compiled path pattern, the glob variant used throughout the API:
///
///   * `"/**"` - all files recursively
///   * `"*.json"` - all JSON files recursively
///   * `"/foo/*.json"` - all JSON files under the directory /foo
///   * `"/*/foo.txt"` - all files named foo.txt at the second depth level
///   * `"*.json,/bar/*.txt"` - comma joins alternatives; any match wins
///
/// A pattern without a leading `/` matches at any depth.
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    patterns: Vec<glob::Pattern>,
}

impl PathPattern {
    pub fn new(pattern: &str) -> Result<Self, Error> {
        if pattern.is_empty() {
            return Err(Error::InvalidParams("path pattern must not be empty"));
        }
        let mut patterns = Vec::new();
        for part in pattern.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let rooted = if part.starts_with('/') {
                part.to_string()
            } else {
                format!("/**/{}", part)
            };
            let compiled = glob::Pattern::new(&rooted)
                .map_err(|_| Error::InvalidParams("invalid path pattern"))?;
            patterns.push(compiled);
        }
        if patterns.is_empty() {
            return Err(Error::InvalidParams("path pattern must not be empty"));
        }
        Ok(PathPattern {
            raw: pattern.to_string(),
            patterns,
        })
    }

    /// Pattern that matches every entry.
    pub fn all() -> Self {
        PathPattern::new("/**").unwrap()
    }

    pub fn matches(&self, path: &str) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        self.patterns
            .iter()
            .any(|p| p.matches_with(path, options))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
