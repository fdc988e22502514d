//! Pattern expansion for rule inputs, ignores, and export resources.
//!
//! Standard shell globs (`*`, `?`, `[...]`) are delegated to the `glob`
//! crate. Recursive `**` patterns are restricted to a handful of shapes so
//! that what a fingerprint covers stays bounded and unambiguous:
//!
//! - `…/**`            every file under the base, recursively
//! - `…/**/*`          same
//! - `…/**/*suffix`    files whose name ends with `suffix`
//! - `…/**/prefix*`    files whose name starts with `prefix`
//! - `…/**/exact`      files whose name is exactly `exact`
//!
//! At most one `**` segment is allowed, and it must be a complete path
//! segment. Any other placement fails with `invalid pattern`.

use color_eyre::{Result, eyre::bail};
use itertools::Itertools;
use tap::Pipe;
use walkdir::WalkDir;

use crate::path::{AbsDirPath, AbsFilePath, TryJoinWith};

/// How the final segment of a recursive pattern selects file names.
#[derive(Clone, Debug, PartialEq, Eq)]
enum NameMatch {
    Any,
    Suffix(String),
    Prefix(String),
    Exact(String),
}

impl NameMatch {
    fn matches(&self, name: &str) -> bool {
        match self {
            NameMatch::Any => true,
            NameMatch::Suffix(s) => name.ends_with(s),
            NameMatch::Prefix(p) => name.starts_with(p),
            NameMatch::Exact(e) => name == e,
        }
    }
}

/// Expand `pattern` rooted at `dir` into a lexicographically sorted list of
/// regular files. Directories are filtered out. A pattern that matches
/// nothing expands to an empty list, not an error.
pub fn match_pattern(dir: &AbsDirPath, pattern: &str) -> Result<Vec<AbsFilePath>> {
    if pattern.contains("**") {
        match_recursive(dir, pattern)
    } else {
        match_simple(dir, pattern)
    }
}

fn match_simple(dir: &AbsDirPath, pattern: &str) -> Result<Vec<AbsFilePath>> {
    let full = format!("{dir}/{pattern}");
    let mut out = Vec::new();
    for entry in glob::glob(&full)? {
        let path = entry?;
        if path.is_file() {
            out.push(AbsFilePath::try_from(path)?);
        }
    }
    out.sort();
    Ok(out)
}

fn match_recursive(dir: &AbsDirPath, pattern: &str) -> Result<Vec<AbsFilePath>> {
    let (base, name) = parse_recursive(pattern)?;
    let root = if base.is_empty() {
        dir.clone()
    } else {
        dir.try_join_dir(base)?
    };
    if !crate::fs::is_dir(&root) {
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    for entry in WalkDir::new(root.as_std_path()).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if name.matches(&file_name) {
            out.push(AbsFilePath::try_from(entry.path())?);
        }
    }
    out.sort();
    Ok(out)
}

/// Split a recursive pattern into its base directory and name matcher,
/// rejecting every `**` placement outside the supported forms.
fn parse_recursive(pattern: &str) -> Result<(&str, NameMatch)> {
    if pattern.matches("**").count() > 1 {
        bail!("invalid pattern: {pattern}");
    }

    // `**` must be its own segment: either the whole pattern, `…/ **`, or
    // followed by exactly one more segment.
    let (base, rest) = match pattern.split_once("**") {
        Some(parts) => parts,
        None => bail!("invalid pattern: {pattern}"),
    };
    if !base.is_empty() && !base.ends_with('/') {
        bail!("invalid pattern: {pattern}");
    }
    let base = base.trim_end_matches('/');

    let name = match rest {
        "" => NameMatch::Any,
        _ => {
            let Some(tail) = rest.strip_prefix('/') else {
                bail!("invalid pattern: {pattern}");
            };
            if tail.is_empty() || tail.contains('/') || tail.contains("**") {
                bail!("invalid pattern: {pattern}");
            }
            match tail.match_indices('*').collect_vec().as_slice() {
                [] => NameMatch::Exact(tail.to_string()),
                [(0, _)] if tail == "*" => NameMatch::Any,
                [(0, _)] => NameMatch::Suffix(tail[1..].to_string()),
                [(i, _)] if *i == tail.len() - 1 => {
                    NameMatch::Prefix(tail[..tail.len() - 1].to_string())
                }
                _ => bail!("invalid pattern: {pattern}"),
            }
        }
    };

    Ok((base, name))
}

/// Expand every pattern, drop every path matched by an ignore pattern, and
/// return the union sorted lexicographically.
pub fn match_patterns(
    dir: &AbsDirPath,
    patterns: &[String],
    ignores: &[String],
) -> Result<Vec<AbsFilePath>> {
    let mut ignored = Vec::new();
    for pattern in ignores {
        ignored.extend(match_pattern(dir, pattern)?);
    }

    let mut out = Vec::new();
    for pattern in patterns {
        for path in match_pattern(dir, pattern)? {
            if !ignored.contains(&path) {
                out.push(path);
            }
        }
    }
    out.sort();
    out.dedup();
    out.pipe(Ok)
}
