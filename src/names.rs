//! Blob name handling.
//!
//! Logical names arrive from callers as arbitrary strings.  Before any
//! backend call they go through [`normalize_name`]:
//!
//! 1. [`clean_name`] collapses redundant separators and `.`/`..` segments;
//! 2. [`safe_join`] prefixes the storage `location` and refuses anything
//!    that climbs above it;
//! 3. [`validate_blob_name`] enforces the backend's naming limits.
//!
//! Lengths are counted in characters, as the blob service does.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::errors::{Result, StorageError, ValidationError};

/// Longest blob name the service accepts.
pub const AZURE_NAME_MAX_LEN: usize = 1024;

/// Most `/` separators a blob name may contain.
pub const AZURE_NAME_MAX_SLASHES: usize = 256;

/// Length of the random suffix added by [`alternative_name`].
pub const UNIQUE_SUFFIX_LEN: usize = 7;

/// Check a candidate blob name against the service's naming rules.
///
/// Leading and trailing `.` and `/` characters are stripped first.  No
/// escaping happens here: reserved characters are percent-encoded when the
/// request URL is built.
pub fn validate_blob_name(raw: &str) -> std::result::Result<String, ValidationError> {
    let name = raw.trim_matches(|c| c == '.' || c == '/');
    let len = name.chars().count();
    if len > AZURE_NAME_MAX_LEN {
        return Err(ValidationError::NameTooLong {
            len,
            max: AZURE_NAME_MAX_LEN,
        });
    }
    if len == 0 {
        return Err(ValidationError::NameEmpty);
    }
    let count = name.matches('/').count();
    if count > AZURE_NAME_MAX_SLASHES {
        return Err(ValidationError::TooManySegments {
            count,
            max: AZURE_NAME_MAX_SLASHES,
        });
    }
    Ok(name.to_string())
}

/// POSIX `normpath`: drop empty and `.` segments, fold `..` where possible.
///
/// Leading `..` segments survive in relative paths; in absolute paths they
/// are dropped.  An empty result becomes `"."`.
fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let initial_slashes = if path.starts_with("//") && !path.starts_with("///") {
        2
    } else if path.starts_with('/') {
        1
    } else {
        0
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if part != ".."
            || (initial_slashes == 0 && parts.is_empty())
            || parts.last() == Some(&"..")
        {
            parts.push(part);
        } else if !parts.is_empty() {
            parts.pop();
        }
    }

    let out = format!("{}{}", "/".repeat(initial_slashes), parts.join("/"));
    if out.is_empty() {
        ".".to_string()
    } else {
        out
    }
}

/// Normalize a user-supplied path into `/`-separated form.
///
/// Backslashes become slashes, redundant segments are collapsed, a trailing
/// slash is kept, and `"."` comes back as `""`.
pub fn clean_name(name: &str) -> String {
    let unix = name.replace('\\', "/");
    let mut cleaned = normpath(&unix);
    if unix.ends_with('/') && !cleaned.ends_with('/') {
        cleaned.push('/');
    }
    if cleaned == "." {
        cleaned.clear();
    }
    cleaned
}

/// The joined path would leave the base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEscape;

/// Join `path` under `base`, resolving `.` and `..` segments.
///
/// Fails instead of clamping when a `..` would climb above `base`, or when
/// an absolute `path` is joined under a non-empty `base`.  The result has no
/// leading slash; a trailing slash on `path` is preserved.
pub fn safe_join(base: &str, path: &str) -> std::result::Result<String, PathEscape> {
    let root: Vec<&str> = base
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    if path.starts_with('/') && !root.is_empty() {
        return Err(PathEscape);
    }

    let mut segments = root.clone();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if segments.len() <= root.len() {
                    return Err(PathEscape);
                }
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut joined = segments.join("/");
    if !joined.is_empty() && (path.ends_with('/') || segments.len() == root.len()) {
        joined.push('/');
    }
    Ok(joined)
}

/// Turn a logical name into the blob name stored under `location`.
///
/// A root escape is reported as [`StorageError::SuspiciousPath`]; naming
/// limit violations as [`StorageError::Validation`].
pub fn normalize_name(name: &str, location: &str) -> Result<String> {
    let joined =
        safe_join(location, &clean_name(name)).map_err(|_| StorageError::SuspiciousPath {
            name: name.to_string(),
        })?;
    validate_blob_name(&joined).map_err(|source| StorageError::Validation {
        name: name.to_string(),
        source,
    })
}

/// Split `name` into `(directory, file root, extension)`.
///
/// The extension starts at the last dot of the file name, unless that dot
/// only follows other leading dots (`.bashrc` has no extension).
pub fn split_name(name: &str) -> (&str, &str, &str) {
    let (dir, file) = match name.rfind('/') {
        Some(idx) => {
            let head = &name[..idx + 1];
            let trimmed = head.trim_end_matches('/');
            (if trimmed.is_empty() { head } else { trimmed }, &name[idx + 1..])
        }
        None => ("", name),
    };
    match file.rfind('.') {
        Some(dot) if file[..dot].chars().any(|c| c != '.') => (dir, &file[..dot], &file[dot..]),
        _ => (dir, file, ""),
    }
}

/// Join a directory and a file name the way `os.path.join` does.
pub fn join_name(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{file}")
    } else {
        format!("{dir}/{file}")
    }
}

/// `root` with its last `count` characters removed.
fn truncate_chars(root: &str, count: usize) -> &str {
    let keep = root.chars().count().saturating_sub(count);
    match root.char_indices().nth(keep) {
        Some((idx, _)) => &root[..idx],
        None => root,
    }
}

/// `{dir}/{root}_{random}{ext}` with a fresh 7-character suffix.
pub fn alternative_name(dir: &str, root: &str, ext: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(UNIQUE_SUFFIX_LEN)
        .map(char::from)
        .collect();
    join_name(dir, &format!("{root}_{suffix}{ext}"))
}

/// Shorten the file root so that `name` fits into `max_length`.
///
/// Returns the shortened root, or a [`StorageError::SuspiciousPath`] when
/// nothing of the root would be left.
pub fn truncate_root<'a>(name: &str, root: &'a str, max_length: usize) -> Result<&'a str> {
    let truncation = name.chars().count().saturating_sub(max_length);
    if truncation == 0 {
        return Ok(root);
    }
    let shortened = truncate_chars(root, truncation);
    if shortened.is_empty() {
        return Err(StorageError::SuspiciousPath {
            name: format!(
                "{name} (storage cannot find an available filename; allow a longer max_length)"
            ),
        });
    }
    Ok(shortened)
}

/// Name to store under when existing blobs may be overwritten.
///
/// The name is returned verbatim when it fits, otherwise its file root is
/// truncated.
pub fn get_available_overwrite_name(name: &str, max_length: Option<usize>) -> Result<String> {
    let max_length = match max_length {
        Some(max) if name.chars().count() > max => max,
        _ => return Ok(name.to_string()),
    };
    let (dir, root, ext) = split_name(name);
    let root = truncate_root(name, root, max_length)?;
    Ok(join_name(dir, &format!("{root}{ext}")))
}
