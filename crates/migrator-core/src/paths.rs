//! # Path Helpers
//!
//! Lexical operations on `/`-separated path strings.
//!
//! Build logs may come from a different host than the one running the
//! migrator, so none of these functions touch the filesystem. Paths are kept
//! as `String`s: they end up in the model and in generated scripts verbatim.

/// Split a path into its root (`/`, `C:/`, `//` or empty) and the remainder.
fn split_root(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        if bytes.len() >= 3 && bytes[2] == b'/' {
            return path.split_at(3);
        }
        return path.split_at(2);
    }
    if path.starts_with("//") && !path.starts_with("///") {
        return path.split_at(2);
    }
    if path.starts_with('/') {
        let trimmed = path.trim_start_matches('/');
        return ("/", trimmed);
    }
    ("", path)
}

/// Lexically normalize a path: collapse separators, drop `.` and fold `..`.
///
/// `a/./b/../c` becomes `a/c`; an empty result becomes `.`.
#[must_use]
pub fn normpath(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }
    let (root, rest) = split_root(path);
    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if root.is_empty() {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if root.is_empty() && joined.is_empty() {
        ".".to_string()
    } else {
        format!("{root}{joined}")
    }
}

/// Join two paths. An absolute `second` replaces `first`.
#[must_use]
pub fn join(first: &str, second: &str) -> String {
    if is_rooted(second) || first.is_empty() {
        return second.to_string();
    }
    if second.is_empty() {
        return first.to_string();
    }
    format!("{}/{}", first.trim_end_matches('/'), second)
}

/// Whether the path starts with a root (`/`, `//` or a drive letter).
#[must_use]
pub fn is_rooted(path: &str) -> bool {
    !split_root(path).0.is_empty()
}

/// Compute `path` relative to `start`. Both are normalized first.
///
/// Returns `None` when the two paths live under different roots (for
/// example `C:/` and `D:/`, or an absolute and a relative path).
#[must_use]
pub fn relpath(path: &str, start: &str) -> Option<String> {
    let path = normpath(path);
    let start = normpath(start);
    let (path_root, path_rest) = split_root(&path);
    let (start_root, start_rest) = split_root(&start);
    if !path_root.eq_ignore_ascii_case(start_root) {
        return None;
    }

    let components = |rest: &str| -> Vec<String> {
        rest.split('/')
            .filter(|p| !p.is_empty() && *p != ".")
            .map(str::to_string)
            .collect()
    };
    let path_parts = components(path_rest);
    let start_parts = components(start_rest);

    let common = path_parts
        .iter()
        .zip(start_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut result: Vec<&str> = Vec::new();
    for _ in common..start_parts.len() {
        result.push("..");
    }
    for part in &path_parts[common..] {
        result.push(part);
    }
    if result.is_empty() {
        Some(".".to_string())
    } else {
        Some(result.join("/"))
    }
}

/// Count the leading `..` components of a relative path.
#[must_use]
pub fn relpath_level(path: &str) -> usize {
    path.split('/').take_while(|part| *part == "..").count()
}

/// Pick the directory from which `path` has the shortest relative path.
///
/// Directories that would need more than `max_relpath_level` leading `..`
/// are skipped; `None` means unlimited. Returns the chosen directory and the
/// relative path.
#[must_use]
pub fn closest_dir<'a>(
    path: &str,
    dirs: impl IntoIterator<Item = &'a str>,
    max_relpath_level: Option<usize>,
) -> Option<(&'a str, String)> {
    let mut result: Option<(&'a str, String)> = None;
    for dir in dirs {
        let Some(rel) = relpath(path, dir) else {
            continue;
        };
        if max_relpath_level.is_some_and(|max| relpath_level(&rel) > max) {
            continue;
        }
        let better = match &result {
            None => true,
            Some((_, best)) => rel.len() < best.len(),
        };
        if better {
            result = Some((dir, rel));
        }
    }
    result
}

/// Whether `path` equals `dir` or lies beneath it.
#[must_use]
pub fn is_subpath(path: &str, dir: &str) -> bool {
    match relpath(path, dir) {
        Some(rel) => relpath_level(&rel) == 0,
        None => false,
    }
}

/// Everything before the last `/`, or an empty string.
#[must_use]
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Everything after the last `/`.
#[must_use]
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// Split the extension off the last component: `dir/a.tar.gz` gives
/// `("dir/a.tar", ".gz")`. Leading dots of a filename are not extensions.
#[must_use]
pub fn split_ext(path: &str) -> (&str, &str) {
    let name_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
    let name = &path[name_start..];
    let stem_start = name.len() - name.trim_start_matches('.').len();
    match name[stem_start..].rfind('.') {
        Some(dot) => path.split_at(name_start + stem_start + dot),
        None => (path, ""),
    }
}
