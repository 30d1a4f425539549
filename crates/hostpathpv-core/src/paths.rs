//! Lexical path helpers for host paths recorded in annotations.
//!
//! Host paths live on remote nodes, so these never touch the local
//! filesystem.

/// Lexically clean a slash-separated path.
///
/// Collapses repeated separators, removes `.` elements, resolves `..`
/// against the preceding element and drops trailing separators.
pub fn clean(path: &str) -> String {
    if path.is_empty() {
        return ".".to_string();
    }

    let rooted = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();

    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => match parts.last() {
                Some(&last) if last != ".." => {
                    parts.pop();
                }
                _ => {
                    if !rooted {
                        parts.push("..");
                    }
                }
            },
            s => parts.push(s),
        }
    }

    let joined = parts.join("/");
    if rooted {
        format!("/{}", joined)
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Last element of a path
pub fn base(path: &str) -> String {
    let cleaned = clean(path);
    if cleaned == "/" {
        return cleaned;
    }
    match cleaned.rsplit_once('/') {
        Some((_, last)) => last.to_string(),
        None => cleaned,
    }
}

/// Everything but the last element of a path
pub fn dir(path: &str) -> String {
    let cleaned = clean(path);
    match cleaned.rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

/// Join two path fragments and clean the result
pub fn join(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => String::new(),
        (true, false) => clean(b),
        (false, true) => clean(a),
        (false, false) => clean(&format!("{}/{}", a, b)),
    }
}

/// Whether two paths name the same location after cleaning
pub fn same(a: &str, b: &str) -> bool {
    clean(a) == clean(b)
}

/// Whether `path` is `root` itself or lies beneath it.
///
/// Comparison is per element, so `/d10/a` is not under `/d1`.
pub fn is_under(path: &str, root: &str) -> bool {
    let path = clean(path);
    let root = clean(root);
    if root == "/" {
        return path.starts_with('/');
    }
    path == root
        || path
            .strip_prefix(root.as_str())
            .is_some_and(|rest| rest.starts_with('/'))
}
