//! Lexical path normalization. The normalized form is the index key:
//! no leading or trailing slash, backslashes translated, `.` and `..`
//! resolved without touching any filesystem.

/// Normalizes a caller-supplied path into an index key. The root
/// normalizes to the empty string.
pub fn normalize(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

/// The name of `key` relative to the directory `prefix`: its first
/// path segment below the prefix.
pub fn child_name<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    match rest.split('/').next() {
        Some("") | None => None,
        Some(name) => Some(name),
    }
}
