//! Path sanitizing for the local cache
//!
//! Request paths are untrusted. They are escaped so every segment is a valid
//! local file name, then resolved under the cache root with two checks: a
//! segment walk that rejects `..` escapes, and a canonical prefix check
//! against the root that catches symlinks and other aliasing.

use std::fs;
use std::path::{Component, Path, PathBuf};

/// Characters that are not valid in a file name on any supported platform,
/// plus `%` so escaped names cannot collide with names already holding `%XX`
const INVALID_NAME_CHARS: &[char] = &['"', '<', '>', '|', ':', '*', '?', '%'];

/// Whether `c` separates path segments in a request path
pub fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

fn is_invalid_name_char(c: char) -> bool {
    (c as u32) < 0x20 || INVALID_NAME_CHARS.contains(&c)
}

/// Replace characters that are invalid in local file names with `%XX`
///
/// Separators are kept as-is. The result is only used as a local cache key;
/// it is never decoded back into a remote object name.
pub fn escape(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for c in path.chars() {
        if is_invalid_name_char(c) {
            escaped.push_str(&format!("%{:02X}", c as u32));
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Strip leading separators so the path is relative
pub fn trim_leading_separators(path: &str) -> &str {
    path.trim_start_matches(is_separator)
}

/// Whether the `..` segments in `path` climb above its starting directory
pub fn navigates_above_root(path: &str) -> bool {
    let mut depth: i64 = 0;
    for segment in path.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            _ => depth += 1,
        }
    }
    false
}

/// Resolve `relative` under `root`, or `None` if it would leave the root
pub fn resolve_under_root(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.contains('\0') || navigates_above_root(relative) {
        return None;
    }

    // Lexical normalization; the segment walk above guarantees `pop` never
    // climbs past `root`.
    let mut full = root.to_path_buf();
    for segment in relative.split(is_separator) {
        match segment {
            "" | "." => {}
            ".." => {
                full.pop();
            }
            _ => {
                let mut components = Path::new(segment).components();
                match (components.next(), components.next()) {
                    (Some(Component::Normal(name)), None) => full.push(name),
                    _ => return None,
                }
            }
        }
    }

    if !starts_with_ignore_case(&full, root) {
        return None;
    }

    let canonical_root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    match canonical_existing_ancestor(&full) {
        Some(existing) if !starts_with_ignore_case(&existing, &canonical_root) => None,
        _ => Some(full),
    }
}

/// Canonical form of the deepest ancestor of `path` (inclusive) that exists
fn canonical_existing_ancestor(path: &Path) -> Option<PathBuf> {
    path.ancestors().find_map(|p| fs::canonicalize(p).ok())
}

/// Component-wise, case-insensitive `Path::starts_with`
pub fn starts_with_ignore_case(path: &Path, prefix: &Path) -> bool {
    let mut path = path.components();
    for expected in prefix.components() {
        match path.next() {
            Some(actual) => {
                let actual = actual.as_os_str().to_string_lossy().to_lowercase();
                let expected = expected.as_os_str().to_string_lossy().to_lowercase();
                if actual != expected {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}

/// Case-folded form of a full local path, used as a freshness key
pub fn cache_key(full_path: &Path) -> String {
    full_path.to_string_lossy().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_escape() {
        assert_eq!(escape("docs/report.csv"), "docs/report.csv");
        assert_eq!(escape("a:b*c?.txt"), "a%3Ab%2Ac%3F.txt");
        assert_eq!(escape("tab\there"), "tab%09here");
        assert_eq!(escape(r"dir\file<1>|"), r"dir\file%3C1%3E%7C");
        assert_eq!(escape("\"q\""), "%22q%22");
        assert_eq!(escape("naïve/日本.txt"), "naïve/日本.txt");
        assert_eq!(escape("100%.txt"), "100%25.txt");
    }

    #[test]
    fn test_escape_is_injective_for_percent_names() {
        assert_ne!(escape("a:b"), escape("a%3Ab"));
        assert_eq!(escape("a%3Ab"), "a%253Ab");
    }

    #[test]
    fn test_trim_leading_separators() {
        assert_eq!(trim_leading_separators("/a/b"), "a/b");
        assert_eq!(trim_leading_separators(r"\/\a"), "a");
        assert_eq!(trim_leading_separators("a/"), "a/");
    }

    #[test]
    fn test_navigates_above_root() {
        assert!(!navigates_above_root("a/b/c"));
        assert!(!navigates_above_root("a/../b"));
        assert!(!navigates_above_root("./a/./../."));
        assert!(navigates_above_root(".."));
        assert!(navigates_above_root("a/../../b"));
        assert!(navigates_above_root("./a//.././../b"));
        assert!(navigates_above_root(r"a\..\..\b"));
        assert!(navigates_above_root("../../etc/passwd"));
    }

    #[test]
    fn test_resolve_accepts_paths_without_traversal() {
        let (_dir, root) = root();
        let samples = [
            "report.csv",
            "docs/2024/report.csv",
            "a:b/c*d?.txt",
            "./x/./y",
            "deep//double//slash",
            "ctrl\u{1}char",
            "...",
            "..hidden",
        ];
        for sample in samples {
            let resolved = resolve_under_root(&root, &escape(sample))
                .unwrap_or_else(|| panic!("rejected {:?}", sample));
            assert!(resolved.starts_with(&root), "{:?} -> {:?}", sample, resolved);
        }
    }

    #[test]
    fn test_resolve_collapses_parent_segments() {
        let (_dir, root) = root();
        assert_eq!(resolve_under_root(&root, "a/../b"), Some(root.join("b")));
        assert_eq!(resolve_under_root(&root, "a/./b/../c"), Some(root.join("a").join("c")));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_dir, root) = root();
        assert_eq!(resolve_under_root(&root, "a/../../b"), None);
        assert_eq!(resolve_under_root(&root, "../../etc/passwd"), None);
        assert_eq!(resolve_under_root(&root, "./.././/x"), None);
        assert_eq!(resolve_under_root(&root, "nul\0byte"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (_dir, root) = root();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        assert_eq!(resolve_under_root(&root, "link/secret.txt"), None);
        assert!(resolve_under_root(&root, "plain/secret.txt").is_some());
    }

    #[test]
    fn test_starts_with_ignore_case() {
        assert!(starts_with_ignore_case(Path::new("/Cache/Root/a"), Path::new("/cache/root")));
        assert!(!starts_with_ignore_case(Path::new("/cache/root2/a"), Path::new("/cache/root")));
        assert!(!starts_with_ignore_case(Path::new("/cache"), Path::new("/cache/root")));
    }

    #[test]
    fn test_cache_key_folds_case() {
        assert_eq!(
            cache_key(Path::new("/Cache/Docs/Report.CSV")),
            cache_key(Path::new("/cache/docs/report.csv"))
        );
    }
}
