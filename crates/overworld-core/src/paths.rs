//! Path hygiene for identifiers and client-supplied traversal paths.
//!
//! Everything here operates on strings, not the filesystem: callers validate
//! before any path ever reaches disk or the map tree.

use crate::error::CoreError;

/// Make an identifier safe for use as a file or directory name.
/// Traversal sequences and separators are replaced, never interpreted.
pub fn sanitize_component(raw: &str) -> String {
    raw.replace("..", "_").replace(['/', '\\'], "_")
}

/// Validate a client-supplied relative path for map-tree navigation.
/// Rejects absolute paths and any `..` segment, including embedded ones.
pub fn check_relative_path(path: &str) -> Result<(), CoreError> {
    if path.is_empty() {
        return Err(CoreError::UnsafePath("empty path".into()));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(CoreError::UnsafePath(format!("absolute path: {path}")));
    }
    for segment in path.split(['/', '\\']) {
        if segment == ".." {
            return Err(CoreError::UnsafePath(format!("traversal segment in: {path}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_traversal_and_separators() {
        assert_eq!(sanitize_component("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_component("realm/../../x"), "realm_____x");
        assert_eq!(sanitize_component("plain-id"), "plain-id");
        assert_eq!(sanitize_component("a\\b"), "a_b");
    }

    #[test]
    fn accepts_plain_relative_paths() {
        assert!(check_relative_path("src").is_ok());
        assert!(check_relative_path("src/handlers").is_ok());
        assert!(check_relative_path("a/b/c.rs").is_ok());
    }

    #[test]
    fn rejects_absolute_paths() {
        assert!(check_relative_path("/etc").is_err());
        assert!(check_relative_path("\\windows").is_err());
    }

    #[test]
    fn rejects_any_dotdot_segment() {
        assert!(check_relative_path("..").is_err());
        assert!(check_relative_path("../sibling").is_err());
        assert!(check_relative_path("src/../../etc").is_err());
        assert!(check_relative_path("src/..").is_err());
    }

    #[test]
    fn dotdot_inside_a_name_is_fine() {
        assert!(check_relative_path("notes..md").is_ok());
        assert!(check_relative_path("a..b/c").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(check_relative_path("").is_err());
    }
}
