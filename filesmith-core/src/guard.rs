use crate::error::{EngineError, EngineResult};
use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Validates that caller-supplied paths resolve inside a configured
/// allow-list before any filesystem access happens.
///
/// Containment is boundary-aware: `/srv/projects-old` is not inside
/// `/srv/projects`, and a path that climbs out via `..` is rejected even
/// when its textual prefix matches.
#[derive(Debug, Clone)]
pub struct PathGuard {
    allowed: Vec<PathBuf>,
}

impl PathGuard {
    /// Build a guard from the configured allow-list. An empty list
    /// disables the guard entirely, which is logged loudly because it
    /// grants the caller full filesystem access.
    pub fn new(allowed_paths: &[PathBuf]) -> Self {
        let allowed: Vec<PathBuf> = allowed_paths
            .iter()
            .map(|p| clean_absolute(p))
            .collect();

        if allowed.is_empty() {
            warn!("path guard disabled: no allowed_paths configured, full filesystem access granted");
        }

        Self { allowed }
    }

    pub fn is_enabled(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Clean and absolutize `path`, then verify it sits under at least one
    /// allowed base. Returns the canonical form on success.
    pub fn validate(&self, path: &Path) -> EngineResult<PathBuf> {
        if path.as_os_str().is_empty() {
            return Err(EngineError::AccessDenied {
                path: path.to_path_buf(),
            });
        }

        let canonical = clean_absolute(path);

        if self.allowed.is_empty() {
            return Ok(canonical);
        }

        for base in &self.allowed {
            if contains(base, &canonical) {
                return Ok(canonical);
            }
        }

        Err(EngineError::AccessDenied {
            path: path.to_path_buf(),
        })
    }
}

/// True when `candidate` is `base` or lives under it. Comparison is
/// case-insensitive on Windows, component-wise everywhere.
fn contains(base: &Path, candidate: &Path) -> bool {
    let Ok(relative) = relative_to(candidate, base) else {
        return false;
    };
    // A cleaned path relative to its base must not climb back out.
    !relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
}

#[cfg(windows)]
fn relative_to(candidate: &Path, base: &Path) -> Result<PathBuf, ()> {
    let cand: Vec<String> = candidate
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();
    let base_parts: Vec<String> = base
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
        .collect();

    if cand.len() < base_parts.len() || cand[..base_parts.len()] != base_parts[..] {
        return Err(());
    }
    let mut rel = PathBuf::new();
    for part in &cand[base_parts.len()..] {
        rel.push(part);
    }
    Ok(rel)
}

#[cfg(not(windows))]
fn relative_to(candidate: &Path, base: &Path) -> Result<PathBuf, ()> {
    candidate
        .strip_prefix(base)
        .map(Path::to_path_buf)
        .map_err(|_| ())
}

/// Lexically clean a path and make it absolute against the working
/// directory. `.` components are dropped and `..` components pop the
/// previous segment so traversal cannot smuggle a path past the prefix
/// check.
pub fn clean_absolute(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("/"))
            .join(path)
    };

    let mut cleaned = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                // Pop a normal segment; never pop past the root.
                if matches!(
                    cleaned.components().next_back(),
                    Some(Component::Normal(_))
                ) {
                    cleaned.pop();
                }
            },
            other => cleaned.push(other.as_os_str()),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_allow_list_accepts_everything() {
        let guard = PathGuard::new(&[]);
        assert!(!guard.is_enabled());
        assert!(guard.validate(Path::new("/etc/hosts")).is_ok());
    }

    #[test]
    fn test_empty_path_rejected_even_when_disabled() {
        let guard = PathGuard::new(&[]);
        assert!(matches!(
            guard.validate(Path::new("")),
            Err(EngineError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_inside_allowed_base() {
        let temp_dir = TempDir::new().unwrap();
        let guard = PathGuard::new(&[temp_dir.path().to_path_buf()]);

        let inside = temp_dir.path().join("project/src/main.rs");
        let validated = guard.validate(&inside).unwrap();
        assert!(validated.starts_with(temp_dir.path()));
    }

    #[test]
    fn test_outside_allowed_base_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let guard = PathGuard::new(&[temp_dir.path().join("projects")]);

        assert!(matches!(
            guard.validate(Path::new("/etc/passwd")),
            Err(EngineError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_traversal_cannot_escape() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("projects");
        let guard = PathGuard::new(&[base.clone()]);

        let sneaky = base.join("sub/../../../../etc/passwd");
        assert!(matches!(
            guard.validate(&sneaky),
            Err(EngineError::AccessDenied { .. })
        ));
    }

    #[test]
    fn test_sibling_prefix_is_not_contained() {
        let temp_dir = TempDir::new().unwrap();
        let base = temp_dir.path().join("projects");
        let guard = PathGuard::new(&[base.clone()]);

        // Shares the textual prefix but is a different directory.
        let sibling = temp_dir.path().join("projects-old/file.txt");
        assert!(guard.validate(&sibling).is_err());
    }

    #[test]
    fn test_base_itself_is_allowed() {
        let temp_dir = TempDir::new().unwrap();
        let guard = PathGuard::new(&[temp_dir.path().to_path_buf()]);
        assert!(guard.validate(temp_dir.path()).is_ok());
    }

    #[test]
    fn test_clean_absolute_collapses_dots() {
        let cleaned = clean_absolute(Path::new("/a/b/./c/../d"));
        assert_eq!(cleaned, PathBuf::from("/a/b/d"));
    }

    #[test]
    fn test_clean_absolute_does_not_pop_past_root() {
        let cleaned = clean_absolute(Path::new("/../../etc"));
        assert_eq!(cleaned, PathBuf::from("/etc"));
    }
}
