use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;

use crate::error::{ScopeError, ScopeResult};

/// Resolve a user-supplied relative path against `base`.
///
/// The path is normalised lexically first, so `..` may not climb above
/// `base` even through directories that do not exist. When the target exists
/// it is also canonicalised, which catches symlinks pointing outside `base`.
pub fn resolve_within(base: &Path, relative: &str) -> ScopeResult<PathBuf> {
    let requested = Path::new(relative);
    let traversal = || ScopeError::PathTraversal(requested.to_path_buf());

    let mut normalised = PathBuf::new();
    for component in requested.components() {
        match component {
            Component::Normal(part) => normalised.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalised.pop() {
                    return Err(traversal());
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(traversal()),
        }
    }
    if normalised.as_os_str().is_empty() {
        return Err(ScopeError::Validation("no file selected".to_string()));
    }

    let resolved = base.join(&normalised);
    if resolved.exists() {
        let canonical_base = base
            .canonicalize()
            .map_err(|e| ScopeError::Filesystem(format!("{}: {e}", base.display())))?;
        let canonical = resolved
            .canonicalize()
            .map_err(|e| ScopeError::Filesystem(format!("{}: {e}", resolved.display())))?;
        if !canonical.starts_with(&canonical_base) {
            return Err(traversal());
        }
        return Ok(canonical);
    }
    Ok(resolved)
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path under the base directory, `/`-separated.
    pub relative_path: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub modified: u64,
}

/// Every file under `base` whose extension is in `extensions`, sorted by
/// relative path. A missing base directory lists as empty.
pub fn list_files(base: &Path, extensions: &[String]) -> ScopeResult<Vec<FileEntry>> {
    if !base.is_dir() {
        log::warn!("data directory {} does not exist", base.display());
        return Ok(Vec::new());
    }

    let mut out = Vec::new();
    let mut stack = vec![base.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = fs::read_dir(&dir).map_err(|e| ScopeError::Filesystem(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| ScopeError::Filesystem(e.to_string()))?;
            let file_type = entry
                .file_type()
                .map_err(|e| ScopeError::Filesystem(e.to_string()))?;
            let path = entry.path();
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !has_allowed_extension(&path, extensions) {
                continue;
            }
            let meta = fs::metadata(&path).map_err(|e| ScopeError::Filesystem(e.to_string()))?;
            if !meta.is_file() {
                continue;
            }
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            out.push(FileEntry {
                relative_path: to_slash(relative),
                size: meta.len(),
                modified: meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_secs()),
            });
        }
    }
    out.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(out)
}

fn has_allowed_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn exts(list: &[&str]) -> Vec<String> {
        list.iter().map(|e| e.to_string()).collect()
    }

    #[test]
    fn parent_escape_is_rejected() {
        let result = resolve_within(Path::new("/data"), "../../etc/passwd");
        assert_matches!(result, Err(ScopeError::PathTraversal(_)));
    }

    #[test]
    fn nested_escape_is_rejected() {
        assert_matches!(
            resolve_within(Path::new("/data"), "sub/../../secret"),
            Err(ScopeError::PathTraversal(_))
        );
        assert_matches!(
            resolve_within(Path::new("/data"), "/etc/passwd"),
            Err(ScopeError::PathTraversal(_))
        );
    }

    #[test]
    fn relative_paths_stay_under_base() {
        assert_eq!(
            resolve_within(Path::new("/data"), "sub/file.rds").unwrap(),
            PathBuf::from("/data/sub/file.rds")
        );
        assert_eq!(
            resolve_within(Path::new("/data"), "./a/../b.json").unwrap(),
            PathBuf::from("/data/b.json")
        );
    }

    #[test]
    fn empty_path_is_a_validation_error() {
        assert_matches!(resolve_within(Path::new("/data"), ""), Err(ScopeError::Validation(_)));
        assert_matches!(resolve_within(Path::new("/data"), "a/.."), Err(ScopeError::Validation(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_out_of_base_is_rejected() {
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("secret.json"), "{}").unwrap();
        let base = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), base.path().join("link")).unwrap();

        assert_matches!(
            resolve_within(base.path(), "link/secret.json"),
            Err(ScopeError::PathTraversal(_))
        );
    }

    #[test]
    fn listing_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        fs::write(dir.path().join("z.parquet"), b"1234").unwrap();
        fs::write(dir.path().join("a.JSON"), b"{}").unwrap();
        fs::write(dir.path().join("notes.txt"), b"skip").unwrap();
        fs::write(dir.path().join("b/nested/c.pq"), b"").unwrap();

        let files = list_files(dir.path(), &exts(&["parquet", "pq", "json"])).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();

        assert_eq!(names, vec!["a.JSON", "b/nested/c.pq", "z.parquet"]);
        assert_eq!(files[2].size, 4);
        assert!(files[2].modified > 0);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let files = list_files(&dir.path().join("absent"), &exts(&["json"])).unwrap();
        assert!(files.is_empty());
    }
}
