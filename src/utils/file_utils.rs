//! File system utilities

use std::path::{Path, PathBuf};

use crate::core::error_handling::{DownloadError, DownloadResult};

/// Create `path` (and parents) and return its canonical form.
/// Fails with a setup error when it cannot be created or is not a directory.
pub async fn ensure_directory(path: &Path) -> DownloadResult<PathBuf> {
    if let Err(err) = tokio::fs::create_dir_all(path).await {
        if !path.exists() {
            return Err(DownloadError::setup(
                path,
                format!("can't create folder for destination file: {err}"),
            ));
        }
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| DownloadError::setup(path, format!("can't inspect folder: {e}")))?;
    if !metadata.is_dir() {
        return Err(DownloadError::setup(path, "is not a directory"));
    }

    tokio::fs::canonicalize(path)
        .await
        .map_err(|e| DownloadError::setup(path, format!("can't resolve folder: {e}")))
}

/// `<file><suffix>`, e.g. `movie.mp4` -> `movie.mp4-parts`
pub fn sibling_with_suffix(file: &Path, suffix: &str) -> PathBuf {
    let mut name = file.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Sanitize filename for filesystem
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_ensure_directory_creates_nested() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a").join("b");
        let canonical = ensure_directory(&target).await.unwrap();
        assert!(canonical.is_dir());
        assert!(canonical.is_absolute());
    }

    #[tokio::test]
    async fn test_ensure_directory_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let err = ensure_directory(&file).await.unwrap_err();
        assert!(matches!(err, DownloadError::Setup { .. }));
    }

    #[test]
    fn test_sibling_with_suffix() {
        let path = sibling_with_suffix(Path::new("/dl/movie.mp4"), "-parts");
        assert_eq!(path, PathBuf::from("/dl/movie.mp4-parts"));
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c?.mp4"), "a_b_c_.mp4");
    }
}
