use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Move a file from `src` to `dst`. Uses `rename` first (fast, atomic on
/// same filesystem). Falls back to copy + delete when rename fails — this
/// handles cross-device moves out of an upload staging area.
pub fn move_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    // Fast path: atomic rename
    if std::fs::rename(src, dst).is_ok() {
        return Ok(());
    }

    // Slow path: copy then remove original
    std::fs::copy(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    std::fs::remove_file(src).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })?;
    Ok(())
}

pub fn ensure_dir(path: &Path) -> Result<(), StorageError> {
    if !path.exists() {
        std::fs::create_dir_all(path).map_err(|e| StorageError::CreateDirectory {
            path: path.to_path_buf(),
            source: e,
        })?;
    }
    Ok(())
}

/// Total size in bytes of all files under `dir`. Returns 0 for a missing
/// directory.
pub fn dir_size(dir: &Path) -> u64 {
    if !dir.exists() {
        return 0;
    }
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Removes a directory tree. Missing directories are not an error — the
/// sweep re-evaluates rows on every pass, so a dangling row whose files
/// are already gone must still be removable.
pub fn remove_dir_if_exists(dir: &Path) -> Result<bool, StorageError> {
    if !dir.exists() {
        return Ok(false);
    }
    std::fs::remove_dir_all(dir).map_err(|e| StorageError::Remove {
        path: dir.to_path_buf(),
        source: e,
    })?;
    Ok(true)
}

/// Removes a single file, tolerating its absence.
pub fn remove_file_if_exists(path: &Path) -> Result<bool, StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::Remove {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Replaces `dst` with `src` (same directory), used when a converted
/// output supersedes the staged original.
pub fn replace_file(src: &Path, dst: &Path) -> Result<(), StorageError> {
    remove_file_if_exists(dst)?;
    std::fs::rename(src, dst).map_err(|e| StorageError::MoveFile {
        from: src.to_path_buf(),
        to: dst.to_path_buf(),
        source: e,
    })
}

pub fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("artifact")
        .to_string()
}

/// Sibling path with a different extension (`abc.tif` -> `abc.jpg`).
pub fn sibling_with_extension(path: &Path, ext: &str) -> PathBuf {
    path.with_extension(ext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_move_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.bin");
        let dst = tmp.path().join("b.bin");
        std::fs::write(&src, b"payload").unwrap();

        move_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }

    #[test]
    fn test_move_missing_file_errors() {
        let tmp = TempDir::new().unwrap();
        let result = move_file(&tmp.path().join("missing"), &tmp.path().join("dst"));
        assert!(matches!(result, Err(StorageError::MoveFile { .. })));
    }

    #[test]
    fn test_dir_size_sums_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/b"), vec![0u8; 50]).unwrap();

        assert_eq!(dir_size(tmp.path()), 150);
    }

    #[test]
    fn test_dir_size_missing_is_zero() {
        assert_eq!(dir_size(Path::new("/nonexistent/flightline")), 0);
    }

    #[test]
    fn test_remove_dir_if_exists_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("victim");
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("f"), b"x").unwrap();

        assert!(remove_dir_if_exists(&dir).unwrap());
        assert!(!remove_dir_if_exists(&dir).unwrap());
        assert!(!dir.exists());
    }

    #[test]
    fn test_replace_file() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("new.tif");
        let dst = tmp.path().join("old.tif");
        std::fs::write(&src, b"cog").unwrap();
        std::fs::write(&dst, b"original").unwrap();

        replace_file(&src, &dst).unwrap();

        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"cog");
    }

    #[test]
    fn test_sibling_with_extension() {
        let p = Path::new("/x/y/abc.tif");
        assert_eq!(sibling_with_extension(p, "jpg"), PathBuf::from("/x/y/abc.jpg"));
    }
}
