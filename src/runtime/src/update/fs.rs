//! Directory operations behind backup, staging and revert.

use hmp_update_core::error::{Result, UpdateError};
use std::path::{Path, PathBuf};

/// Remove `path` recursively if it exists.
pub(crate) fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdateError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to remove {}: {}", path.display(), e),
        ))),
    }
}

/// Recursively copy `src` into `dst`.
pub(crate) fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| {
        UpdateError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to create directory {}: {}", dst.display(), e),
        ))
    })?;

    for entry in std::fs::read_dir(src).map_err(|e| {
        UpdateError::PathInvalid(format!("failed to read directory {}: {}", src.display(), e))
    })? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            std::fs::copy(&src_path, &dst_path).map_err(|e| {
                UpdateError::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "failed to copy {} to {}: {}",
                        src_path.display(),
                        dst_path.display(),
                        e
                    ),
                ))
            })?;
        }
    }
    Ok(())
}

/// Recreate `src` at `dst` out of hard links, keeping directory permissions.
pub(crate) fn link_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    std::fs::set_permissions(dst, std::fs::metadata(src)?.permissions())?;

    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            link_tree(&src_path, &dst_path)?;
        } else {
            std::fs::hard_link(&src_path, &dst_path)?;
        }
    }
    Ok(())
}

/// Snapshot `active` into `backup` with hard links.
///
/// Any previous backup is replaced. Returns `false` when there is no active
/// generation to back up. A partially linked backup is removed before
/// [`UpdateError::BackupFailed`] is returned.
pub(crate) fn backup_generation(active: &Path, backup: &Path) -> Result<bool> {
    if !active.is_dir() {
        return Ok(false);
    }
    remove_dir_if_exists(backup).map_err(|e| UpdateError::BackupFailed(e.to_string()))?;

    if let Err(e) = link_tree(active, backup) {
        if let Err(cleanup) = remove_dir_if_exists(backup) {
            tracing::warn!(path = %backup.display(), error = %cleanup, "Failed to remove partial backup");
        }
        return Err(UpdateError::BackupFailed(format!(
            "linking {} into {}: {}",
            active.display(),
            backup.display(),
            e
        )));
    }

    tracing::info!(active = %active.display(), backup = %backup.display(), "Backed up active generation");
    Ok(true)
}

/// Rename `from` over `to`, removing whatever `to` held before.
pub(crate) fn replace_dir(from: &Path, to: &Path) -> Result<()> {
    remove_dir_if_exists(to)?;
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(from, to).map_err(|e| {
        UpdateError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to rename {} to {}: {}", from.display(), to.display(), e),
        ))
    })
}

/// Removes a directory on every exit path of the scope holding it.
#[derive(Debug)]
pub(crate) struct DirGuard {
    path: PathBuf,
}

impl DirGuard {
    pub(crate) fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Drop for DirGuard {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to clean up directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};

    fn populate(dir: &Path) {
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("pack.info"), "{}").unwrap();
        std::fs::write(dir.join("a.zip"), b"module a").unwrap();
        std::fs::write(dir.join("nested/b.bin"), b"module b").unwrap();
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).unwrap();
        std::fs::set_permissions(dir.join("a.zip"), std::fs::Permissions::from_mode(0o640))
            .unwrap();
    }

    #[test]
    fn test_backup_links_and_keeps_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("active/demo");
        let backup = dir.path().join("backup/demo");
        populate(&active);

        assert!(backup_generation(&active, &backup).unwrap());

        let src = std::fs::metadata(active.join("a.zip")).unwrap();
        let dst = std::fs::metadata(backup.join("a.zip")).unwrap();
        assert_eq!(src.ino(), dst.ino());
        assert_eq!(dst.permissions().mode() & 0o777, 0o640);
        assert_eq!(
            std::fs::metadata(&backup).unwrap().permissions().mode() & 0o777,
            0o750
        );
        assert_eq!(std::fs::read(backup.join("nested/b.bin")).unwrap(), b"module b");
    }

    #[test]
    fn test_backup_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("active/demo");
        let backup = dir.path().join("backup/demo");
        populate(&active);
        std::fs::create_dir_all(&backup).unwrap();
        std::fs::write(backup.join("stale.zip"), b"old").unwrap();

        backup_generation(&active, &backup).unwrap();
        assert!(!backup.join("stale.zip").exists());
        assert!(backup.join("a.zip").exists());
    }

    #[test]
    fn test_backup_without_active_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let backup = dir.path().join("backup/demo");
        assert!(!backup_generation(&dir.path().join("active/demo"), &backup).unwrap());
        assert!(!backup.exists());
    }

    #[test]
    fn test_failed_backup_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let active = dir.path().join("active/demo");
        populate(&active);
        // A regular file where the backup parent should be makes linking fail.
        std::fs::write(dir.path().join("backup"), b"").unwrap();
        let backup = dir.path().join("backup/demo");

        let err = backup_generation(&active, &backup).unwrap_err();
        assert!(matches!(err, UpdateError::BackupFailed(_)));
        assert!(!backup.exists());
    }

    #[test]
    fn test_replace_dir() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("staged/demo");
        let to = dir.path().join("active/demo");
        populate(&from);
        std::fs::create_dir_all(&to).unwrap();
        std::fs::write(to.join("old.zip"), b"old").unwrap();

        replace_dir(&from, &to).unwrap();
        assert!(!from.exists());
        assert!(to.join("a.zip").exists());
        assert!(!to.join("old.zip").exists());
    }

    #[test]
    fn test_copy_dir_recursive() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        populate(&src);
        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(std::fs::read(dst.join("a.zip")).unwrap(), b"module a");
        assert_eq!(std::fs::read(dst.join("nested/b.bin")).unwrap(), b"module b");

        let err = copy_dir_recursive(&dir.path().join("missing"), &dst).unwrap_err();
        assert!(matches!(err, UpdateError::PathInvalid(_)));
    }

    #[test]
    fn test_dir_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("staged");
        std::fs::create_dir_all(&path).unwrap();
        std::fs::write(path.join("a.zip"), b"staged").unwrap();
        {
            let _guard = DirGuard::new(&path);
        }
        assert!(!path.exists());

        // Already gone: nothing to do.
        drop(DirGuard::new(&path));
    }
}
