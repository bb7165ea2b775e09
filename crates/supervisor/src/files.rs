//! Filesystem helpers for setup steps that must be safe to re-run.
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;

use anyhow::Context;

/// Writes `contents` to `path` with the given mode.
///
/// The data goes to a temporary file in the same directory which is renamed
/// over `path`, so readers never see a partial file and an existing read-only
/// file is replaced.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8], mode: u32) -> anyhow::Result<()> {
    let path = path.as_ref();
    let dir = path
        .parent()
        .with_context(|| format!("{} has no parent directory", path.display()))?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temporary file in {}", dir.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))?;
    file.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync {}", path.display()))?;
    std::fs::set_permissions(file.path(), Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("failed to move {} into place", path.display()))?;
    Ok(())
}

/// Creates `path` (and missing parents) and sets its mode.
pub fn ensure_dir<P: AsRef<Path>>(path: P, mode: u32) -> anyhow::Result<()> {
    let path = path.as_ref();
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(mode)
        .create(path)
        .with_context(|| format!("failed to create directory {}", path.display()))?;
    std::fs::set_permissions(path, Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn mode(path: &Path) -> u32 {
        std::fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn writes_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/kubeconfig");
        write_atomic(&path, b"hello", 0o600).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
        assert_eq!(mode(&path), 0o600);
    }

    #[test]
    fn rewrite_replaces_read_only_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ca.crt");
        write_atomic(&path, b"first", 0o400).unwrap();
        write_atomic(&path, b"second", 0o400).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert_eq!(mode(&path), 0o400);
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn ensure_dir_fixes_mode_of_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pki");
        std::fs::create_dir(&path).unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o755)).unwrap();
        ensure_dir(&path, 0o700).unwrap();
        assert_eq!(mode(&path), 0o700);
    }
}
