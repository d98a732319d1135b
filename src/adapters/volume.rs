//! Volume statistics for the host filesystem.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::VolumeProbe;

/// Reads free space and mount information from the local filesystem
#[derive(Debug, Default, Clone)]
pub struct HostVolumes;

impl HostVolumes {
    pub fn new() -> Self {
        Self
    }
}

/// Closest ancestor of `path` that exists (output directories may not yet)
fn existing_ancestor(path: &Path) -> Result<PathBuf> {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .with_context(|| format!("No existing ancestor for {}", path.display()))
}

impl VolumeProbe for HostVolumes {
    fn free_bytes(&self, path: &Path) -> Result<u64> {
        let target = existing_ancestor(path)?;
        fs2::available_space(&target)
            .with_context(|| format!("Failed to read free space for {}", target.display()))
    }

    #[cfg(unix)]
    fn volume_id(&self, path: &Path) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;

        let target = existing_ancestor(path)?;
        let meta = std::fs::metadata(&target)
            .with_context(|| format!("Failed to stat {}", target.display()))?;
        Ok(meta.dev())
    }

    #[cfg(not(unix))]
    fn volume_id(&self, path: &Path) -> Result<u64> {
        // No device ids here; everything counts as one volume
        existing_ancestor(path)?;
        Ok(0)
    }

    #[cfg(unix)]
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        use std::os::unix::fs::MetadataExt;

        let meta = std::fs::metadata(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        let canonical = path
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", path.display()))?;

        let Some(parent) = canonical.parent() else {
            // Filesystem root
            return Ok(true);
        };
        let parent_meta = std::fs::metadata(parent)
            .with_context(|| format!("Failed to stat {}", parent.display()))?;

        Ok(meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino())
    }

    #[cfg(not(unix))]
    fn is_mount_point(&self, path: &Path) -> Result<bool> {
        Ok(path.parent().is_none())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_root_is_mount_point() {
        assert!(HostVolumes::new().is_mount_point(Path::new("/")).unwrap());
    }

    #[test]
    fn test_plain_directory_is_not_mount_point() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("recordings");
        std::fs::create_dir(&dir).unwrap();
        assert!(!HostVolumes::new().is_mount_point(&dir).unwrap());
    }

    #[test]
    fn test_free_space_for_missing_directory() {
        let temp = TempDir::new().unwrap();
        let volumes = HostVolumes::new();
        let missing = temp.path().join("not").join("yet");

        assert!(volumes.free_bytes(&missing).unwrap() > 0);
        assert_eq!(
            volumes.volume_id(&missing).unwrap(),
            volumes.volume_id(temp.path()).unwrap()
        );
    }
}
