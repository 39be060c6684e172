// ABOUTME: Free-space probing so writes fail fast instead of leaving truncated artifacts.
// ABOUTME: The system probe asks sysinfo for the disk whose mount point contains the path.

use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use sysinfo::Disks;

use crate::contract::StorageError;

/// Reports how many bytes are available to the filesystem holding a path.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// `None` when the free space cannot be determined.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Probe backed by the operating system's disk list.
pub struct SystemSpaceProbe {
    disks: Mutex<Disks>,
}

impl SystemSpaceProbe {
    pub fn new() -> Self {
        Self {
            disks: Mutex::new(Disks::new_with_refreshed_list()),
        }
    }
}

impl Default for SystemSpaceProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SystemSpaceProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemSpaceProbe").finish_non_exhaustive()
    }
}

impl SpaceProbe for SystemSpaceProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let target = path.canonicalize().ok()?;
        let mut disks = match self.disks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        disks.refresh();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// A probe that always reports the same value. Useful for exercising the
/// low-space path.
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub Option<u64>);

impl SpaceProbe for FixedSpaceProbe {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

/// Fail with `InsufficientDiskSpace` unless `payload` bytes plus `reserve`
/// fit on the filesystem holding `dir`.
pub(crate) fn ensure_space(
    probe: &dyn SpaceProbe,
    dir: &Path,
    payload: u64,
    reserve: u64,
) -> Result<(), StorageError> {
    let required = payload.saturating_add(reserve);
    match probe.available_bytes(dir) {
        Some(available) if available < required => {
            tracing::warn!(
                required,
                available,
                "refusing write to {}: not enough free space",
                dir.display()
            );
            Err(StorageError::InsufficientDiskSpace {
                required,
                available,
            })
        }
        Some(_) => Ok(()),
        None => {
            tracing::debug!("free space unknown for {}, writing anyway", dir.display());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn low_space_is_rejected() {
        let dir = TempDir::new().unwrap();
        let probe = FixedSpaceProbe(Some(100));
        let err = ensure_space(&probe, dir.path(), 50, 64).unwrap_err();
        assert!(matches!(
            err,
            StorageError::InsufficientDiskSpace {
                required: 114,
                available: 100
            }
        ));
    }

    #[test]
    fn unknown_space_allows_write() {
        let dir = TempDir::new().unwrap();
        ensure_space(&FixedSpaceProbe(None), dir.path(), 50, 64).unwrap();
    }

    #[test]
    fn system_probe_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let _ = SystemSpaceProbe::new().available_bytes(dir.path());
    }
}
