//! Host facts the backup run reports on: the short hostname and the
//! free space on the filesystem that holds the backup tree.

use std::path::{Path, PathBuf};

use sysinfo::{Disks, System};

/// Space figures for the filesystem containing a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpace {
    pub mount_point: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskSpace {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        used as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Full hostname, or `"localhost"` when it cannot be read.
pub fn hostname() -> String {
    System::host_name()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Hostname up to the first dot.
pub fn short_hostname() -> String {
    let full = hostname();
    match full.split_once('.') {
        Some((short, _)) if !short.is_empty() => short.to_string(),
        _ => full,
    }
}

/// Disk space for the mount point that contains `path`.
///
/// Returns `None` when no mounted filesystem is a prefix of the path.
pub fn disk_space_for(path: &Path) -> Option<DiskSpace> {
    let target = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();

    disks
        .iter()
        .filter(|disk| target.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| DiskSpace {
            mount_point: disk.mount_point().to_path_buf(),
            total_bytes: disk.total_space(),
            available_bytes: disk.available_space(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_percent() {
        let space = DiskSpace {
            mount_point: PathBuf::from("/"),
            total_bytes: 200,
            available_bytes: 50,
        };
        assert!((space.used_percent() - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_used_percent_empty_disk() {
        let space = DiskSpace {
            mount_point: PathBuf::from("/"),
            total_bytes: 0,
            available_bytes: 0,
        };
        assert_eq!(space.used_percent(), 0.0);
    }

    #[test]
    fn test_short_hostname_has_no_domain() {
        let name = short_hostname();
        assert!(!name.is_empty());
        assert!(!name.contains('.'));
    }
}
