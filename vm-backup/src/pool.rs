//! Pool database dump, taken once per run from the pool master.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tracing::info;
use vm_core::error::{Result, VmError};
use vm_hypervisor::Hypervisor;

/// Where a dump taken at `now` is written.
pub fn dump_path(backup_dir: &Path, server: &str, now: NaiveDateTime) -> PathBuf {
    backup_dir
        .join(format!("METADATA_{}", server))
        .join(format!("pool_db_{}.dump", now.format("%Y%m%d-%H%M%S")))
}

/// Dump the pool database when this host is the pool master.
///
/// Returns the dump path, or `None` when this host is not the master.
pub fn backup_pool_metadata(
    hypervisor: &dyn Hypervisor,
    backup_dir: &Path,
    server: &str,
    now: NaiveDateTime,
) -> Result<Option<PathBuf>> {
    if !hypervisor.is_pool_master()? {
        info!("not pool master, skipping pool database dump");
        return Ok(None);
    }

    let dest = dump_path(backup_dir, server, now);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|source| VmError::DirectoryCreate {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    info!("Dumping pool database to {}", dest.display());
    hypervisor.dump_pool_database(&dest)?;
    Ok(Some(dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::TempDir;
    use vm_hypervisor::mock::{MockHypervisor, MockOp};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(2, 0, 5)
            .unwrap()
    }

    #[test]
    fn test_dump_path_layout() {
        let path = dump_path(Path::new("/snapshots/BACKUPS"), "xen1", now());
        assert_eq!(
            path,
            Path::new("/snapshots/BACKUPS/METADATA_xen1/pool_db_20240307-020005.dump")
        );
    }

    #[test]
    fn test_master_writes_dump() {
        let dir = TempDir::new().unwrap();
        let mock = MockHypervisor::new().as_master();

        let dest = backup_pool_metadata(&mock, dir.path(), "xen1", now())
            .unwrap()
            .unwrap();
        assert!(dest.exists());
        assert!(dest.starts_with(dir.path().join("METADATA_xen1")));
    }

    #[test]
    fn test_non_master_skips() {
        let dir = TempDir::new().unwrap();
        let mock = MockHypervisor::new();

        assert!(backup_pool_metadata(&mock, dir.path(), "xen1", now())
            .unwrap()
            .is_none());
        assert!(mock.calls().is_empty());
    }

    #[test]
    fn test_master_lookup_failure_is_error() {
        let dir = TempDir::new().unwrap();
        let mock = MockHypervisor::new().as_master().failing(MockOp::PoolMaster);

        assert!(backup_pool_metadata(&mock, dir.path(), "xen1", now()).is_err());
        assert!(!dir.path().join("METADATA_xen1").exists());
        assert!(mock.calls().is_empty());
    }
}
