//! Whole-run coordination: pre-flight gate, pool dump, every target in
//! order, and the aggregate status.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{error, info, warn};
use vm_config::{BackupConfig, BackupTarget, ExportKind};
use vm_core::error::{Result, VmError};
use vm_core::{disk_space_for, DiskSpace};
use vm_hypervisor::Hypervisor;

use crate::orchestrator::{BackupOptions, Orchestrator, Outcome, TargetReport};
use crate::pool::backup_pool_metadata;
use crate::status_log::{Phase, StatusLog, RUN_KIND};
use crate::Clock;

/// File touched to prove the backup root is writable.
pub const WRITE_TEST_FILE: &str = "00VMbackupWriteTest";

/// Aggregate status of a run.
pub type RunStatus = Outcome;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub backup: BackupOptions,
    /// Name recorded in the status log and used for the pool dump directory.
    pub server_name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub success: u32,
    pub warning: u32,
    pub error: u32,
}

impl RunSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success += 1,
            Outcome::Warning => self.warning += 1,
            Outcome::Error => self.error += 1,
        }
    }

    pub fn status(&self) -> RunStatus {
        if self.error > 0 {
            Outcome::Error
        } else if self.warning > 0 {
            Outcome::Warning
        } else {
            Outcome::Success
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S:{} W:{} E:{}", self.success, self.warning, self.error)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub summary: RunSummary,
    pub status: RunStatus,
    pub targets: Vec<TargetReport>,
    pub pool_dump: Option<PathBuf>,
    #[serde(skip)]
    pub space_before: Option<DiskSpace>,
    #[serde(skip)]
    pub space_after: Option<DiskSpace>,
}

/// Create and remove a scratch file in the backup root.
pub fn check_writable(config: &BackupConfig) -> Result<()> {
    let scratch = config.backup_dir.join(WRITE_TEST_FILE);
    fs::write(&scratch, b"").map_err(|e| VmError::filesystem(e, scratch.to_string_lossy(), "write"))?;
    fs::remove_file(&scratch)
        .map_err(|e| VmError::filesystem(e, scratch.to_string_lossy(), "remove_file"))?;
    info!("Success: backup directory area is writable");
    Ok(())
}

fn log_space(label: &str, space: &Option<DiskSpace>) {
    match space {
        Some(space) => info!(
            "{} {}: {} of {} bytes free ({:.0}% used)",
            label,
            space.mount_point.display(),
            space.available_bytes,
            space.total_bytes,
            space.used_percent()
        ),
        None => warn!("{} unknown filesystem", label),
    }
}

/// Back up every target: VDI exports first, then VM exports.
///
/// Returns an error only for run-level failures; per-target problems are
/// in the report.
pub fn run_backup(
    config: &BackupConfig,
    targets: &[BackupTarget],
    options: &RunOptions,
    hypervisor: &dyn Hypervisor,
    clock: &dyn Clock,
) -> Result<RunReport> {
    let status_log = if config.status_log_enabled() {
        StatusLog::new(Some(config.status_log.clone()), options.server_name.clone())
    } else {
        StatusLog::disabled()
    };
    let append = |phase: Phase, status: &str| {
        if let Err(e) = status_log.append(clock.now(), RUN_KIND, phase, status) {
            warn!("status log write failed: {}", e);
        }
    };

    append(Phase::Begin, "");
    config.log_settings(options.backup.compress);

    if let Err(e) = check_writable(config) {
        error!("failed to write to backup directory area - FATAL ERROR");
        append(Phase::End, &format!("{},{}", Outcome::Error, RunSummary::default()));
        return Err(e);
    }

    let space_before = disk_space_for(&config.backup_dir);
    log_space("Space before backups:", &space_before);

    let mut summary = RunSummary::default();
    let mut pool_dump = None;
    if config.pool_db_backup == 1 {
        info!("*** begin backup_pool_metadata ***");
        match backup_pool_metadata(hypervisor, &config.backup_dir, &options.server_name, clock.now()) {
            Ok(path) => pool_dump = path,
            Err(e) => {
                error!("pool database dump failed: {}", e);
                summary.error += 1;
            }
        }
    }

    let orchestrator = Orchestrator::new(
        hypervisor,
        &config.backup_dir,
        options.backup,
        clock,
        &status_log,
    );

    let mut reports = Vec::with_capacity(targets.len());
    for kind in [ExportKind::VdiExport, ExportKind::VmExport] {
        info!("************ {}= ***************", kind);
        for target in targets.iter().filter(|t| t.export_kind == kind) {
            let report = orchestrator.backup(target);
            summary.record(report.outcome);
            reports.push(report);
        }
    }

    let space_after = disk_space_for(&config.backup_dir);
    log_space("Space after backups:", &space_after);

    let status = summary.status();
    append(Phase::End, &format!("{},{}", status, summary));
    match status {
        Outcome::Error => error!("vmbackup ended - **ERRORS DETECTED** - {}", summary),
        Outcome::Warning => warn!("vmbackup ended - **WARNING(s)** - {}", summary),
        Outcome::Success => info!("vmbackup ended - Success - {}", summary),
    }

    Ok(RunReport {
        summary,
        status,
        targets: reports,
        pool_dump,
        space_before,
        space_after,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_summary_status() {
        let mut summary = RunSummary::default();
        assert_eq!(summary.status(), Outcome::Success);
        summary.record(Outcome::Success);
        summary.record(Outcome::Warning);
        assert_eq!(summary.status(), Outcome::Warning);
        summary.record(Outcome::Error);
        assert_eq!(summary.status(), Outcome::Error);
        assert_eq!(summary.to_string(), "S:1 W:1 E:1");
    }

    #[test]
    fn test_check_writable() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            ..BackupConfig::default()
        };
        check_writable(&config).unwrap();
        assert!(!dir.path().join(WRITE_TEST_FILE).exists());
    }

    #[test]
    fn test_check_writable_missing_dir() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().join("absent"),
            ..BackupConfig::default()
        };
        assert!(matches!(
            check_writable(&config),
            Err(VmError::Filesystem { .. })
        ));
    }
}
