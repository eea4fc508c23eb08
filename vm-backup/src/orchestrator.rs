//! Per-target backup workflow.
//!
//! Each [`BackupTarget`] walks the same states:
//!
//! ```text
//! Start -> MetaCollected -> PriorSnapshotCleaned -> SnapshotTaken
//!       -> Exported -> SnapshotDestroyed -> Finalized
//! ```
//!
//! A hard failure before `Exported` ends the target as [`Outcome::Error`]
//! without touching the in-flight snapshot. Soft failures are recorded as
//! warnings and the workflow carries on.

// Standard library
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

// External crates
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};
use vm_config::{BackupTarget, ExportKind, VdiExportFormat};
use vm_core::error::{Result, VmError};
use vm_hypervisor::{ExportOptions, Hypervisor, VmRecord, VmRef};

// Internal imports
use crate::metadata::write_vm_metadata;
use crate::retention::{self, SlotStatus};
use crate::status_log::{Phase, StatusLog};
use crate::Clock;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Classification of one target, and of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Success,
    Warning,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "SUCCESS",
            Outcome::Warning => "WARNING",
            Outcome::Error => "ERROR",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Workflow states, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum State {
    Start,
    MetaCollected,
    PriorSnapshotCleaned,
    SnapshotTaken,
    Exported,
    SnapshotDestroyed,
    Finalized,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BackupOptions {
    pub compress: bool,
    /// Prune history before creating the new slot.
    pub pre_clean: bool,
    pub vdi_export_format: VdiExportFormat,
}

/// Result of backing up one target.
#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub vm: String,
    pub kind: ExportKind,
    pub outcome: Outcome,
    /// Last state reached before finishing.
    pub state: State,
    #[serde(serialize_with = "serialize_secs")]
    pub elapsed: Duration,
    pub size_bytes: Option<u64>,
    pub slot: Option<PathBuf>,
    /// Status-log failure tag, e.g. `SNAPSHOT-FAIL`, for error outcomes.
    pub failure: Option<String>,
    pub warnings: Vec<String>,
}

fn serialize_secs<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_secs())
}

impl TargetReport {
    pub fn size_gib(&self) -> f64 {
        self.size_bytes.map(|b| b as f64 / GIB).unwrap_or(0.0)
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.elapsed.as_secs() as f64 / 60.0
    }

    /// Status column of the target's `end` line in the status log.
    pub fn status_text(&self) -> String {
        match self.outcome {
            Outcome::Error => format!(
                "{} {}",
                self.failure.as_deref().unwrap_or("ERROR"),
                self.vm
            ),
            outcome => format!(
                "{} {},elapse:{:.2} size:{:.2}G",
                outcome,
                self.vm,
                self.elapsed_minutes(),
                self.size_gib()
            ),
        }
    }

    /// One-line detail for console summaries.
    pub fn detail(&self) -> String {
        match (&self.failure, self.warnings.first()) {
            (Some(tag), _) => tag.clone(),
            (None, Some(first)) => first.clone(),
            (None, None) => format!(
                "{:.2}G in {:.1} min",
                self.size_gib(),
                self.elapsed_minutes()
            ),
        }
    }
}

/// A hard failure: the status-log tag plus the error behind it.
struct Failure {
    tag: String,
    error: VmError,
}

impl Failure {
    fn new(tag: impl Into<String>, error: VmError) -> Self {
        Self {
            tag: tag.into(),
            error,
        }
    }
}

/// Snapshot name used to find leftovers from an earlier run.
pub fn snapshot_label(kind: ExportKind, vm: &str, xvda_label: &str) -> String {
    match kind {
        ExportKind::VmExport => format!("RESTORE_{}", vm),
        ExportKind::VdiExport => format!("SNAP_{}_{}", vm, xvda_label).replace(' ', "-"),
    }
}

/// Export file name inside the slot.
pub fn artifact_name(kind: ExportKind, vm: &str, options: &BackupOptions) -> String {
    match kind {
        ExportKind::VmExport if options.compress => format!("{}.xva.gz", vm),
        ExportKind::VmExport => format!("{}.xva", vm),
        ExportKind::VdiExport => format!("{}.{}", vm, options.vdi_export_format),
    }
}

/// Mutable progress of one target.
struct Progress {
    state: State,
    slot: Option<PathBuf>,
    size_bytes: Option<u64>,
    warnings: Vec<String>,
}

impl Progress {
    fn advance(&mut self, state: State) {
        debug!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}

pub struct Orchestrator<'a> {
    hypervisor: &'a dyn Hypervisor,
    backup_dir: &'a Path,
    options: BackupOptions,
    clock: &'a dyn Clock,
    status_log: &'a StatusLog,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        hypervisor: &'a dyn Hypervisor,
        backup_dir: &'a Path,
        options: BackupOptions,
        clock: &'a dyn Clock,
        status_log: &'a StatusLog,
    ) -> Self {
        Self {
            hypervisor,
            backup_dir,
            options,
            clock,
            status_log,
        }
    }

    /// Back up one target. Never fails: every problem ends up in the report.
    pub fn backup(&self, target: &BackupTarget) -> TargetReport {
        let span = info_span!("backup", vm = %target.vm_name, kind = %target.export_kind);
        let _guard = span.enter();

        let kind = target.export_kind;
        info!(
            "*** {} begin {} max_backups: {}",
            kind, target.vm_name, target.max_backups
        );
        let begin = self.clock.now();
        self.log_status(kind.as_str(), Phase::Begin, &target.vm_name);

        let mut progress = Progress {
            state: State::Start,
            slot: None,
            size_bytes: None,
            warnings: Vec::new(),
        };
        let result = self.run(target, &mut progress);

        let (outcome, failure) = match result {
            Ok(()) if progress.warnings.is_empty() => (Outcome::Success, None),
            Ok(()) => (Outcome::Warning, None),
            Err(Failure { tag, error }) => {
                error!("{} {}: {}", tag, target.vm_name, error);
                (Outcome::Error, Some(tag))
            }
        };
        if outcome != Outcome::Error {
            progress.advance(State::Finalized);
        }

        let elapsed = (self.clock.now() - begin).to_std().unwrap_or_default();
        let report = TargetReport {
            vm: target.vm_name.clone(),
            kind,
            outcome,
            state: progress.state,
            elapsed,
            size_bytes: progress.size_bytes,
            slot: progress.slot,
            failure,
            warnings: progress.warnings,
        };

        info!(
            "vmbackup {} {} - {} t:{:.2}",
            kind,
            target.vm_name,
            outcome,
            report.elapsed_minutes()
        );
        self.log_status(kind.as_str(), Phase::End, &report.status_text());
        report
    }

    fn log_status(&self, kind: &str, phase: Phase, status: &str) {
        if let Err(e) = self.status_log.append(self.clock.now(), kind, phase, status) {
            warn!("status log write failed: {}", e);
        }
    }

    fn run(&self, target: &BackupTarget, progress: &mut Progress) -> std::result::Result<(), Failure> {
        let kind = target.export_kind;
        let vm_name = target.vm_name.as_str();

        let vm = self
            .hypervisor
            .find_vm(vm_name)
            .map_err(|e| Failure::new("ERROR verify_vm_name", e))?;

        let vm_dir = self.backup_dir.join(vm_name);
        let slot = self
            .prepare_slot(&vm_dir, target.max_backups)
            .map_err(|e| Failure::new("ERROR backup_dir", e))?;
        progress.slot = Some(slot.clone());

        let record = self
            .collect_metadata(&vm, &slot, progress)
            .map_err(|e| Failure::new("ERROR gather_vm_meta", e))?;

        let (source_uuid, xvda_label) = match kind {
            ExportKind::VmExport => {
                if record.uuid.is_empty() {
                    return Err(Failure::new(
                        "ERROR vm-uuid not found",
                        VmError::hypervisor("vm-list", format!("{} reported no uuid", vm_name)),
                    ));
                }
                (record.uuid.clone(), String::new())
            }
            ExportKind::VdiExport => self.xvda_source(&record, vm_name)?,
        };
        progress.advance(State::MetaCollected);

        let label = snapshot_label(kind, vm_name, &xvda_label);
        self.clean_stale_snapshots(kind, &label, progress);
        progress.advance(State::PriorSnapshotCleaned);

        let snap_tag = match kind {
            ExportKind::VmExport => "SNAPSHOT-FAIL",
            ExportKind::VdiExport => "VDI-SNAPSHOT-FAIL",
        };
        let snap_uuid = self
            .hypervisor
            .snapshot(kind, &source_uuid, &label)
            .map_err(|e| Failure::new(snap_tag, e))?;
        progress.advance(State::SnapshotTaken);

        let (param_tag, params): (&str, Vec<(&str, &str)>) = match kind {
            ExportKind::VmExport => (
                "TEMPLATE-PARAM-SET-FAIL",
                vec![("is-a-template", "false"), ("ha-always-run", "false")],
            ),
            ExportKind::VdiExport => ("VDI-PARAM-SET-FAIL", vec![("name-label", label.as_str())]),
        };
        self.hypervisor
            .set_params(kind, &snap_uuid, &params)
            .map_err(|e| self.orphaned(param_tag, kind, &snap_uuid, e))?;

        let artifact = slot.join(artifact_name(kind, vm_name, &self.options));
        let export_options = ExportOptions {
            compress: self.options.compress,
            vdi_format: self.options.vdi_export_format,
        };
        let export_tag = match kind {
            ExportKind::VmExport => "VM-EXPORT-FAIL",
            ExportKind::VdiExport => "VDI-EXPORT-FAIL",
        };
        self.hypervisor
            .export_snapshot(kind, &snap_uuid, &artifact, &export_options)
            .map_err(|e| self.orphaned(export_tag, kind, &snap_uuid, e))?;
        info!("{} success: {}", kind, artifact.display());
        progress.advance(State::Exported);

        if let Err(e) = self.hypervisor.destroy_snapshot(kind, &snap_uuid) {
            progress.warn(format!("snapshot {} not destroyed: {}", snap_uuid, e));
        }
        progress.advance(State::SnapshotDestroyed);

        let size = fs::metadata(&artifact)
            .map(|m| m.len())
            .map_err(|e| {
                Failure::new(
                    "ERROR-INTERNAL",
                    VmError::filesystem(e, artifact.to_string_lossy(), "metadata"),
                )
            })?;
        progress.size_bytes = Some(size);

        self.finalize(&vm_dir, &slot, size, target.max_backups, progress)
            .map_err(|e| Failure::new("ERROR-INTERNAL", e))
    }

    /// Recover from an interrupted run, optionally pre-prune, then open a new slot.
    fn prepare_slot(&self, vm_dir: &Path, max_backups: u32) -> Result<PathBuf> {
        if let Some(removed) = retention::recover_incomplete(vm_dir)? {
            info!("removed unfinished backup {}", removed);
        }
        if self.options.pre_clean {
            retention::pre_cleanup(vm_dir, max_backups)?;
        }
        retention::create_slot(vm_dir, self.clock.now())
    }

    /// Uuid and label of the `xvda` disk, confirmed to exist on the pool.
    fn xvda_source(
        &self,
        record: &VmRecord,
        vm_name: &str,
    ) -> std::result::Result<(String, String), Failure> {
        let xvda = record
            .xvda()
            .filter(|disk| !disk.vdi.uuid.is_empty())
            .ok_or_else(|| {
                Failure::new(
                    "ERROR xvda-uuid not found",
                    VmError::hypervisor("vbd-list", format!("{} has no xvda disk", vm_name)),
                )
            })?;
        if xvda.vdi.name_label.is_empty() {
            return Err(Failure::new(
                "ERROR xvda-name-label not found",
                VmError::hypervisor("vdi-list", format!("xvda of {} has no name-label", vm_name)),
            ));
        }
        self.hypervisor
            .vdi_info(&xvda.vdi.uuid)
            .map_err(|e| Failure::new("VDI-LIST-FAIL", e))?;
        Ok((xvda.vdi.uuid.clone(), xvda.vdi.name_label.clone()))
    }

    fn collect_metadata(&self, vm: &VmRef, slot: &Path, progress: &mut Progress) -> Result<VmRecord> {
        let record = self.hypervisor.vm_record(vm)?;
        let report = write_vm_metadata(self.hypervisor, &record, slot)?;
        for warning in report.warnings {
            progress.warn(format!("gather_vm_meta: {}", warning));
        }
        Ok(record)
    }

    /// Destroy snapshots left by an earlier run. Failures are warnings.
    fn clean_stale_snapshots(&self, kind: ExportKind, label: &str, progress: &mut Progress) {
        info!("check for prev-snapshot: {}", label);
        let stale = match self.hypervisor.find_snapshots(kind, label) {
            Ok(stale) => stale,
            Err(e) => {
                progress.warn(format!("prev-snapshot lookup failed: {}", e));
                return;
            }
        };
        for uuid in stale {
            info!("cleanup old snapshot: {}", uuid);
            if let Err(e) = self.hypervisor.destroy_snapshot(kind, &uuid) {
                progress.warn(format!("old snapshot {} not destroyed: {}", uuid, e));
            }
        }
    }

    /// The snapshot is left on the pool for inspection; say where it is.
    fn orphaned(&self, tag: &str, kind: ExportKind, snap_uuid: &str, error: VmError) -> Failure {
        warn!(
            "{} snapshot {} left in place after failure",
            kind, snap_uuid
        );
        Failure::new(tag, error)
    }

    fn finalize(
        &self,
        vm_dir: &Path,
        slot: &Path,
        size: u64,
        max_backups: u32,
        progress: &mut Progress,
    ) -> Result<()> {
        let status = retention::mark_success(slot, size)?;
        if status == SlotStatus::SuccessCompress {
            info!("*** LARGE FILE > 60G: {:.2}G", size as f64 / GIB);
        }
        retention::prune(vm_dir, max_backups)?;
        if !retention::all_slots_successful(vm_dir)? {
            progress.warn("cleanup needed - not all backup history is successful".to_string());
        }
        Ok(())
    }
}
