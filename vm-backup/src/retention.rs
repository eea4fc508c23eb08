//! Backup history of one VM: `backup_dir/<vm>/backup-<timestamp>/` slots
//! whose outcome is recorded by a zero-byte marker file.
//!
//! Slot names sort chronologically, so every operation here works on
//! the subdirectories of the VM directory sorted by name.

// Standard library
use std::fs;
use std::path::{Path, PathBuf};

// External crates
use chrono::NaiveDateTime;
use tracing::{debug, info, warn};
use vm_core::error::{Result, VmError};

/// Slot directory name prefix.
pub const SLOT_PREFIX: &str = "backup-";

/// Timestamp layout of slot names. Existing backup trees use this exact
/// layout, so it must not change.
pub const SLOT_TIMESTAMP_FORMAT: &str = "%Y-%m--%d-(%H:%M:%S)";

/// Artifacts larger than this get `success_compress` instead of `success`.
pub const COMPRESS_THRESHOLD_BYTES: u64 = 60 * 1024 * 1024 * 1024;

/// Outcome recorded in a slot, derived from its marker file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Success,
    /// Successful, and large enough to be compressed out of band.
    SuccessCompress,
    SuccessRestore,
    /// Out-of-band compression is in progress.
    SuccessCompressing,
    /// No marker: the backup never finished.
    Incomplete,
}

impl SlotStatus {
    /// Every success marker, in lookup order.
    pub const MARKERS: [SlotStatus; 4] = [
        SlotStatus::Success,
        SlotStatus::SuccessCompress,
        SlotStatus::SuccessRestore,
        SlotStatus::SuccessCompressing,
    ];

    pub fn marker_name(&self) -> Option<&'static str> {
        match self {
            SlotStatus::Success => Some("success"),
            SlotStatus::SuccessCompress => Some("success_compress"),
            SlotStatus::SuccessRestore => Some("success_restore"),
            SlotStatus::SuccessCompressing => Some("success_compressing"),
            SlotStatus::Incomplete => None,
        }
    }

    pub fn is_successful(&self) -> bool {
        !matches!(self, SlotStatus::Incomplete)
    }

    /// Scan a slot directory for a marker.
    pub fn scan(slot: &Path) -> Self {
        Self::MARKERS
            .into_iter()
            .find(|status| {
                status
                    .marker_name()
                    .is_some_and(|marker| slot.join(marker).is_file())
            })
            .unwrap_or(SlotStatus::Incomplete)
    }
}

/// One backup attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub name: String,
    pub path: PathBuf,
    pub status: SlotStatus,
}

/// Slot directory name for a point in time.
pub fn slot_name(now: NaiveDateTime) -> String {
    format!("{}{}", SLOT_PREFIX, now.format(SLOT_TIMESTAMP_FORMAT))
}

/// Immediate subdirectories of `vm_dir`, oldest first.
///
/// A missing directory has no slots.
pub fn list_slots(vm_dir: &Path) -> Result<Vec<Slot>> {
    if !vm_dir.exists() {
        return Ok(Vec::new());
    }

    let read_dir = fs::read_dir(vm_dir)
        .map_err(|e| VmError::filesystem(e, vm_dir.to_string_lossy(), "read_dir"))?;

    let mut slots: Vec<Slot> = read_dir
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let path = entry.path();
            Slot {
                name: entry.file_name().to_string_lossy().into_owned(),
                status: SlotStatus::scan(&path),
                path,
            }
        })
        .collect();

    slots.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(slots)
}

fn remove_slot(slot: &Slot) -> Result<()> {
    fs::remove_dir_all(&slot.path)
        .map_err(|e| VmError::filesystem(e, slot.path.to_string_lossy(), "remove_dir_all"))
}

/// Delete the newest slot if it never finished.
///
/// Only considered when there are at least two slots; earlier unmarked
/// slots are left alone. Returns the removed slot name.
pub fn recover_incomplete(vm_dir: &Path) -> Result<Option<String>> {
    let slots = list_slots(vm_dir)?;
    if slots.len() < 2 {
        return Ok(None);
    }

    match slots.last() {
        Some(last) if !last.status.is_successful() => {
            info!(
                "Delete last unsuccessful backup {}",
                last.path.display()
            );
            remove_slot(last)?;
            Ok(Some(last.name.clone()))
        }
        _ => Ok(None),
    }
}

/// Create `vm_dir` if needed, then a new slot named for `now`.
pub fn create_slot(vm_dir: &Path, now: NaiveDateTime) -> Result<PathBuf> {
    fs::create_dir_all(vm_dir).map_err(|source| VmError::DirectoryCreate {
        path: vm_dir.to_path_buf(),
        source,
    })?;

    let slot = vm_dir.join(slot_name(now));
    fs::create_dir(&slot).map_err(|source| VmError::DirectoryCreate {
        path: slot.clone(),
        source,
    })?;

    info!("new backup_dir: {}", slot.display());
    Ok(slot)
}

/// Write the success marker for a finished slot and return the status written.
pub fn mark_success(slot: &Path, size_bytes: u64) -> Result<SlotStatus> {
    let status = if size_bytes > COMPRESS_THRESHOLD_BYTES {
        info!("large backup ({} bytes) marked for compression", size_bytes);
        SlotStatus::SuccessCompress
    } else {
        SlotStatus::Success
    };

    for stale in SlotStatus::MARKERS {
        if let Some(marker) = stale.marker_name() {
            let path = slot.join(marker);
            if stale != status && path.exists() {
                fs::remove_file(&path)
                    .map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "remove_file"))?;
            }
        }
    }

    if let Some(marker) = status.marker_name() {
        let path = slot.join(marker);
        fs::File::create(&path)
            .map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "create"))?;
        debug!("marker written: {}", path.display());
    }
    Ok(status)
}

/// Delete the oldest slots while more than `ceiling` remain, never
/// removing the last one.
fn prune_to(vm_dir: &Path, ceiling: usize) -> Result<Vec<String>> {
    let mut removed = Vec::new();
    loop {
        let slots = list_slots(vm_dir)?;
        if slots.len() <= ceiling || slots.len() <= 1 {
            break;
        }
        let oldest = &slots[0];
        info!("Deleting oldest backup {}", oldest.path.display());
        remove_slot(oldest)?;
        removed.push(oldest.name.clone());
    }
    Ok(removed)
}

/// Keep at most `max_backups` slots. Returns removed slot names, oldest first.
pub fn prune(vm_dir: &Path, max_backups: u32) -> Result<Vec<String>> {
    prune_to(vm_dir, max_backups as usize)
}

/// Make room for one more slot before it is created.
pub fn pre_cleanup(vm_dir: &Path, max_backups: u32) -> Result<Vec<String>> {
    let ceiling = max_backups.saturating_sub(1);
    if ceiling < 1 {
        debug!("No pre_cleanup needed for {}", vm_dir.display());
        return Ok(Vec::new());
    }
    prune_to(vm_dir, ceiling as usize)
}

/// True when there is at least one slot and every slot carries a success marker.
pub fn all_slots_successful(vm_dir: &Path) -> Result<bool> {
    let slots = list_slots(vm_dir)?;
    let unfinished: Vec<&str> = slots
        .iter()
        .filter(|slot| !slot.status.is_successful())
        .map(|slot| slot.name.as_str())
        .collect();
    if !unfinished.is_empty() {
        warn!("unsuccessful backups in history: {}", unfinished.join(", "));
    }
    Ok(!slots.is_empty() && unfinished.is_empty())
}
