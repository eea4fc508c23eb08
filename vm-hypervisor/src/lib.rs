//! Hypervisor control abstraction.
//!
//! The backup workflow only needs a narrow set of pool operations:
//! enumerate VMs, inspect a VM's disks and interfaces, take and destroy
//! snapshots, export them, and dump the pool database. [`Hypervisor`]
//! captures that contract; [`xe::XeHypervisor`] implements it with the
//! `xe` command line tool.

// Standard library
use std::path::Path;

// External crates
use vm_core::error::{Result, VmError};

// Internal imports
use vm_config::{ExportKind, VdiExportFormat};

pub mod xe;
pub mod xe_output;

// When the `test-helpers` feature is enabled, include the mock hypervisor.
#[cfg(feature = "test-helpers")]
pub mod mock;

pub use xe::{XeConnection, XeHypervisor, DEFAULT_TIMEOUT_SECS};

/// A VM on the pool, identified by name and uuid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub name: String,
    pub uuid: String,
}

/// Attributes of a virtual block device that are kept with each backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VbdInfo {
    pub uuid: String,
    /// Guest device name such as `xvda`; may be empty for VMs that have
    /// not been started in a long time.
    pub device: String,
    pub userdevice: String,
    pub bootable: String,
    pub mode: String,
    pub vbd_type: String,
    pub unpluggable: String,
    pub empty: String,
}

/// Attributes of a virtual disk image that are kept with each backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VdiInfo {
    pub uuid: String,
    pub name_label: String,
    pub name_description: String,
    pub virtual_size: String,
    pub vdi_type: String,
    pub sharable: String,
    pub read_only: String,
    pub sr_uuid: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskRecord {
    pub vbd: VbdInfo,
    pub vdi: VdiInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VifRecord {
    pub uuid: String,
    pub device: String,
    pub network_name_label: String,
    pub mtu: String,
    pub mac: String,
    pub other_config: String,
}

/// Disk and network layout of a VM; only disk-type VBDs are listed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VmRecord {
    pub uuid: String,
    pub disks: Vec<DiskRecord>,
    pub vifs: Vec<VifRecord>,
}

impl VmRecord {
    /// The disk attached as `xvda`, the one a VDI export copies.
    pub fn xvda(&self) -> Option<&DiskRecord> {
        self.disks.iter().find(|d| d.vbd.device == "xvda")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportOptions {
    /// Ask the hypervisor to gzip a VM export.
    pub compress: bool,
    /// Image format for a VDI export.
    pub vdi_format: VdiExportFormat,
}

/// The core trait for hypervisor backends.
///
/// Every method blocks until the pool answers. A hard failure (non-zero
/// status, missing identifier) is returned as an error; callers decide
/// whether it is fatal for the VM being backed up.
pub trait Hypervisor {
    /// Get the name of the backend (e.g., "xe").
    fn name(&self) -> &'static str;

    /// Names of all VMs that are neither the control domain nor snapshots.
    fn list_vms(&self) -> Result<Vec<String>>;

    /// Every non-snapshot VM carrying `name`.
    fn vms_named(&self, name: &str) -> Result<Vec<VmRef>>;

    /// The single VM carrying `name`; zero or several matches are errors.
    fn find_vm(&self, name: &str) -> Result<VmRef> {
        let mut vms = self.vms_named(name)?;
        match vms.len() {
            0 => Err(VmError::hypervisor(
                "vm-list",
                format!("no machines found with the name {}", name),
            )),
            1 => Ok(vms.remove(0)),
            n => Err(VmError::hypervisor(
                "vm-list",
                format!("{} vms share the name {}", n, name),
            )),
        }
    }

    /// Disks and interfaces of a VM.
    fn vm_record(&self, vm: &VmRef) -> Result<VmRecord>;

    /// Look up a single disk; an unknown uuid is an error.
    fn vdi_info(&self, vdi_uuid: &str) -> Result<VdiInfo>;

    /// Write a metadata-only export archive of the VM to `dest`.
    fn export_vm_metadata(&self, vm_uuid: &str, dest: &Path) -> Result<()>;

    /// Uuids of existing snapshots carrying `name_label`.
    fn find_snapshots(&self, kind: ExportKind, name_label: &str) -> Result<Vec<String>>;

    /// Snapshot a VM (`VmExport`) or a disk (`VdiExport`) and return the new uuid.
    ///
    /// VDI snapshots are named afterwards with [`Hypervisor::set_params`].
    fn snapshot(&self, kind: ExportKind, source_uuid: &str, name_label: &str) -> Result<String>;

    /// Set parameters on a snapshot.
    fn set_params(&self, kind: ExportKind, uuid: &str, params: &[(&str, &str)]) -> Result<()>;

    /// Stream a snapshot to `dest`.
    fn export_snapshot(
        &self,
        kind: ExportKind,
        uuid: &str,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()>;

    /// Remove a snapshot and its storage.
    fn destroy_snapshot(&self, kind: ExportKind, uuid: &str) -> Result<()>;

    /// Whether this host is the pool master.
    fn is_pool_master(&self) -> Result<bool>;

    /// Dump the pool database to `dest`.
    fn dump_pool_database(&self, dest: &Path) -> Result<()>;
}
