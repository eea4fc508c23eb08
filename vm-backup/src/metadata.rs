//! VM description files kept next to each export so a VM can be rebuilt
//! by hand: the full metadata XML plus one `key=value` file per disk and
//! per network interface.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use vm_core::error::{Result, VmError};
use vm_hypervisor::{DiskRecord, Hypervisor, VifRecord, VmRecord};

pub const METADATA_XML: &str = "vm-metadata.xml";
const METADATA_ARCHIVE: &str = "vm-metadata.tar";
const ARCHIVE_MEMBER: &str = "ova.xml";

/// Problems that do not stop the backup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MetadataReport {
    pub warnings: Vec<String>,
}

/// Write every metadata file into `slot`.
///
/// Failures of the metadata export are collected as warnings. Errors
/// writing the per-disk and per-interface files are returned.
pub fn write_vm_metadata(
    hypervisor: &dyn Hypervisor,
    record: &VmRecord,
    slot: &Path,
) -> Result<MetadataReport> {
    let mut report = MetadataReport::default();

    info!("Exporting VM metadata XML info");
    if let Err(e) = export_metadata_xml(hypervisor, &record.uuid, slot) {
        report.warnings.push(format!("vm-export metadata: {}", e));
    }

    info!("Writing disk info");
    let mut unnamed = 0;
    for disk in &record.disks {
        let device = if disk.vbd.device.is_empty() {
            report
                .warnings
                .push(format!("empty vbd device on vbd: {}", disk.vbd.uuid));
            unnamed += 1;
            unnamed.to_string()
        } else {
            disk.vbd.device.clone()
        };
        write_disk(disk, &slot.join(format!("DISK-{}", device)))?;
    }

    info!("Writing VIF info");
    if !record.vifs.is_empty() {
        let vif_dir = slot.join("VIFs");
        create_dir(&vif_dir)?;
        for vif in &record.vifs {
            write_vif(vif, &vif_dir)?;
        }
    }

    Ok(report)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|source| VmError::DirectoryCreate {
        path: path.to_path_buf(),
        source,
    })
}

fn write_cfg(path: &Path, entries: &[(&str, &String)]) -> Result<()> {
    let body: String = entries
        .iter()
        .map(|(key, value)| format!("{}={}\n", key, value))
        .collect();
    fs::write(path, body).map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "write"))
}

fn write_disk(disk: &DiskRecord, dir: &Path) -> Result<()> {
    debug!("disk: {} - begin", disk.vdi.name_label);
    create_dir(dir)?;

    let vbd = &disk.vbd;
    write_cfg(
        &dir.join("vbd.cfg"),
        &[
            ("userdevice", &vbd.userdevice),
            ("bootable", &vbd.bootable),
            ("mode", &vbd.mode),
            ("type", &vbd.vbd_type),
            ("unpluggable", &vbd.unpluggable),
            ("empty", &vbd.empty),
            ("orig_uuid", &vbd.uuid),
        ],
    )?;

    let vdi = &disk.vdi;
    write_cfg(
        &dir.join("vdi.cfg"),
        &[
            ("name_label", &vdi.name_label),
            ("name_description", &vdi.name_description),
            ("virtual_size", &vdi.virtual_size),
            ("type", &vdi.vdi_type),
            ("sharable", &vdi.sharable),
            ("read_only", &vdi.read_only),
            ("orig_uuid", &vdi.uuid),
            ("orig_sr_uuid", &vdi.sr_uuid),
        ],
    )
}

fn write_vif(vif: &VifRecord, dir: &Path) -> Result<()> {
    write_cfg(
        &dir.join(format!("vif-{}.cfg", vif.device)),
        &[
            ("device", &vif.device),
            ("network_name_label", &vif.network_name_label),
            ("MTU", &vif.mtu),
            ("MAC", &vif.mac),
            ("other_config", &vif.other_config),
            ("orig_uuid", &vif.uuid),
        ],
    )
}

/// Export metadata to a scratch archive in `slot` and keep only its `ova.xml`.
fn export_metadata_xml(hypervisor: &dyn Hypervisor, vm_uuid: &str, slot: &Path) -> Result<()> {
    let archive_path = slot.join(METADATA_ARCHIVE);
    hypervisor.export_vm_metadata(vm_uuid, &archive_path)?;

    let extracted = extract_member(&archive_path, ARCHIVE_MEMBER, &slot.join(METADATA_XML));
    if let Err(e) = fs::remove_file(&archive_path) {
        warn!("metadata archive {} not removed: {}", archive_path.display(), e);
    }
    extracted
}

fn extract_member(archive_path: &Path, member: &str, dest: &Path) -> Result<()> {
    let file = fs::File::open(archive_path)
        .map_err(|e| VmError::filesystem(e, archive_path.to_string_lossy(), "open"))?;
    let mut archive = tar::Archive::new(file);

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.file_name() == Some(OsStr::new(member)) {
            let mut out = fs::File::create(dest)
                .map_err(|e| VmError::filesystem(e, dest.to_string_lossy(), "create"))?;
            io::copy(&mut entry, &mut out)?;
            return Ok(());
        }
    }

    Err(VmError::Internal(format!(
        "{} not found in {}",
        member,
        archive_path.display()
    )))
}
