//! In-memory [`Hypervisor`] for tests.
//!
//! Exports write sparse files of a configurable size so size thresholds can
//! be exercised without writing real data.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::Path;

use vm_config::ExportKind;
use vm_core::error::{Result, VmError};

use crate::{
    DiskRecord, ExportOptions, Hypervisor, VbdInfo, VdiInfo, VifRecord, VmRecord, VmRef,
};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    ListVms,
    FindVm,
    VmRecord,
    VdiList,
    ExportMetadata,
    FindSnapshots,
    Snapshot,
    SetParams,
    Export,
    Destroy,
    PoolMaster,
    PoolDump,
}

#[derive(Debug, Clone)]
struct Snapshot {
    kind: ExportKind,
    uuid: String,
    label: String,
    vm: String,
}

#[derive(Debug, Default)]
pub struct MockHypervisor {
    vms: Vec<VmRef>,
    records: HashMap<String, VmRecord>,
    /// Failing operations, optionally limited to one VM name.
    failures: Vec<(MockOp, Option<String>)>,
    export_size: u64,
    master: bool,
    snapshots: RefCell<Vec<Snapshot>>,
    calls: RefCell<Vec<String>>,
    next_id: Cell<u32>,
}

impl MockHypervisor {
    pub fn new() -> Self {
        Self {
            export_size: 1024,
            ..Self::default()
        }
    }

    /// Add a VM with a single `xvda` disk and one interface.
    pub fn with_vm(mut self, name: &str) -> Self {
        let uuid = format!("{}-uuid", name.replace(' ', "-"));
        let record = sample_record(name, &uuid);
        self.records.insert(uuid.clone(), record);
        self.vms.push(VmRef {
            name: name.to_string(),
            uuid,
        });
        self
    }

    /// Add a second VM carrying an existing name.
    pub fn with_duplicate(mut self, name: &str) -> Self {
        let uuid = format!("{}-uuid-{}", name.replace(' ', "-"), self.vms.len());
        self.records.insert(uuid.clone(), sample_record(name, &uuid));
        self.vms.push(VmRef {
            name: name.to_string(),
            uuid,
        });
        self
    }

    /// Replace what [`Hypervisor::vm_record`] reports for a VM added with
    /// [`MockHypervisor::with_vm`]. The record is returned as given, uuid
    /// included; start from [`sample_record`] to change a single field.
    pub fn with_record(mut self, name: &str, record: VmRecord) -> Self {
        if let Some(vm) = self.vms.iter().find(|vm| vm.name == name) {
            self.records.insert(vm.uuid.clone(), record);
        }
        self
    }

    /// Leave a snapshot from an earlier run that must be cleaned up.
    pub fn with_stale_snapshot(self, kind: ExportKind, label: &str, vm: &str) -> Self {
        let uuid = self.next_uuid("stale");
        self.snapshots.borrow_mut().push(Snapshot {
            kind,
            uuid,
            label: label.to_string(),
            vm: vm.to_string(),
        });
        self
    }

    /// Make `op` fail for every VM.
    pub fn failing(mut self, op: MockOp) -> Self {
        self.failures.push((op, None));
        self
    }

    /// Make `op` fail only while working on `vm`.
    pub fn failing_for(mut self, op: MockOp, vm: &str) -> Self {
        self.failures.push((op, Some(vm.to_string())));
        self
    }

    /// Apparent size of every exported file.
    pub fn with_export_size(mut self, bytes: u64) -> Self {
        self.export_size = bytes;
        self
    }

    pub fn as_master(mut self) -> Self {
        self.master = true;
        self
    }

    /// Operations performed so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Labels of snapshots that still exist.
    pub fn snapshot_labels(&self) -> Vec<String> {
        self.snapshots
            .borrow()
            .iter()
            .map(|s| s.label.clone())
            .collect()
    }

    fn next_uuid(&self, prefix: &str) -> String {
        let id = self.next_id.get() + 1;
        self.next_id.set(id);
        format!("{}-{:04}", prefix, id)
    }

    fn record_call(&self, call: String) {
        self.calls.borrow_mut().push(call);
    }

    /// VM name that owns a VM, VDI or snapshot uuid.
    fn owner_of(&self, uuid: &str) -> Option<String> {
        if let Some(vm) = self.vms.iter().find(|vm| vm.uuid == uuid) {
            return Some(vm.name.clone());
        }
        if let Some(snap) = self.snapshots.borrow().iter().find(|s| s.uuid == uuid) {
            return Some(snap.vm.clone());
        }
        self.records.iter().find_map(|(vm_uuid, record)| {
            record
                .disks
                .iter()
                .any(|d| d.vdi.uuid == uuid)
                .then(|| self.vms.iter().find(|vm| &vm.uuid == vm_uuid))
                .flatten()
                .map(|vm| vm.name.clone())
        })
    }

    fn check(&self, op: MockOp, vm: Option<&str>) -> Result<()> {
        let fails = self.failures.iter().any(|(failing, only)| {
            *failing == op
                && match (only, vm) {
                    (None, _) => true,
                    (Some(only), Some(vm)) => only == vm,
                    (Some(_), None) => false,
                }
        });
        if fails {
            return Err(VmError::hypervisor(
                format!("{:?}", op),
                format!("mock failure for {}", vm.unwrap_or("pool")),
            ));
        }
        Ok(())
    }
}

/// The record [`MockHypervisor::with_vm`] gives a VM: one `xvda` disk
/// (`<uuid>-vdi-0`, labelled `<name> 0`) and one interface.
pub fn sample_record(name: &str, uuid: &str) -> VmRecord {
    VmRecord {
        uuid: uuid.to_string(),
        disks: vec![DiskRecord {
            vbd: VbdInfo {
                uuid: format!("{}-vbd-0", uuid),
                device: "xvda".to_string(),
                userdevice: "0".to_string(),
                bootable: "true".to_string(),
                mode: "RW".to_string(),
                vbd_type: "Disk".to_string(),
                unpluggable: "false".to_string(),
                empty: "false".to_string(),
            },
            vdi: VdiInfo {
                uuid: format!("{}-vdi-0", uuid),
                name_label: format!("{} 0", name),
                name_description: "Created by template provisioner".to_string(),
                virtual_size: "10737418240".to_string(),
                vdi_type: "System".to_string(),
                sharable: "false".to_string(),
                read_only: "false".to_string(),
                sr_uuid: "sr-local".to_string(),
            },
        }],
        vifs: vec![VifRecord {
            uuid: format!("{}-vif-0", uuid),
            device: "0".to_string(),
            network_name_label: "Pool-wide network associated with eth0".to_string(),
            mtu: "1500".to_string(),
            mac: "aa:bb:cc:dd:ee:00".to_string(),
            other_config: String::new(),
        }],
    }
}

fn write_sparse(dest: &Path, size: u64) -> Result<()> {
    let file = File::create(dest)
        .map_err(|e| VmError::filesystem(e, dest.display().to_string(), "create"))?;
    file.set_len(size)
        .map_err(|e| VmError::filesystem(e, dest.display().to_string(), "set_len"))?;
    Ok(())
}

impl Hypervisor for MockHypervisor {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn list_vms(&self) -> Result<Vec<String>> {
        self.record_call("list_vms".to_string());
        self.check(MockOp::ListVms, None)?;
        let mut names: Vec<String> = Vec::new();
        for vm in &self.vms {
            if !names.contains(&vm.name) {
                names.push(vm.name.clone());
            }
        }
        Ok(names)
    }

    fn vms_named(&self, name: &str) -> Result<Vec<VmRef>> {
        self.record_call(format!("vms_named {}", name));
        self.check(MockOp::FindVm, Some(name))?;
        Ok(self.vms.iter().filter(|vm| vm.name == name).cloned().collect())
    }

    fn vm_record(&self, vm: &VmRef) -> Result<VmRecord> {
        self.record_call(format!("vm_record {}", vm.name));
        self.check(MockOp::VmRecord, Some(vm.name.as_str()))?;
        self.records
            .get(&vm.uuid)
            .cloned()
            .ok_or_else(|| VmError::hypervisor("vbd-list", format!("unknown vm {}", vm.uuid)))
    }

    fn vdi_info(&self, vdi_uuid: &str) -> Result<VdiInfo> {
        let owner = self.owner_of(vdi_uuid);
        self.record_call(format!(
            "vdi_info {}",
            owner.as_deref().unwrap_or(vdi_uuid)
        ));
        self.check(MockOp::VdiList, owner.as_deref())?;
        self.records
            .values()
            .flat_map(|record| record.disks.iter())
            .find(|disk| disk.vdi.uuid == vdi_uuid)
            .map(|disk| disk.vdi.clone())
            .ok_or_else(|| VmError::hypervisor("vdi-list", format!("no record for vdi {}", vdi_uuid)))
    }

    fn export_vm_metadata(&self, vm_uuid: &str, dest: &Path) -> Result<()> {
        let owner = self.owner_of(vm_uuid);
        self.record_call(format!(
            "export_vm_metadata {}",
            owner.as_deref().unwrap_or(vm_uuid)
        ));
        self.check(MockOp::ExportMetadata, owner.as_deref())?;

        let body = format!("<value><struct><member><name>uuid</name><value>{}</value></member></struct></value>\n", vm_uuid);
        let file = File::create(dest)
            .map_err(|e| VmError::filesystem(e, dest.display().to_string(), "create"))?;
        let mut builder = tar::Builder::new(file);
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "ova.xml", body.as_bytes())?;
        builder.finish()?;
        Ok(())
    }

    fn find_snapshots(&self, kind: ExportKind, name_label: &str) -> Result<Vec<String>> {
        self.record_call(format!("find_snapshots {} {}", kind.as_str(), name_label));
        self.check(MockOp::FindSnapshots, None)?;
        Ok(self
            .snapshots
            .borrow()
            .iter()
            .filter(|s| s.kind == kind && s.label == name_label)
            .map(|s| s.uuid.clone())
            .collect())
    }

    fn snapshot(&self, kind: ExportKind, source_uuid: &str, name_label: &str) -> Result<String> {
        let owner = self.owner_of(source_uuid).unwrap_or_default();
        self.record_call(format!("snapshot {} {}", kind.as_str(), owner));
        self.check(MockOp::Snapshot, Some(owner.as_str()))?;

        let uuid = self.next_uuid("snap");
        let label = match kind {
            ExportKind::VmExport => name_label.to_string(),
            // VDI snapshots inherit the disk label until renamed.
            ExportKind::VdiExport => String::new(),
        };
        self.snapshots.borrow_mut().push(Snapshot {
            kind,
            uuid: uuid.clone(),
            label,
            vm: owner,
        });
        Ok(uuid)
    }

    fn set_params(&self, kind: ExportKind, uuid: &str, params: &[(&str, &str)]) -> Result<()> {
        let owner = self.owner_of(uuid);
        self.record_call(format!("set_params {} {}", kind.as_str(), uuid));
        self.check(MockOp::SetParams, owner.as_deref())?;

        let mut snapshots = self.snapshots.borrow_mut();
        let snap = snapshots
            .iter_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| VmError::hypervisor("param-set", format!("unknown uuid {}", uuid)))?;
        if let Some((_, label)) = params.iter().find(|(k, _)| *k == "name-label") {
            snap.label = label.to_string();
        }
        Ok(())
    }

    fn export_snapshot(
        &self,
        kind: ExportKind,
        uuid: &str,
        dest: &Path,
        _options: &ExportOptions,
    ) -> Result<()> {
        let owner = self.owner_of(uuid);
        self.record_call(format!(
            "export {} {}",
            kind.as_str(),
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        self.check(MockOp::Export, owner.as_deref())?;
        write_sparse(dest, self.export_size)
    }

    fn destroy_snapshot(&self, kind: ExportKind, uuid: &str) -> Result<()> {
        let owner = self.owner_of(uuid);
        self.record_call(format!("destroy {} {}", kind.as_str(), uuid));
        self.check(MockOp::Destroy, owner.as_deref())?;
        self.snapshots.borrow_mut().retain(|s| s.uuid != uuid);
        Ok(())
    }

    fn is_pool_master(&self) -> Result<bool> {
        self.check(MockOp::PoolMaster, None)?;
        Ok(self.master)
    }

    fn dump_pool_database(&self, dest: &Path) -> Result<()> {
        self.record_call("dump_pool_database".to_string());
        self.check(MockOp::PoolDump, None)?;
        fs::write(dest, b"pool database\n")
            .map_err(|e| VmError::filesystem(e, dest.display().to_string(), "write"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_find_vm_duplicate_and_missing() {
        let mock = MockHypervisor::new().with_vm("web").with_duplicate("web");
        assert!(mock.find_vm("web").is_err());
        let err = mock.find_vm("db").unwrap_err();
        assert!(err.to_string().contains("no machines found with the name db"));
        assert_eq!(mock.list_vms().unwrap(), vec!["web"]);
    }

    #[test]
    fn test_pool_wide_failures() {
        let mock = MockHypervisor::new()
            .with_vm("web")
            .failing(MockOp::ListVms)
            .failing(MockOp::PoolMaster);
        assert!(mock.list_vms().is_err());
        assert!(mock.is_pool_master().is_err());
        assert!(mock.find_vm("web").is_ok());
    }

    #[test]
    fn test_find_vm_failure_for_one_name() {
        let mock = MockHypervisor::new()
            .with_vm("web")
            .with_vm("db")
            .failing_for(MockOp::FindVm, "db");
        assert!(mock.find_vm("web").is_ok());
        let err = mock.find_vm("db").unwrap_err();
        assert!(matches!(err, VmError::Hypervisor { ref operation, .. } if operation == "FindVm"));
    }

    #[test]
    fn test_vdi_info_follows_records() {
        let mut record = sample_record("web", "web-uuid");
        record.disks[0].vdi.uuid = "disk-a".to_string();
        let mock = MockHypervisor::new().with_vm("web").with_record("web", record);

        assert_eq!(mock.vdi_info("disk-a").unwrap().name_label, "web 0");
        assert!(mock.vdi_info("web-uuid-vdi-0").is_err());
        assert_eq!(mock.calls(), vec!["vdi_info web", "vdi_info web-uuid-vdi-0"]);
    }

    #[test]
    fn test_snapshot_lifecycle() {
        let mock = MockHypervisor::new().with_vm("web");
        let vm = mock.find_vm("web").unwrap();
        let snap = mock
            .snapshot(ExportKind::VmExport, &vm.uuid, "RESTORE_web")
            .unwrap();
        assert_eq!(
            mock.find_snapshots(ExportKind::VmExport, "RESTORE_web")
                .unwrap(),
            vec![snap.clone()]
        );
        mock.destroy_snapshot(ExportKind::VmExport, &snap).unwrap();
        assert!(mock.snapshot_labels().is_empty());
    }

    #[test]
    fn test_failure_limited_to_one_vm() {
        let mock = MockHypervisor::new()
            .with_vm("web")
            .with_vm("db")
            .failing_for(MockOp::Snapshot, "db");
        let web = mock.find_vm("web").unwrap();
        let db = mock.find_vm("db").unwrap();
        assert!(mock.snapshot(ExportKind::VmExport, &web.uuid, "RESTORE_web").is_ok());
        assert!(mock.snapshot(ExportKind::VmExport, &db.uuid, "RESTORE_db").is_err());
    }

    #[test]
    fn test_export_writes_sparse_file() {
        let dir = TempDir::new().unwrap();
        let mock = MockHypervisor::new().with_vm("web").with_export_size(4096);
        let vm = mock.find_vm("web").unwrap();
        let snap = mock.snapshot(ExportKind::VmExport, &vm.uuid, "RESTORE_web").unwrap();
        let dest = dir.path().join("web.xva");
        mock.export_snapshot(ExportKind::VmExport, &snap, &dest, &ExportOptions::default())
            .unwrap();
        assert_eq!(fs::metadata(&dest).unwrap().len(), 4096);
    }
}
