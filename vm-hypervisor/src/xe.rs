//! [`Hypervisor`] backed by the `xe` command line tool.

// Standard library
use std::path::Path;

// External crates
use tracing::{debug, info};
use vm_core::command_stream::{run_command, CommandOutput};
use vm_core::error::{Result, VmError};

// Internal imports
use crate::xe_output::{field, parse_minimal, parse_records};
use crate::{
    DiskRecord, ExportOptions, Hypervisor, VbdInfo, VdiInfo, VifRecord, VmRecord, VmRef,
};
use vm_config::ExportKind;

/// Per-call timeout for `xe` invocations.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Where and as whom `xe` connects.
///
/// With no `server`, `xe` talks to the local toolstack and no credentials
/// are passed on the command line.
#[derive(Debug, Clone)]
pub struct XeConnection {
    pub server: Option<String>,
    pub username: String,
    pub password: String,
}

pub struct XeHypervisor {
    binary: String,
    connection: XeConnection,
    timeout_secs: u64,
}

impl XeHypervisor {
    pub fn new(connection: XeConnection, timeout_secs: u64) -> Self {
        Self {
            binary: "xe".to_string(),
            connection,
            timeout_secs,
        }
    }

    /// Use a different `xe` executable, e.g. an absolute path.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn connection_args(&self) -> Vec<String> {
        match &self.connection.server {
            Some(server) => vec![
                "-s".to_string(),
                server.clone(),
                "-u".to_string(),
                self.connection.username.clone(),
                "-pw".to_string(),
                self.connection.password.clone(),
            ],
            None => Vec::new(),
        }
    }

    fn run(&self, operation: &str, args: &[String]) -> Result<CommandOutput> {
        let mut full_args = self.connection_args();
        full_args.push(operation.to_string());
        full_args.extend(args.iter().cloned());
        run_command(&self.binary, &full_args, Some(self.timeout_secs))
    }

    /// Run an operation and return its stdout, failing on a non-zero status.
    fn run_checked(&self, operation: &str, args: &[String]) -> Result<String> {
        let output = self.run(operation, args)?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim().to_string()
            } else {
                output.stderr.trim().to_string()
            };
            return Err(VmError::hypervisor(
                operation,
                format!("exit status {:?}: {}", output.code, detail),
            ));
        }
        Ok(output.stdout)
    }
}

fn arg(key: &str, value: impl AsRef<str>) -> String {
    format!("{}={}", key, value.as_ref())
}

impl Hypervisor for XeHypervisor {
    fn name(&self) -> &'static str {
        "xe"
    }

    fn list_vms(&self) -> Result<Vec<String>> {
        let stdout = self.run_checked(
            "vm-list",
            &[
                arg("is-control-domain", "false"),
                arg("is-a-snapshot", "false"),
                arg("params", "name-label"),
            ],
        )?;
        // Record output, since --minimal joins names with commas.
        Ok(parse_records(&stdout)
            .iter()
            .map(|record| field(record, "name-label").to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }

    fn vms_named(&self, name: &str) -> Result<Vec<VmRef>> {
        let stdout = self.run_checked(
            "vm-list",
            &[
                arg("name-label", name),
                arg("is-a-snapshot", "false"),
                arg("params", "uuid"),
                "--minimal".to_string(),
            ],
        )?;
        Ok(parse_minimal(&stdout)
            .into_iter()
            .map(|uuid| VmRef {
                name: name.to_string(),
                uuid,
            })
            .collect())
    }

    fn vm_record(&self, vm: &VmRef) -> Result<VmRecord> {
        let mut record = VmRecord {
            uuid: vm.uuid.clone(),
            ..VmRecord::default()
        };

        let vbd_output = self.run_checked(
            "vbd-list",
            &[arg("vm-uuid", &vm.uuid), arg("params", "all")],
        )?;
        for vbd in parse_records(&vbd_output) {
            if !field(&vbd, "type").eq_ignore_ascii_case("disk") {
                continue;
            }
            debug!("vbd: {}", field(&vbd, "uuid"));
            let vdi = self.vdi_info(field(&vbd, "vdi-uuid"))?;
            record.disks.push(DiskRecord {
                vbd: VbdInfo {
                    uuid: field(&vbd, "uuid").to_string(),
                    device: field(&vbd, "device").to_string(),
                    userdevice: field(&vbd, "userdevice").to_string(),
                    bootable: field(&vbd, "bootable").to_string(),
                    mode: field(&vbd, "mode").to_string(),
                    vbd_type: field(&vbd, "type").to_string(),
                    unpluggable: field(&vbd, "unpluggable").to_string(),
                    empty: field(&vbd, "empty").to_string(),
                },
                vdi,
            });
        }

        let vif_output = self.run_checked(
            "vif-list",
            &[arg("vm-uuid", &vm.uuid), arg("params", "all")],
        )?;
        for vif in parse_records(&vif_output) {
            record.vifs.push(VifRecord {
                uuid: field(&vif, "uuid").to_string(),
                device: field(&vif, "device").to_string(),
                network_name_label: field(&vif, "network-name-label").to_string(),
                mtu: field(&vif, "MTU").to_string(),
                mac: field(&vif, "MAC").to_string(),
                other_config: field(&vif, "other-config").to_string(),
            });
        }

        Ok(record)
    }

    fn vdi_info(&self, vdi_uuid: &str) -> Result<VdiInfo> {
        let stdout = self.run_checked(
            "vdi-list",
            &[format!("uuid={}", vdi_uuid), "params=all".to_string()],
        )?;
        let record = parse_records(&stdout).into_iter().next().ok_or_else(|| {
            VmError::hypervisor("vdi-list", format!("no record for vdi {}", vdi_uuid))
        })?;
        Ok(VdiInfo {
            uuid: field(&record, "uuid").to_string(),
            name_label: field(&record, "name-label").to_string(),
            name_description: field(&record, "name-description").to_string(),
            virtual_size: field(&record, "virtual-size").to_string(),
            vdi_type: field(&record, "type").to_string(),
            sharable: field(&record, "sharable").to_string(),
            read_only: field(&record, "read-only").to_string(),
            sr_uuid: field(&record, "sr-uuid").to_string(),
        })
    }

    fn export_vm_metadata(&self, vm_uuid: &str, dest: &Path) -> Result<()> {
        self.run_checked(
            "vm-export",
            &[
                arg("metadata", "true"),
                arg("uuid", vm_uuid),
                arg("filename", dest.to_string_lossy()),
            ],
        )?;
        Ok(())
    }

    fn find_snapshots(&self, kind: ExportKind, name_label: &str) -> Result<Vec<String>> {
        let operation = match kind {
            ExportKind::VmExport => "vm-list",
            ExportKind::VdiExport => "vdi-list",
        };
        let stdout = self.run_checked(
            operation,
            &[
                arg("name-label", name_label),
                arg("params", "uuid"),
                "--minimal".to_string(),
            ],
        )?;
        Ok(parse_minimal(&stdout))
    }

    fn snapshot(&self, kind: ExportKind, source_uuid: &str, name_label: &str) -> Result<String> {
        let (operation, args) = match kind {
            ExportKind::VmExport => (
                "vm-snapshot",
                vec![arg("vm", source_uuid), arg("new-name-label", name_label)],
            ),
            ExportKind::VdiExport => ("vdi-snapshot", vec![arg("uuid", source_uuid)]),
        };
        let stdout = self.run_checked(operation, &args)?;
        let uuid = stdout.trim().to_string();
        if uuid.is_empty() {
            return Err(VmError::hypervisor(operation, "no snapshot uuid returned"));
        }
        info!("snap-uuid: {}", uuid);
        Ok(uuid)
    }

    fn set_params(&self, kind: ExportKind, uuid: &str, params: &[(&str, &str)]) -> Result<()> {
        let operation = match kind {
            ExportKind::VmExport => "template-param-set",
            ExportKind::VdiExport => "vdi-param-set",
        };
        let mut args = vec![arg("uuid", uuid)];
        args.extend(params.iter().map(|(k, v)| arg(k, v)));
        self.run_checked(operation, &args)?;
        Ok(())
    }

    fn export_snapshot(
        &self,
        kind: ExportKind,
        uuid: &str,
        dest: &Path,
        options: &ExportOptions,
    ) -> Result<()> {
        let filename = arg("filename", dest.to_string_lossy());
        match kind {
            ExportKind::VmExport => {
                let mut args = vec![arg("uuid", uuid), filename];
                if options.compress {
                    args.push(arg("compress", "true"));
                }
                self.run_checked("vm-export", &args)?;
            }
            ExportKind::VdiExport => {
                self.run_checked(
                    "vdi-export",
                    &[
                        arg("format", options.vdi_format.as_str()),
                        arg("uuid", uuid),
                        filename,
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn destroy_snapshot(&self, kind: ExportKind, uuid: &str) -> Result<()> {
        match kind {
            ExportKind::VmExport => {
                self.run_checked("vm-uninstall", &[arg("uuid", uuid), arg("force", "true")])?
            }
            ExportKind::VdiExport => self.run_checked("vdi-destroy", &[arg("uuid", uuid)])?,
        };
        Ok(())
    }

    fn is_pool_master(&self) -> Result<bool> {
        let master = self.run_checked("pool-list", &[arg("params", "master"), "--minimal".into()])?;
        let host = self.run_checked(
            "host-list",
            &[arg("name-label", vm_core::hostname()), "--minimal".into()],
        )?;
        let master = master.trim();
        Ok(!master.is_empty() && master == host.trim())
    }

    fn dump_pool_database(&self, dest: &Path) -> Result<()> {
        self.run_checked("pool-dump-database", &[arg("file-name", dest.to_string_lossy())])?;
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    /// Install a fake `xe` that records its arguments and prints canned output.
    fn fake_xe(dir: &TempDir, script_body: &str) -> String {
        let path = dir.path().join("xe");
        let script = format!(
            "#!/bin/sh\nprintf '%s\\n' \"$*\" >> \"{}\"\n{}\n",
            dir.path().join("calls.log").display(),
            script_body
        );
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn calls(dir: &TempDir) -> String {
        fs::read_to_string(dir.path().join("calls.log")).unwrap_or_default()
    }

    fn local() -> XeConnection {
        XeConnection {
            server: None,
            username: "root".to_string(),
            password: "secret".to_string(),
        }
    }

    #[test]
    fn test_list_vms_parses_records() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(
            &dir,
            "printf 'name-label ( RW)    : PRD-web\\n\\nname-label ( RW)    : PRD-db\\n'",
        ));

        assert_eq!(xe.list_vms().unwrap(), vec!["PRD-web", "PRD-db"]);
        let log = calls(&dir);
        assert!(log.contains("vm-list is-control-domain=false is-a-snapshot=false params=name-label"));
        assert!(!log.contains("--minimal"));
    }

    #[test]
    fn test_list_vms_keeps_commas_in_names() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(
            &dir,
            "printf 'name-label ( RW)    : web, primary\\n\\nname-label ( RW)    : db\\n'",
        ));

        assert_eq!(xe.list_vms().unwrap(), vec!["web, primary", "db"]);
    }

    #[test]
    fn test_vdi_info_unknown_uuid_is_error() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(&dir, "exit 0"));

        let err = xe.vdi_info("gone").unwrap_err();
        assert!(matches!(err, VmError::Hypervisor { ref operation, .. } if operation == "vdi-list"));
        assert!(calls(&dir).contains("vdi-list uuid=gone params=all"));
    }

    #[test]
    fn test_remote_connection_passes_credentials() {
        let dir = TempDir::new().unwrap();
        let connection = XeConnection {
            server: Some("pool1".to_string()),
            ..local()
        };
        let xe = XeHypervisor::new(connection, 10).with_binary(fake_xe(&dir, "echo"));

        xe.list_vms().unwrap();
        assert!(calls(&dir).starts_with("-s pool1 -u root -pw secret vm-list"));
    }

    #[test]
    fn test_nonzero_exit_is_hypervisor_error() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10)
            .with_binary(fake_xe(&dir, "echo 'The uuid you supplied was invalid.' >&2; exit 1"));

        let err = xe.destroy_snapshot(ExportKind::VdiExport, "bad").unwrap_err();
        assert!(matches!(err, VmError::Hypervisor { ref operation, .. } if operation == "vdi-destroy"));
        assert!(err.to_string().contains("uuid you supplied was invalid"));
    }

    #[test]
    fn test_empty_snapshot_uuid_is_error() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(&dir, "echo ''"));

        assert!(xe
            .snapshot(ExportKind::VmExport, "vm-uuid", "RESTORE_PRD-web")
            .is_err());
    }

    #[test]
    fn test_vm_export_with_compression() {
        let dir = TempDir::new().unwrap();
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(&dir, "true"));
        let options = ExportOptions {
            compress: true,
            ..ExportOptions::default()
        };

        xe.export_snapshot(
            ExportKind::VmExport,
            "snap-1",
            Path::new("/backups/PRD-web.xva.gz"),
            &options,
        )
        .unwrap();
        assert!(calls(&dir)
            .contains("vm-export uuid=snap-1 filename=/backups/PRD-web.xva.gz compress=true"));
    }

    #[test]
    fn test_vm_record_keeps_only_disks() {
        let dir = TempDir::new().unwrap();
        let body = r#"case "$1" in
  vbd-list) printf 'uuid ( RO): vbd-1\nvdi-uuid ( RO): vdi-1\ndevice ( RO): xvda\ntype ( RW): Disk\n\nuuid ( RO): vbd-2\nvdi-uuid ( RO): <not in database>\ndevice ( RO): xvdd\ntype ( RW): CD\n' ;;
  vdi-list) printf 'uuid ( RO): vdi-1\nname-label ( RW): PRD-web root\nsr-uuid ( RO): sr-9\n' ;;
  vif-list) printf 'uuid ( RO): vif-1\ndevice ( RO): 0\nMAC ( RO): aa:bb\nnetwork-name-label ( RO): Pool-wide network\n' ;;
esac"#;
        let xe = XeHypervisor::new(local(), 10).with_binary(fake_xe(&dir, body));
        let vm = VmRef {
            name: "PRD-web".to_string(),
            uuid: "vm-1".to_string(),
        };

        let record = xe.vm_record(&vm).unwrap();
        assert_eq!(record.disks.len(), 1);
        let xvda = record.xvda().unwrap();
        assert_eq!(xvda.vdi.name_label, "PRD-web root");
        assert_eq!(xvda.vdi.sr_uuid, "sr-9");
        assert_eq!(record.vifs[0].mac, "aa:bb");
        assert_eq!(record.vifs[0].network_name_label, "Pool-wide network");
    }
}
