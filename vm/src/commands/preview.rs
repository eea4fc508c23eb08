//! `--preview`: show what a run would back up, then stop.

use anyhow::{Context, Result};
use serde::Serialize;
use vm_config::{vms_not_in_backup, BackupConfig, BackupTarget, Resolution};
use vm_core::{vm_println, vm_success, vm_warning};
use vm_hypervisor::Hypervisor;
use vm_messages::{msg, MESSAGES};

use crate::cli::Args;

/// Everything a preview reports.
#[derive(Debug, Serialize)]
pub struct Plan<'a> {
    pub config: &'a BackupConfig,
    pub targets: &'a [BackupTarget],
    pub warnings: &'a [String],
    pub not_in_backup: Vec<String>,
    /// Target names carried by more than one VM on the pool.
    pub duplicates: Vec<String>,
}

impl Plan<'_> {
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty() || !self.duplicates.is_empty()
    }
}

pub fn build_plan<'a>(
    config: &'a BackupConfig,
    resolution: &'a Resolution,
    inventory: &[String],
    hypervisor: &dyn Hypervisor,
) -> Result<Plan<'a>> {
    let mut duplicates = Vec::new();
    for target in &resolution.targets {
        let vms = hypervisor
            .vms_named(&target.vm_name)
            .with_context(|| format!("failed to look up {}", target.vm_name))?;
        if vms.len() > 1 {
            duplicates.push(target.vm_name.clone());
        }
    }

    Ok(Plan {
        config,
        targets: &resolution.targets,
        warnings: &resolution.warnings,
        not_in_backup: vms_not_in_backup(&resolution.targets, inventory),
        duplicates,
    })
}

pub fn show_plan(
    args: &Args,
    config: &BackupConfig,
    resolution: &Resolution,
    inventory: &[String],
    hypervisor: &dyn Hypervisor,
) -> Result<()> {
    let plan = build_plan(config, resolution, inventory, hypervisor)?;

    if args.json {
        let json = serde_json::to_string_pretty(&plan).context("failed to serialize plan")?;
        vm_println!("{}", json);
        return Ok(());
    }

    vm_println!(
        "{}",
        msg!(
            MESSAGES.preview_header,
            count = plan.targets.len(),
            max_backups = config.max_backups
        )
    );
    for target in plan.targets {
        vm_println!(
            "{}",
            msg!(
                MESSAGES.preview_target_line,
                kind = format!("{:<10}", target.export_kind),
                vm = &target.vm_name,
                max_backups = target.max_backups
            )
        );
    }
    if !plan.not_in_backup.is_empty() {
        vm_println!(
            "{}",
            msg!(
                MESSAGES.preview_not_in_backup,
                vms = plan.not_in_backup.join(", ")
            )
        );
    }
    vm_println!();

    for vm in &plan.duplicates {
        vm_warning!("{}", msg!(MESSAGES.preview_duplicate_name, vm = vm));
    }
    if plan.has_warnings() {
        vm_warning!("{}", MESSAGES.preview_success_with_warnings);
    } else {
        vm_success!("{}", MESSAGES.preview_success);
    }
    Ok(())
}
