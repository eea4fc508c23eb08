//! The backup run itself, plus the operator-facing summary.

use anyhow::{Context, Result};
use vm_backup::{run_backup, BackupOptions, Outcome, RunOptions, RunReport, SystemClock};
use vm_config::{BackupConfig, Resolution};
use vm_core::{vm_error, vm_println, vm_success, vm_warning, DiskSpace};
use vm_hypervisor::Hypervisor;
use vm_messages::{msg, MESSAGES};

use crate::cli::Args;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn print_space(label: &str, space: &Option<DiskSpace>) {
    if let Some(space) = space {
        vm_println!(
            "{}",
            msg!(
                MESSAGES.run_space,
                label = label,
                mount = space.mount_point.display(),
                available = format!("{:.1}", space.available_bytes as f64 / GIB),
                total = format!("{:.1}", space.total_bytes as f64 / GIB),
                used = format!("{:.0}", space.used_percent())
            )
        );
    }
}

fn print_report(report: &RunReport) {
    print_space("Space before backups:", &report.space_before);
    for target in &report.targets {
        vm_println!(
            "{}",
            msg!(
                MESSAGES.run_target_line,
                status = format!("{:<7}", target.outcome),
                kind = format!("{:<10}", target.kind),
                vm = &target.vm,
                detail = target.detail()
            )
        );
    }
    print_space("Space after backups:", &report.space_after);

    let summary = report.summary.to_string();
    match report.status {
        Outcome::Success => vm_success!("{}", msg!(MESSAGES.run_summary_success, summary = summary)),
        Outcome::Warning => vm_warning!("{}", msg!(MESSAGES.run_summary_warning, summary = summary)),
        Outcome::Error => vm_error!("{}", msg!(MESSAGES.run_summary_error, summary = summary)),
    }
}

/// Back up every resolved target. Exit code 1 when any target failed.
pub fn run(
    args: &Args,
    config: &BackupConfig,
    resolution: &Resolution,
    hypervisor: &dyn Hypervisor,
) -> Result<i32> {
    let options = RunOptions {
        backup: BackupOptions {
            compress: args.compress,
            pre_clean: args.pre_clean,
            vdi_export_format: config.vdi_export_format,
        },
        server_name: vm_core::short_hostname(),
    };

    let report = run_backup(config, &resolution.targets, &options, hypervisor, &SystemClock)
        .with_context(|| {
            msg!(
                MESSAGES.error_backup_dir_unwritable,
                path = config.backup_dir.display()
            )
        })
        .context(MESSAGES.common_fatal)?;

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        vm_println!("{}", json);
    } else {
        print_report(&report);
    }

    Ok(match report.status {
        Outcome::Error => 1,
        Outcome::Success | Outcome::Warning => 0,
    })
}
