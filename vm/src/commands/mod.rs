//! Command execution: load and validate the configuration, resolve the
//! selectors against the pool, then preview or back up.

use anyhow::{bail, Context, Result};
use tracing::info;
use vm_config::{
    resolve, verify_targets, BackupConfig, LoadOptions, Resolution, ResolveOptions,
};
use vm_core::vm_error_with_details;
use vm_hypervisor::{Hypervisor, XeConnection, XeHypervisor};
use vm_messages::{msg, MESSAGES};

use crate::cli::Args;
use crate::credentials::load_password;

pub mod backup;
pub mod preview;

/// Exit code of a preview run, which never backs anything up.
pub const PREVIEW_EXIT_CODE: i32 = 1;

const XE_BINARY: &str = "xe";

/// Configuration from `--config-file`, or defaults plus `--vm-selector`.
pub fn load_config(args: &Args) -> Result<BackupConfig> {
    let config = match (&args.config_file, &args.vm_selector) {
        (Some(path), _) => {
            let options = LoadOptions {
                ignore_extra_keys: args.ignore_extra_keys,
            };
            BackupConfig::load(path, &options)
                .with_context(|| msg!(MESSAGES.error_config_invalid, path = path.display()))?
        }
        (None, Some(selector)) => BackupConfig::for_selector(selector),
        (None, None) => bail!("either --config-file or --vm-selector is required"),
    };

    let source = config
        .source
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "--vm-selector".to_string());
    config
        .validate()
        .with_context(|| msg!(MESSAGES.error_config_invalid, path = source))?;
    Ok(config)
}

/// Resolve selectors against the pool inventory; unresolved names are fatal.
pub fn resolve_targets(
    args: &Args,
    config: &BackupConfig,
    inventory: &[String],
) -> Result<Resolution> {
    let options = ResolveOptions {
        default_max_backups: config.max_backups,
        empty_vm_export: args.empty_vm_export,
    };
    let resolution = resolve(
        &config.vm_export,
        &config.vdi_export,
        &config.exclude,
        inventory,
        &options,
    );

    if resolution.is_fatal() {
        vm_error_with_details!(MESSAGES.error_selectors_unresolved, &resolution.errors);
        bail!(MESSAGES.error_selectors_unresolved);
    }

    let missing = verify_targets(&resolution.targets, inventory);
    if !missing.is_empty() {
        bail!("VM(s) not found on pool: {}", missing.join(", "));
    }

    Ok(resolution)
}

pub fn execute_command(args: Args) -> Result<i32> {
    let password = load_password(&args)?;
    let config = load_config(&args)?;

    if !vm_core::is_tool_installed(XE_BINARY) {
        bail!(msg!(MESSAGES.error_xe_missing, binary = XE_BINARY));
    }

    let hypervisor = XeHypervisor::new(
        XeConnection {
            server: args.server.clone(),
            username: args.username.clone(),
            password,
        },
        args.timeout,
    );

    let inventory = hypervisor
        .list_vms()
        .context("failed to list VMs on the pool")?;
    info!("{} VMs on the pool", inventory.len());

    let resolution = resolve_targets(&args, &config, &inventory)?;

    if args.preview {
        preview::show_plan(&args, &config, &resolution, &inventory, &hypervisor)?;
        return Ok(PREVIEW_EXIT_CODE);
    }

    backup::run(&args, &config, &resolution, &hypervisor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::fs;
    use tempfile::TempDir;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["vmbackup", "--password", "pw"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    fn inventory(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_config_file() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("vmbackup.cfg");
        fs::write(
            &cfg,
            format!(
                "backup_dir={}\nmax_backups=2\nvm-export=PRD-web\n",
                dir.path().display()
            ),
        )
        .unwrap();
        let args = args(&["--config-file", cfg.to_str().unwrap()]);

        let config = load_config(&args).unwrap();
        assert_eq!(config.max_backups, 2);
        assert_eq!(config.source.as_deref(), Some(cfg.as_path()));
    }

    #[test]
    fn test_load_config_rejects_unknown_key() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("vmbackup.cfg");
        fs::write(
            &cfg,
            format!("backup_dir={}\nvm-export=a\nbogus=1\n", dir.path().display()),
        )
        .unwrap();

        let strict = args(&["--config-file", cfg.to_str().unwrap()]);
        assert!(load_config(&strict).is_err());

        let lenient = args(&["--config-file", cfg.to_str().unwrap(), "--ignore-extra-keys"]);
        assert!(load_config(&lenient).is_ok());
    }

    #[test]
    fn test_resolve_targets_with_override() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            ..BackupConfig::for_selector("PRD-web:3")
        };
        let args = args(&["--vm-selector", "PRD-web:3"]);

        let resolution = resolve_targets(&args, &config, &inventory(&["PRD-web"])).unwrap();
        assert_eq!(resolution.targets.len(), 1);
        assert_eq!(resolution.targets[0].max_backups, 3);
    }

    #[test]
    fn test_resolve_targets_invalid_regex_is_fatal() {
        let config = BackupConfig::for_selector("PRD-(");
        let args = args(&["--vm-selector", "PRD-("]);
        assert!(resolve_targets(&args, &config, &inventory(&["PRD-web"])).is_err());
    }
}
