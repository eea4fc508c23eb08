// CLI argument parsing and definitions

use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use vm_config::EmptyPatternPolicy;
use vm_hypervisor::DEFAULT_TIMEOUT_SECS;

#[derive(Debug, Clone, Parser)]
#[command(name = "vmbackup")]
#[command(about = "Snapshot, export and rotate backups of VMs on a hypervisor pool")]
#[command(version)]
#[command(group(ArgGroup::new("credential").required(true).args(["password", "password_file"])))]
#[command(group(ArgGroup::new("selection").required(true).args(["config_file", "vm_selector"])))]
pub struct Args {
    /// Pool password
    #[arg(short = 'p', long)]
    pub password: Option<String>,

    /// File holding the base64-encoded pool password
    #[arg(long, value_name = "FILE")]
    pub password_file: Option<PathBuf>,

    /// Configuration file with vm-export, vdi-export and exclude selectors
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Back up a single VM, e.g. `PRD-web` or `PRD-web:3`, with default settings
    #[arg(long, value_name = "NAME[:N]")]
    pub vm_selector: Option<String>,

    /// Resolve and check the configuration, print the plan, and stop
    #[arg(long)]
    pub preview: bool,

    /// Compress VM exports (.xva.gz)
    #[arg(long)]
    pub compress: bool,

    /// Prune old backups before taking a new one
    #[arg(long)]
    pub pre_clean: bool,

    /// Warn about unknown configuration keys instead of failing
    #[arg(long)]
    pub ignore_extra_keys: bool,

    /// What an empty vm-export pattern selects
    #[arg(long, value_enum, default_value_t = EmptyPatternPolicy::MatchNothing)]
    pub empty_vm_export: EmptyPatternPolicy,

    /// Pool master to connect to; the local toolstack is used when omitted
    #[arg(short = 's', long)]
    pub server: Option<String>,

    /// Pool user name
    #[arg(short = 'u', long, default_value = "root")]
    pub username: String,

    /// Timeout in seconds for each hypervisor call
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout: u64,

    /// Print the preview plan or run report as JSON
    #[arg(long)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_requires_credential_and_selection() {
        assert!(Args::try_parse_from(["vmbackup", "--config-file", "a.cfg"]).is_err());
        assert!(Args::try_parse_from(["vmbackup", "--password", "pw"]).is_err());
        assert!(Args::try_parse_from([
            "vmbackup",
            "--password",
            "pw",
            "--password-file",
            "pw.b64",
            "--vm-selector",
            "web"
        ])
        .is_err());
    }

    #[test]
    fn test_defaults() {
        let args =
            Args::try_parse_from(["vmbackup", "--password", "pw", "--vm-selector", "web:2"])
                .unwrap();
        assert_eq!(args.vm_selector.as_deref(), Some("web:2"));
        assert_eq!(args.username, "root");
        assert_eq!(args.timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(args.empty_vm_export, EmptyPatternPolicy::MatchNothing);
        assert!(!args.preview);
    }

    #[test]
    fn test_empty_vm_export_values() {
        let args = Args::try_parse_from([
            "vmbackup",
            "--password",
            "pw",
            "--config-file",
            "a.cfg",
            "--empty-vm-export",
            "all",
        ])
        .unwrap();
        assert_eq!(args.empty_vm_export, EmptyPatternPolicy::MatchAll);
    }
}
