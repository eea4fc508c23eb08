//! Backup configuration: `key=value` file loading and validation.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use vm_core::error::{Result, VmError};

use crate::selector::SelectorEntry;

pub const DEFAULT_POOL_DB_BACKUP: u8 = 0;
pub const DEFAULT_MAX_BACKUPS: u32 = 4;
pub const DEFAULT_BACKUP_DIR: &str = "/snapshots/BACKUPS";
pub const DEFAULT_STATUS_LOG: &str = "/snapshots/NAUbackup/status.log";

/// Keys accepted in a configuration file.
pub const EXPECTED_KEYS: &[&str] = &[
    "pool_db_backup",
    "max_backups",
    "backup_dir",
    "status_log",
    "vdi_export_format",
    "vm-export",
    "vdi-export",
    "exclude",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdiExportFormat {
    #[default]
    Raw,
    Vhd,
}

impl VdiExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            VdiExportFormat::Raw => "raw",
            VdiExportFormat::Vhd => "vhd",
        }
    }
}

impl fmt::Display for VdiExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VdiExportFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(VdiExportFormat::Raw),
            "vhd" => Ok(VdiExportFormat::Vhd),
            other => Err(format!("vdi_export_format invalid -> {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Log and skip unknown keys instead of failing.
    pub ignore_extra_keys: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupConfig {
    /// File the configuration came from; `None` for a single `--vm-selector` run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    pub pool_db_backup: u8,
    pub max_backups: u32,
    pub backup_dir: PathBuf,
    pub status_log: PathBuf,
    pub vdi_export_format: VdiExportFormat,
    pub vm_export: Vec<String>,
    pub vdi_export: Vec<String>,
    pub exclude: Vec<String>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            source: None,
            pool_db_backup: DEFAULT_POOL_DB_BACKUP,
            max_backups: DEFAULT_MAX_BACKUPS,
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            status_log: PathBuf::from(DEFAULT_STATUS_LOG),
            vdi_export_format: VdiExportFormat::default(),
            vm_export: Vec::new(),
            vdi_export: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

impl BackupConfig {
    /// Read and parse a configuration file.
    pub fn load(path: &Path, options: &LoadOptions) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "read_to_string"))?;
        let mut config = Self::parse(&contents, options).map_err(|e| match e {
            VmError::Config(msg) => {
                VmError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        config.source = Some(path.to_path_buf());
        Ok(config)
    }

    /// Parse configuration text. Every problem found is reported in one error.
    pub fn parse(contents: &str, options: &LoadOptions) -> Result<Self> {
        let mut config = Self::default();
        let mut problems = Vec::new();

        for (index, raw_line) in contents.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                problems.push(format!("line {}: expected key=value, got '{}'", index + 1, line));
                continue;
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "pool_db_backup" => match value.parse::<u8>() {
                    Ok(v) => config.pool_db_backup = v,
                    Err(_) => problems.push(format!("pool_db_backup non-numeric -> {}", value)),
                },
                "max_backups" => match value.parse::<u32>() {
                    Ok(v) => config.max_backups = v,
                    Err(_) => problems.push(format!("max_backups non-numeric -> {}", value)),
                },
                "backup_dir" => config.backup_dir = PathBuf::from(value),
                "status_log" => config.status_log = PathBuf::from(value),
                "vdi_export_format" => match value.parse() {
                    Ok(format) => config.vdi_export_format = format,
                    Err(msg) => problems.push(msg),
                },
                "vm-export" => config.vm_export.push(value.to_string()),
                "vdi-export" => config.vdi_export.push(value.to_string()),
                "exclude" => config.exclude.push(value.to_string()),
                unknown if options.ignore_extra_keys => {
                    warn!("ignoring config key: {}", unknown);
                }
                unknown => problems.push(format!("unexpected config key: {}", unknown)),
            }
        }

        if problems.is_empty() {
            Ok(config)
        } else {
            Err(VmError::Config(problems.join("; ")))
        }
    }

    /// Defaults plus a single `vm-export` selector, for command-line runs.
    pub fn for_selector(selector: &str) -> Self {
        Self {
            vm_export: vec![selector.trim().to_string()],
            ..Self::default()
        }
    }

    /// The status log is only written for config-file runs.
    pub fn status_log_enabled(&self) -> bool {
        self.source.is_some()
    }

    /// Check ranges, paths and selector overrides; report every violation.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.max_backups < 1 {
            problems.push(format!("max_backups out of range -> {}", self.max_backups));
        }
        if self.pool_db_backup > 1 {
            problems.push(format!(
                "pool_db_backup out of range -> {}",
                self.pool_db_backup
            ));
        }
        if !self.backup_dir.is_dir() {
            problems.push(format!(
                "backup_dir does not exist -> {}",
                self.backup_dir.display()
            ));
        }
        if self.vm_export.is_empty() && self.vdi_export.is_empty() {
            problems.push("no VMs loaded: need at least one vm-export or vdi-export".to_string());
        }

        for (key, entries) in [("vdi-export", &self.vdi_export), ("vm-export", &self.vm_export)] {
            for raw in entries {
                if let Err(reason) = SelectorEntry::parse(raw) {
                    problems.push(format!("{}={}: {}", key, raw, reason));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(VmError::Config(problems.join("; ")))
        }
    }

    /// Log the effective settings at the start of a run.
    pub fn log_settings(&self, compress: bool) {
        info!("vmbackup running with these settings:");
        info!("  backup_dir        = {}", self.backup_dir.display());
        info!("  status_log        = {}", self.status_log.display());
        info!("  compress          = {}", compress);
        info!("  max_backups       = {}", self.max_backups);
        info!("  vdi_export_format = {}", self.vdi_export_format);
        info!("  pool_db_backup    = {}", self.pool_db_backup);

        for (key, entries) in [
            ("exclude", &self.exclude),
            ("vdi-export", &self.vdi_export),
            ("vm-export", &self.vm_export),
        ] {
            let mut sorted = entries.clone();
            sorted.sort();
            info!("  {} (cnt)= {}", key, entries.len());
            info!("  {}: {}", key, sorted.join(","));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = "\
# nightly backups
max_backups=3
backup_dir = /tmp
vdi_export_format=vhd
pool_db_backup=1

vm-export=PRD-.*
vm-export=PRD-web:7
vdi-export=PRD-db
exclude=PRD-test
";

    #[test]
    fn test_parse_sample() {
        let config = BackupConfig::parse(SAMPLE, &LoadOptions::default()).unwrap();
        assert_eq!(config.max_backups, 3);
        assert_eq!(config.backup_dir, PathBuf::from("/tmp"));
        assert_eq!(config.vdi_export_format, VdiExportFormat::Vhd);
        assert_eq!(config.pool_db_backup, 1);
        assert_eq!(config.vm_export, vec!["PRD-.*", "PRD-web:7"]);
        assert_eq!(config.vdi_export, vec!["PRD-db"]);
        assert_eq!(config.exclude, vec!["PRD-test"]);
        assert_eq!(config.status_log, PathBuf::from(DEFAULT_STATUS_LOG));
        assert!(config.source.is_none());
    }

    #[test]
    fn test_last_scalar_wins() {
        let config =
            BackupConfig::parse("max_backups=2\nmax_backups=5\n", &LoadOptions::default())
                .unwrap();
        assert_eq!(config.max_backups, 5);
    }

    #[test]
    fn test_empty_list_value_is_kept() {
        let config = BackupConfig::parse("vm-export=\n", &LoadOptions::default()).unwrap();
        assert_eq!(config.vm_export, vec![String::new()]);
    }

    #[test]
    fn test_unknown_key_is_fatal() {
        let err = BackupConfig::parse("mail_to=ops@example.com\n", &LoadOptions::default())
            .unwrap_err();
        assert!(err.to_string().contains("unexpected config key: mail_to"));
    }

    #[test]
    fn test_unknown_key_ignored_when_requested() {
        let options = LoadOptions {
            ignore_extra_keys: true,
        };
        let config = BackupConfig::parse("mail_to=ops\nvm-export=a\n", &options).unwrap();
        assert_eq!(config.vm_export, vec!["a"]);
    }

    #[test]
    fn test_all_problems_reported_together() {
        let err = BackupConfig::parse(
            "max_backups=many\nvdi_export_format=qcow2\nnot a pair\n",
            &LoadOptions::default(),
        )
        .unwrap_err()
        .to_string();
        assert!(err.contains("max_backups non-numeric -> many"));
        assert!(err.contains("vdi_export_format invalid -> qcow2"));
        assert!(err.contains("line 3: expected key=value"));
    }

    #[test]
    fn test_validate_accepts_good_config() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            vm_export: vec!["PRD-web:3".to_string()],
            ..BackupConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_reports_ranges_and_missing_dir() {
        let config = BackupConfig {
            max_backups: 0,
            pool_db_backup: 2,
            backup_dir: PathBuf::from("/definitely/not/here"),
            vdi_export: vec!["PRD-db:-1".to_string()],
            ..BackupConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_backups out of range"));
        assert!(err.contains("pool_db_backup out of range"));
        assert!(err.contains("backup_dir does not exist"));
        assert!(err.contains("vdi-export=PRD-db:-1"));
    }

    #[test]
    fn test_validate_requires_some_vm() {
        let dir = TempDir::new().unwrap();
        let config = BackupConfig {
            backup_dir: dir.path().to_path_buf(),
            exclude: vec!["PRD-web".to_string()],
            ..BackupConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("no VMs loaded"));
    }

    #[test]
    fn test_load_sets_source_and_enables_status_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("backup.cfg");
        std::fs::write(&path, "vm-export=PRD-web\n").unwrap();

        let config = BackupConfig::load(&path, &LoadOptions::default()).unwrap();
        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert!(config.status_log_enabled());
    }

    #[test]
    fn test_load_prefixes_errors_with_path() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.cfg");
        std::fs::write(&path, "bogus=1\n").unwrap();

        let err = BackupConfig::load(&path, &LoadOptions::default())
            .unwrap_err()
            .to_string();
        assert!(err.contains("bad.cfg"));
    }

    #[test]
    fn test_for_selector() {
        let config = BackupConfig::for_selector("PRD-web:2");
        assert_eq!(config.vm_export, vec!["PRD-web:2"]);
        assert!(!config.status_log_enabled());
        assert_eq!(config.max_backups, DEFAULT_MAX_BACKUPS);
    }
}
