//! Backup configuration and VM selector resolution.
//!
//! - [`config`]: the `key=value` configuration file, its defaults and validation.
//! - [`selector`]: turns include/exclude selector lists into backup targets.

pub mod config;
pub mod selector;

pub use config::{BackupConfig, LoadOptions, VdiExportFormat};
pub use selector::{
    resolve, verify_targets, vms_not_in_backup, BackupTarget, EmptyPatternPolicy, ExportKind,
    Resolution, ResolutionContext, ResolveOptions, SelectorEntry,
};
