//! Central registry for all user-facing message templates.
//!
//! Naming Convention:
//! - `common_*` - Shared/reusable messages
//! - `{area}_{component}` - Area-specific messages (e.g., preview_*, run_*)
//!
//! Templates use `{variable}` syntax for runtime values, which are
//! substituted by the `MessageBuilder`.

pub struct Messages {
    // ============================================================================
    // Common Messages
    // ============================================================================
    pub common_fatal: &'static str,

    // ============================================================================
    // Error Messages
    // ============================================================================
    pub error_generic: &'static str,
    pub error_config_invalid: &'static str,
    pub error_selectors_unresolved: &'static str,
    pub error_backup_dir_unwritable: &'static str,
    pub error_password_file_missing: &'static str,
    pub error_xe_missing: &'static str,

    // ============================================================================
    // Preview Messages
    // ============================================================================
    pub preview_header: &'static str,
    pub preview_target_line: &'static str,
    pub preview_not_in_backup: &'static str,
    pub preview_duplicate_name: &'static str,
    pub preview_success: &'static str,
    pub preview_success_with_warnings: &'static str,

    // ============================================================================
    // Run Messages
    // ============================================================================
    pub run_space: &'static str,
    pub run_target_line: &'static str,
    pub run_summary_success: &'static str,
    pub run_summary_warning: &'static str,
    pub run_summary_error: &'static str,
}

pub const MESSAGES: Messages = Messages {
    // ============================================================================
    // Common Messages
    // ============================================================================
    common_fatal: "vmbackup stopped before any VM was backed up",

    // ============================================================================
    // Error Messages
    // ============================================================================
    error_generic: "Error: {error}",
    error_config_invalid: "Configuration in '{path}' is invalid",
    error_selectors_unresolved: "VM selectors could not be resolved",
    error_backup_dir_unwritable: "Backup directory '{path}' is not writable",
    error_password_file_missing: "Password file '{path}' does not exist",
    error_xe_missing: "The '{binary}' command was not found on PATH",

    // ============================================================================
    // Preview Messages
    // ============================================================================
    preview_header: "\n📋 Backup plan ({count} VMs, default max_backups={max_backups})\n",
    preview_target_line: "  {kind} {vm} keep {max_backups}",
    preview_not_in_backup: "\nVMs not in backup: {vms}",
    preview_duplicate_name: "Duplicate VM name on pool: {vm}",
    preview_success: "SUCCESS preview / check of parameters",
    preview_success_with_warnings: "SUCCESS preview / check of parameters - WARNINGS found (see above)",

    // ============================================================================
    // Run Messages
    // ============================================================================
    run_space: "{label} {mount}: {available} GiB free of {total} GiB ({used}% used)",
    run_target_line: "  {status} {kind} {vm} {detail}",
    run_summary_success: "vmbackup ended - Success - {summary}",
    run_summary_warning: "vmbackup ended - **WARNING(s)** - {summary}",
    run_summary_error: "vmbackup ended - **ERRORS DETECTED** - {summary}",
};
