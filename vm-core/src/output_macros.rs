//! Operator-facing console output for vmbackup.
//!
//! Plan previews and run reports are written to stdout with [`vm_println!`]
//! so `--json` output can be piped. Status lines go to stderr, prefixed
//! with a marker for their severity. Diagnostics go through `tracing`.

/// A report line on stdout.
#[macro_export]
macro_rules! vm_println {
    () => {
        println!()
    };
    ($($arg:tt)*) => {
        println!($($arg)*)
    };
}

/// A status line on stderr: `vm_status!(warning, "{} skipped", vm)`.
#[macro_export]
macro_rules! vm_status {
    (success, $($arg:tt)*) => {
        eprintln!("✓ {}", format_args!($($arg)*))
    };
    (warning, $($arg:tt)*) => {
        eprintln!("⚠ {}", format_args!($($arg)*))
    };
    (error, $($arg:tt)*) => {
        eprintln!("❌ {}", format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! vm_success {
    ($($arg:tt)*) => {
        $crate::vm_status!(success, $($arg)*)
    };
}

#[macro_export]
macro_rules! vm_warning {
    ($($arg:tt)*) => {
        $crate::vm_status!(warning, $($arg)*)
    };
}

#[macro_export]
macro_rules! vm_error {
    ($($arg:tt)*) => {
        $crate::vm_status!(error, $($arg)*)
    };
}

/// An error line followed by one indented line per cause.
#[macro_export]
macro_rules! vm_error_with_details {
    ($main:expr, $details:expr) => {{
        $crate::vm_status!(error, "{}", $main);
        for detail in $details {
            eprintln!("   └─ {}", detail);
        }
    }};
}
