// External crates
use clap::Parser;
use tracing::debug;

// Internal imports
use vm_core::vm_error;
use vm_messages::{msg, MESSAGES};

// Local modules
mod cli;
mod commands;
mod credentials;

use cli::Args;
use commands::execute_command;

fn main() {
    // Tests read stderr for operator messages, so logging can be switched off.
    let guard = if std::env::var("VMBACKUP_TEST_MODE").is_err() {
        vm_logging::init_subscriber()
    } else {
        None
    };

    let args = Args::parse();
    debug!("Starting vmbackup (preview: {})", args.preview);

    let code = match execute_command(args) {
        Ok(code) => code,
        Err(e) => {
            vm_error!("{}", msg!(MESSAGES.error_generic, error = format!("{:#}", e)));
            1
        }
    };

    // Flush the file appender before exiting.
    drop(guard);
    std::process::exit(code);
}
