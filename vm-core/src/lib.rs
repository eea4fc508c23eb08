pub mod command_stream;
pub mod error;
pub mod output_macros;
pub mod system_check;

pub use command_stream::{is_tool_installed, run_command, CommandOutput};
pub use system_check::{disk_space_for, hostname, short_hostname, DiskSpace};
