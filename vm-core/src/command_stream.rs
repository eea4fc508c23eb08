// Standard library
use std::ffi::OsStr;
use std::thread;
use std::time::{Duration, Instant};

// External crates
use crate::error::{Result, VmError};
use duct::cmd;
use tracing::debug;
use which::which;

/// Arguments whose following value must never reach a log line.
const SECRET_FLAGS: &[&str] = &["-pw", "--password"];

/// Captured result of an external command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout with surrounding whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// Render a command line for logs, masking secrets.
pub fn describe_command<A: AsRef<OsStr>>(command: &str, args: &[A]) -> String {
    let mut parts = vec![command.to_string()];
    let mut mask_next = false;
    for arg in args {
        let arg = arg.as_ref().to_string_lossy();
        if mask_next {
            parts.push("********".to_string());
            mask_next = false;
            continue;
        }
        mask_next = SECRET_FLAGS.contains(&arg.as_ref());
        parts.push(arg.into_owned());
    }
    parts.join(" ")
}

/// Run a command to completion, capturing stdout and stderr.
///
/// A non-zero exit status is not an error here; callers inspect
/// [`CommandOutput::success`]. Failing to spawn the process, or exceeding
/// `timeout_secs`, is.
pub fn run_command<A: AsRef<OsStr>>(
    command: &str,
    args: &[A],
    timeout_secs: Option<u64>,
) -> Result<CommandOutput> {
    let full_command = describe_command(command, args);
    debug!("Running: {}", full_command);

    let expression = cmd(command, args)
        .stdout_capture()
        .stderr_capture()
        .unchecked();

    match timeout_secs {
        None => {
            let output = expression.run().map_err(|e| {
                VmError::Command(format!("Failed to start command '{}': {}", full_command, e))
            })?;
            Ok(CommandOutput {
                code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
        Some(secs) => {
            let handle = expression.start().map_err(|e| {
                VmError::Command(format!("Failed to start command '{}': {}", full_command, e))
            })?;

            let start = Instant::now();
            let timeout = Duration::from_secs(secs);

            loop {
                if start.elapsed() >= timeout {
                    let _ = handle.kill();
                    return Err(VmError::Timeout(format!(
                        "Command timed out after {}s: {}",
                        secs, full_command
                    )));
                }

                match handle.try_wait() {
                    Ok(Some(output)) => {
                        return Ok(CommandOutput {
                            code: output.status.code(),
                            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                        });
                    }
                    Ok(None) => thread::sleep(Duration::from_millis(100)),
                    Err(e) => {
                        return Err(VmError::Command(format!(
                            "Error waiting for command '{}': {}",
                            full_command, e
                        )));
                    }
                }
            }
        }
    }
}

/// Checks if a command-line tool is available in the system's PATH.
pub fn is_tool_installed(tool_name: &str) -> bool {
    which(tool_name).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_command_masks_password() {
        let line = describe_command("xe", &["-s", "pool1", "-pw", "hunter2", "vm-list"]);
        assert_eq!(line, "xe -s pool1 -pw ******** vm-list");
        assert!(!line.contains("hunter2"));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_captures_stdout() {
        let output = run_command("sh", &["-c", "echo hello"], Some(10)).unwrap();
        assert!(output.success());
        assert_eq!(output.trimmed(), "hello");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_reports_nonzero_exit() {
        let output = run_command("sh", &["-c", "echo oops >&2; exit 3"], None).unwrap();
        assert!(!output.success());
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[test]
    fn test_run_command_times_out() {
        let result = run_command("sleep", &["5"], Some(1));
        assert!(matches!(result, Err(VmError::Timeout(_))));
    }

    #[test]
    fn test_missing_binary_is_command_error() {
        let result = run_command("definitely-not-a-real-binary-xyz", &["--help"], None);
        assert!(matches!(result, Err(VmError::Command(_))));
    }
}
