use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VmError {
    Config(String),
    Hypervisor {
        operation: String,
        message: String,
    },
    Command(String),
    Timeout(String),
    DirectoryCreate {
        path: PathBuf,
        source: std::io::Error,
    },
    Filesystem {
        source: std::io::Error,
        path: String,
        operation: String,
    },
    Io(#[from] std::io::Error),
    Internal(String),
    Other(#[from] anyhow::Error),
}

impl VmError {
    /// Wrap an I/O error with the path and filesystem operation that produced it.
    pub fn filesystem(
        source: std::io::Error,
        path: impl Into<String>,
        operation: impl Into<String>,
    ) -> Self {
        VmError::Filesystem {
            source,
            path: path.into(),
            operation: operation.into(),
        }
    }

    pub fn hypervisor(operation: impl Into<String>, message: impl Into<String>) -> Self {
        VmError::Hypervisor {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl Display for VmError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VmError::Config(s) => write!(f, "Configuration error: {}", s),
            VmError::Hypervisor { operation, message } => {
                write!(f, "Hypervisor operation '{}' failed: {}", operation, message)
            }
            VmError::Command(s) => write!(f, "Command failed: {}", s),
            VmError::Timeout(s) => write!(f, "Timeout: {}", s),
            VmError::DirectoryCreate { path, source } => write!(
                f,
                "Failed to create directory '{}': {}",
                path.display(),
                source
            ),
            VmError::Filesystem {
                source,
                path,
                operation,
            } => write!(
                f,
                "Filesystem error during '{}' on '{}': {}",
                operation, path, source
            ),
            VmError::Io(e) => write!(f, "I/O error: {}", e),
            VmError::Internal(s) => write!(f, "Internal error: {}", s),
            VmError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, VmError>;
