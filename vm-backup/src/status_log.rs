//! Append-only status log: one CSV-like line per run and per target.
//!
//! ```text
//! 240307 02:00:00,vmbackup,pool1,begin,
//! 240307 02:00:05,vm-export,pool1,begin,PRD-web
//! 240307 02:14:40,vm-export,pool1,end,SUCCESS PRD-web,elapse:14.58 size:3.21G
//! 240307 02:14:41,vmbackup,pool1,end,SUCCESS,S:1 W:0 E:0
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use vm_core::error::{Result, VmError};

const TIMESTAMP_FORMAT: &str = "%y%m%d %H:%M:%S";

/// Kind column for run-level lines.
pub const RUN_KIND: &str = "vmbackup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Begin,
    End,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "begin",
            Phase::End => "end",
        }
    }
}

/// Writer for the status log; `None` path turns every call into a no-op.
#[derive(Debug, Clone)]
pub struct StatusLog {
    path: Option<PathBuf>,
    server: String,
}

impl StatusLog {
    pub fn new(path: Option<PathBuf>, server: impl Into<String>) -> Self {
        Self {
            path,
            server: server.into(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, "")
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn line(
        &self,
        at: NaiveDateTime,
        kind: &str,
        phase: Phase,
        status: &str,
    ) -> String {
        format!(
            "{},{},{},{},{}",
            at.format(TIMESTAMP_FORMAT),
            kind,
            self.server,
            phase.as_str(),
            status
        )
    }

    /// Append one line.
    pub fn append(&self, at: NaiveDateTime, kind: &str, phase: Phase, status: &str) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "open"))?;
        writeln!(file, "{}", self.line(at, kind, phase, status))
            .map_err(|e| VmError::filesystem(e, path.to_string_lossy(), "write"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn at() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(2, 0, 5)
            .unwrap()
    }

    #[test]
    fn test_line_format() {
        let log = StatusLog::new(None, "pool1");
        assert_eq!(
            log.line(at(), "vm-export", Phase::Begin, "PRD-web"),
            "240307 02:00:05,vm-export,pool1,begin,PRD-web"
        );
    }

    #[test]
    fn test_append_accumulates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("status.log");
        let log = StatusLog::new(Some(path.clone()), "pool1");

        log.append(at(), RUN_KIND, Phase::Begin, "").unwrap();
        log.append(at(), RUN_KIND, Phase::End, "SUCCESS,S:0 W:0 E:0")
            .unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "240307 02:00:05,vmbackup,pool1,begin,");
        assert!(lines[1].ends_with("end,SUCCESS,S:0 W:0 E:0"));
    }

    #[test]
    fn test_disabled_writes_nothing() {
        let log = StatusLog::disabled();
        assert!(log.append(at(), RUN_KIND, Phase::Begin, "").is_ok());
        assert!(log.path().is_none());
    }
}
