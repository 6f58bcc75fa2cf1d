use crate::changes::Changes;
use crate::error::Result;
use serde_json::json;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOG_FILE: &str = "log.json";

/// Append-only log of command invocations and end-of-session change
/// counters, one JSON object per line.
pub struct Logger {
    path: PathBuf,
}

impl Logger {
    /// Open the log and record the command that opened the session.
    pub fn open(dir: &Path, command: &str) -> Result<Logger> {
        let logger = Logger {
            path: dir.join(LOG_FILE),
        };
        logger.append(&json!({ "command": command }))?;
        Ok(logger)
    }

    /// Record the session's accumulated change counters.
    pub fn add_changes(&self, changes: &Changes) -> Result<()> {
        self.append(&json!({ "changes": changes }))
    }

    fn append(&self, line: &serde_json::Value) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}
