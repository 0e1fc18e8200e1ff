use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "SUCCESS",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Destination for project-level workflow events.
pub trait LogSink: Send + Sync {
    fn append(&self, level: LogLevel, message: &str, timestamp: DateTime<Utc>);

    fn info(&self, message: &str) {
        self.append(LogLevel::Info, message, Utc::now());
    }

    fn success(&self, message: &str) {
        self.append(LogLevel::Success, message, Utc::now());
    }

    fn warning(&self, message: &str) {
        self.append(LogLevel::Warning, message, Utc::now());
    }

    fn error(&self, message: &str) {
        self.append(LogLevel::Error, message, Utc::now());
    }
}

pub fn format_entry(level: LogLevel, message: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "[{}] [{}] {}",
        timestamp.format("%Y-%m-%d %H:%M:%S"),
        level,
        message
    )
}

/// Appends entries to the project's log file and mirrors them to tracing.
pub struct ProjectLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ProjectLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &str) -> std::io::Result<()> {
        // A poisoned lock only means another writer panicked mid-append
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)
    }
}

impl LogSink for ProjectLog {
    fn append(&self, level: LogLevel, message: &str, timestamp: DateTime<Utc>) {
        match level {
            LogLevel::Info | LogLevel::Success => info!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }

        if let Err(e) = self.write_line(&format_entry(level, message, timestamp)) {
            warn!("Failed to append to {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_entry_format() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            format_entry(LogLevel::Success, "TMY written", ts),
            "[2024-03-05 07:08:09] [SUCCESS] TMY written"
        );
    }

    #[test]
    fn test_project_log_appends() {
        let dir = TempDir::new().unwrap();
        let log = ProjectLog::new(dir.path().join("project.log"));
        log.info("first");
        log.warning("second");

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] first"));
        assert!(lines[1].ends_with("[WARNING] second"));
    }

    #[test]
    fn test_unwritable_log_does_not_panic() {
        let dir = TempDir::new().unwrap();
        let log = ProjectLog::new(dir.path().join("missing").join("project.log"));
        log.error("goes nowhere");
    }
}
