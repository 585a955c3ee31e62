//! Append-only, human-readable progress log for a session.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;

const ENTRY_PREFIX: &str = "- [";

#[derive(Debug, Clone)]
pub struct ProgressLog {
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the header if the log does not exist yet.
    pub fn init(&self, session_name: &str) -> Result<()> {
        if self.path.exists() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        fs::write(&self.path, format!("# Progress: {session_name}\n\n"))
            .with_context(|| format!("write progress log {}", self.path.display()))
    }

    /// Append one timestamped entry.
    pub fn append(&self, entry: &str) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        // Entries stay on one line so `tail` can find them.
        let entry = entry.replace(['\r', '\n'], " ");
        writeln!(file, "{ENTRY_PREFIX}{stamp}] {entry}")
            .with_context(|| format!("append progress log {}", self.path.display()))
    }

    /// The last `count` entries, oldest first.
    pub fn tail(&self, count: usize) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read progress log {}", self.path.display()))?;
        let entries: Vec<&str> = contents
            .lines()
            .filter(|line| line.starts_with(ENTRY_PREFIX))
            .collect();
        let skip = entries.len().saturating_sub(count);
        Ok(entries[skip..].iter().map(|s| s.to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.md"));
        log.init("Demo").expect("init");
        log.init("Ignored").expect("init twice");
        for n in 1..=4 {
            log.append(&format!("iteration {n}\ncompleted")).expect("append");
        }
        let tail = log.tail(2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert!(tail[0].ends_with("] iteration 3 completed"));
        assert!(tail[1].ends_with("] iteration 4 completed"));

        let contents = fs::read_to_string(log.path()).expect("read");
        assert!(contents.starts_with("# Progress: Demo\n"));
    }

    #[test]
    fn tail_of_missing_log_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = ProgressLog::new(temp.path().join("progress.md"));
        assert!(log.tail(5).expect("tail").is_empty());
    }
}
