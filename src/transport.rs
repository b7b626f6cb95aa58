//! Chat transport - where announcement lines go
//!
//! The engine only knows "send this line to that channel". Real chat
//! connections live outside this crate; the relay ships a stdout transport
//! and a JSONL log transport that also backs `bzrelay history`.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::Result;

/// Outcome of sending one line.
#[derive(Debug, Clone, PartialEq)]
pub enum SendResult {
    Sent,
    /// Deliberately not delivered (dry run, not joined).
    Skipped(String),
    Failed(String),
}

/// Delivery of formatted lines to chat channels.
pub trait ChatTransport: Send + Sync {
    /// Transport name, for logs.
    fn name(&self) -> &str;

    /// Channels currently joined; the engine announces to each of them.
    fn joined_channels(&self) -> Vec<String>;

    fn send(&self, channel: &str, line: &str) -> Result<SendResult>;
}

/// Prints `[channel] line` to stdout.
pub struct StdoutTransport {
    channels: Vec<String>,
    dry_run: bool,
}

impl StdoutTransport {
    pub fn new(channels: Vec<String>) -> Self {
        Self {
            channels,
            dry_run: false,
        }
    }

    /// Log lines instead of printing them.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl ChatTransport for StdoutTransport {
    fn name(&self) -> &str {
        "stdout"
    }

    fn joined_channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn send(&self, channel: &str, line: &str) -> Result<SendResult> {
        if self.dry_run {
            info!(channel = %channel, line = %line, "Dry run, not sending");
            return Ok(SendResult::Skipped("dry run".to_string()));
        }
        println!("[{}] {}", channel, line);
        Ok(SendResult::Sent)
    }
}

/// One announced line (JSONL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnouncementRecord {
    pub ts: DateTime<Utc>,
    pub channel: String,
    pub line: String,
}

/// Append-only JSONL log of announcements.
#[derive(Debug, Clone)]
pub struct AnnouncementLog {
    path: PathBuf,
}

impl AnnouncementLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("bugzilla-relay")
            .join("announcements.jsonl")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record under an exclusive file lock.
    pub fn append(&self, record: &AnnouncementRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string(record)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let written = writeln!(file, "{}", json);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// Last `n` records, oldest first. Unreadable lines are skipped.
    pub fn read_recent(&self, n: usize) -> Vec<AnnouncementRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let records: Vec<AnnouncementRecord> = BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let start = records.len().saturating_sub(n);
        let mut recent = records[start..].to_vec();
        recent.sort_by_key(|r| r.ts);
        recent
    }
}

/// Records every line to an [`AnnouncementLog`].
pub struct LogFileTransport {
    log: AnnouncementLog,
    channels: Vec<String>,
}

impl LogFileTransport {
    pub fn new(log: AnnouncementLog, channels: Vec<String>) -> Self {
        Self { log, channels }
    }
}

impl ChatTransport for LogFileTransport {
    fn name(&self) -> &str {
        "log_file"
    }

    fn joined_channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn send(&self, channel: &str, line: &str) -> Result<SendResult> {
        let record = AnnouncementRecord {
            ts: Utc::now(),
            channel: channel.to_string(),
            line: line.to_string(),
        };

        match self.log.append(&record) {
            Ok(()) => {
                debug!(channel = %channel, path = %self.log.path().display(), "Announcement recorded");
                Ok(SendResult::Sent)
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to record announcement");
                Ok(SendResult::Failed(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_log_transport_appends_and_reads_back() {
        let dir = TempDir::new().unwrap();
        let log = AnnouncementLog::new(dir.path().join("nested").join("log.jsonl"));
        let transport = LogFileTransport::new(log.clone(), vec!["#dev".to_string()]);

        for i in 0..3 {
            let result = transport.send("#dev", &format!("line {}", i)).unwrap();
            assert_eq!(result, SendResult::Sent);
        }

        let recent = log.read_recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].line, "line 1");
        assert_eq!(recent[1].line, "line 2");
        assert_eq!(recent[1].channel, "#dev");
    }

    #[test]
    fn test_read_recent_missing_file() {
        let dir = TempDir::new().unwrap();
        let log = AnnouncementLog::new(dir.path().join("absent.jsonl"));
        assert!(log.read_recent(10).is_empty());
    }

    #[test]
    fn test_read_recent_skips_garbage_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log.jsonl");
        let good = serde_json::to_string(&AnnouncementRecord {
            ts: Utc::now(),
            channel: "#qa".to_string(),
            line: "ok".to_string(),
        })
        .unwrap();
        fs::write(&path, format!("not json\n{}\n", good)).unwrap();

        let recent = AnnouncementLog::new(path.clone()).read_recent(10);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].line, "ok");
    }

    #[test]
    fn test_stdout_dry_run_skips() {
        let transport = StdoutTransport::new(vec!["#dev".to_string()]).with_dry_run(true);
        assert_eq!(transport.joined_channels(), vec!["#dev".to_string()]);
        assert!(matches!(transport.send("#dev", "hi").unwrap(), SendResult::Skipped(_)));
    }
}
