//! Mailbox poller
//!
//! Drains the bugmail mbox: lock, read every message, parse, truncate,
//! unlock. The mailbox is only truncated after every message has been read
//! and parsed, so a failed cycle leaves it intact for the next one.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::bugmail::{Bugmail, BugmailParser, ParseError};
use crate::engine::NotificationEngine;
use crate::error::{RelayError, Result};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Take an exclusive advisory lock, waiting at most `timeout`.
fn lock_with_timeout(file: &File, path: &Path, timeout: Duration) -> Result<()> {
    let started = Instant::now();
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(RelayError::LockTimeout {
                        path: path.to_path_buf(),
                        waited,
                    });
                }
                thread::sleep(LOCK_RETRY_INTERVAL.min(timeout - waited));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Split an mbox into raw messages (envelope `From ` lines dropped,
/// `>From ` lines unescaped).
pub fn split_mbox(content: &str) -> Vec<String> {
    fn finish(messages: &mut Vec<String>, lines: Vec<&str>) {
        let text = lines.join("\n");
        let text = text.trim_end();
        if !text.trim().is_empty() {
            messages.push(format!("{}\n", text));
        }
    }

    let mut messages = Vec::new();
    let mut current: Option<Vec<&str>> = None;
    let mut after_blank = true;

    for line in content.lines() {
        if after_blank && line.starts_with("From ") {
            if let Some(lines) = current.take() {
                finish(&mut messages, lines);
            }
            current = Some(Vec::new());
        } else {
            let unescaped = if line.starts_with('>') && line.trim_start_matches('>').starts_with("From ") {
                &line[1..]
            } else {
                line
            };
            current.get_or_insert_with(Vec::new).push(unescaped);
        }
        after_blank = line.is_empty();
    }
    if let Some(lines) = current {
        finish(&mut messages, lines);
    }
    messages
}

pub struct MailboxPoller {
    path: Option<PathBuf>,
    lock_timeout: Duration,
    parser: Arc<dyn BugmailParser>,
}

impl MailboxPoller {
    /// A poller for `path`; without a path every poll is a no-op.
    pub fn new(path: Option<PathBuf>, lock_timeout: Duration, parser: Arc<dyn BugmailParser>) -> Self {
        Self {
            path,
            lock_timeout,
            parser,
        }
    }

    /// Read and parse every message, then empty the mailbox.
    pub fn drain(&self) -> Result<Vec<Bugmail>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };

        let mut file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Mailbox does not exist yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        lock_with_timeout(&file, path, self.lock_timeout)?;
        debug!(path = %path.display(), "Polling mailbox");

        let result = self.read_and_truncate(&mut file);
        if let Err(e) = file.unlock() {
            warn!(path = %path.display(), error = %e, "Failed to unlock mailbox");
        }
        result
    }

    fn read_and_truncate(&self, file: &mut File) -> Result<Vec<Bugmail>> {
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let content = String::from_utf8_lossy(&raw);

        let messages = split_mbox(&content);
        let mut bugmails = Vec::new();
        for message in &messages {
            match self.parser.parse(message) {
                Ok(bugmail) => bugmails.push(bugmail),
                Err(ParseError::NotBugmail) => continue,
                Err(ParseError::Fatal(reason)) => return Err(RelayError::ParseFatal(reason)),
            }
        }
        debug!(messages = messages.len(), bugmails = bugmails.len(), "Mailbox read");

        file.set_len(0)?;
        Ok(bugmails)
    }

    /// One poll cycle: drain the mailbox and announce the batch.
    pub fn poll(&self, engine: &Mutex<NotificationEngine>) -> Result<usize> {
        let bugmails = self.drain()?;
        if bugmails.is_empty() {
            return Ok(0);
        }
        let mut engine = engine.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(engine.handle_batch(&bugmails))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bugmail::HeaderBugmailParser;
    use std::fs;
    use tempfile::TempDir;

    const MBOX: &str = "From bugzilla@example.org Mon Jan  1 00:00:00 2024
Subject: [Bug 42] Crash when saving
X-Bugzilla-Product: Widgets
X-Bugzilla-Type: changed

alice@example.org changed:

           What    |Removed                     |Added
----------------------------------------------------------------------------
             Status|NEW                         |ASSIGNED

From friend@example.org Mon Jan  1 00:01:00 2024
Subject: lunch?

>From the cafeteria, probably.

";

    #[test]
    fn test_split_mbox() {
        let messages = split_mbox(MBOX);
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Subject: [Bug 42]"));
        assert!(messages[1].contains("\nFrom the cafeteria"));
        // "From " inside a paragraph does not start a message
        assert_eq!(split_mbox("From a\nX: 1\n\nbody\nFrom b\n").len(), 1);
    }

    #[test]
    fn test_drain_parses_and_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bugs.mbox");
        fs::write(&path, MBOX).unwrap();

        let poller = MailboxPoller::new(
            Some(path.clone()),
            Duration::from_secs(1),
            Arc::new(HeaderBugmailParser::new()),
        );
        let bugmails = poller.drain().unwrap();

        assert_eq!(bugmails.len(), 1);
        assert_eq!(bugmails[0].bug_id, 42);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_no_mailbox_is_noop() {
        let poller = MailboxPoller::new(None, Duration::from_secs(1), Arc::new(HeaderBugmailParser::new()));
        assert!(poller.drain().unwrap().is_empty());

        let dir = TempDir::new().unwrap();
        let poller = MailboxPoller::new(
            Some(dir.path().join("missing.mbox")),
            Duration::from_secs(1),
            Arc::new(HeaderBugmailParser::new()),
        );
        assert!(poller.drain().unwrap().is_empty());
    }

    #[test]
    fn test_lock_timeout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bugs.mbox");
        fs::write(&path, MBOX).unwrap();

        let holder = File::open(&path).unwrap();
        holder.lock_exclusive().unwrap();

        let poller = MailboxPoller::new(
            Some(path.clone()),
            Duration::from_millis(200),
            Arc::new(HeaderBugmailParser::new()),
        );
        let err = poller.drain().unwrap_err();
        assert!(matches!(err, RelayError::LockTimeout { .. }));
        // untouched
        assert_eq!(fs::read_to_string(&path).unwrap(), MBOX);

        FileExt::unlock(&holder).unwrap();
    }
}
