//! In-memory collaborators for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bugzilla_relay::{
    AttachmentRecord, BugErrorKind, BugFields, BugRecord, BugTracker, ChatTransport, NotificationEngine,
    RelayConfig, RelayError, Result, SearchOutcome, SendResult,
};

pub const BASE: &str = "https://bugs.example.org";

/// Tracker answering from canned records.
#[derive(Default)]
pub struct MockTracker {
    bugs: HashMap<String, BugRecord>,
    pages: HashMap<u64, String>,
    search: Option<SearchOutcome>,
    failing: bool,
    pub calls: Mutex<Vec<String>>,
}

impl MockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bug(mut self, bug: BugFields) -> Self {
        self.bugs.insert(bug.bug_id.clone(), BugRecord::Found(bug));
        self
    }

    pub fn with_error(mut self, bug_id: &str, kind: BugErrorKind) -> Self {
        self.bugs.insert(
            bug_id.to_string(),
            BugRecord::Error {
                bug_id: bug_id.to_string(),
                kind,
            },
        );
        self
    }

    /// Attachment `attach_id` lives on `bug_id`.
    pub fn with_attachment_page(mut self, attach_id: u64, bug_id: &str) -> Self {
        self.pages.insert(
            attach_id,
            format!("<html><head><title>Edit Attachment {} for bug {}</title>", attach_id, bug_id),
        );
        self
    }

    pub fn with_search(mut self, outcome: SearchOutcome) -> Self {
        self.search = Some(outcome);
        self
    }

    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl BugTracker for MockTracker {
    fn fetch_bugs(&self, base_url: &str, ids: &[String], _fields: &[String]) -> Result<Vec<BugRecord>> {
        self.calls.lock().unwrap().push(format!("bugs {}", ids.join(",")));
        if self.failing {
            return Err(RelayError::FetchEmpty(format!("{}/show_bug.cgi", base_url)));
        }
        Ok(ids
            .iter()
            .map(|id| {
                self.bugs.get(id).cloned().unwrap_or(BugRecord::Error {
                    bug_id: id.clone(),
                    kind: BugErrorKind::NotFound,
                })
            })
            .collect())
    }

    fn attachment_page(&self, _base_url: &str, attach_id: u64) -> Result<String> {
        self.calls.lock().unwrap().push(format!("page {}", attach_id));
        Ok(self
            .pages
            .get(&attach_id)
            .cloned()
            .unwrap_or_else(|| "<html><head><title>Invalid Attachment ID</title>".to_string()))
    }

    fn quicksearch(&self, _base_url: &str, query: &str, limit: Option<usize>) -> Result<SearchOutcome> {
        self.calls.lock().unwrap().push(format!("search {} {:?}", query, limit));
        Ok(self.search.clone().unwrap_or(SearchOutcome::Bugs(Vec::new())))
    }
}

/// Transport keeping every line it is given.
pub struct MemoryTransport {
    channels: Vec<String>,
    pub sent: Mutex<Vec<(String, String)>>,
}

impl MemoryTransport {
    pub fn new(channels: &[&str]) -> Self {
        Self {
            channels: channels.iter().map(|c| c.to_string()).collect(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn lines_for(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, l)| l.clone())
            .collect()
    }
}

impl ChatTransport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    fn joined_channels(&self) -> Vec<String> {
        self.channels.clone()
    }

    fn send(&self, channel: &str, line: &str) -> Result<SendResult> {
        self.sent.lock().unwrap().push((channel.to_string(), line.to_string()));
        Ok(SendResult::Sent)
    }
}

/// Config with plain (unformatted) lines, merged under `channels`.
pub fn config(channels: serde_json::Value) -> RelayConfig {
    let json = serde_json::json!({
        "defaults": {
            "bugzilla": BASE,
            "bug_format": ["product", "bug_status", "short_desc"],
            "format": { "bug": [], "attachment": [], "change": [] }
        },
        "channels": channels,
    });
    RelayConfig::from_json(&json.to_string()).unwrap()
}

pub fn bug_42() -> BugFields {
    BugFields::new("42")
        .with_field("product", "Widgets")
        .with_field("bug_status", "RESOLVED")
        .with_field("resolution", "FIXED")
        .with_field("short_desc", "Crash when saving")
        .with_attachment(
            AttachmentRecord::new(7, true)
                .with_field("type", "text/plain")
                .with_field("desc", "Fix v1")
                .with_field("filename", "fix.diff"),
        )
}

pub fn engine(
    config: RelayConfig,
    tracker: MockTracker,
    channels: &[&str],
) -> (NotificationEngine, Arc<MockTracker>, Arc<MemoryTransport>) {
    let tracker = Arc::new(tracker);
    let transport = Arc::new(MemoryTransport::new(channels));
    let engine = NotificationEngine::new(Arc::new(config), tracker.clone(), transport.clone());
    (engine, tracker, transport)
}
