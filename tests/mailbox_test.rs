//! Mailbox polling end to end

mod common;

use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bugzilla_relay::{
    Bugmail, BugmailParser, HeaderBugmailParser, MailboxPoller, ParseError, RelayError,
};
use common::{bug_42, config, engine, MockTracker};
use serde_json::json;
use tempfile::TempDir;

const MBOX: &str = "\
From bugzilla-daemon@example.org Tue Mar  5 10:00:00 2024
From: bugzilla-daemon@example.org
Subject: [Bug 42] Crash when saving
X-Bugzilla-Type: changed
X-Bugzilla-Product: Widgets
X-Bugzilla-Status: RESOLVED

https://bugs.example.org/show_bug.cgi?id=42

alice changed:

           What    |Removed                     |Added
----------------------------------------------------------------------------
             Status|NEW                         |RESOLVED
         Resolution|                            |FIXED

From someone@example.org Tue Mar  5 10:05:00 2024
From: someone@example.org
Subject: Re: lunch

see you there

From bugzilla-daemon@example.org Tue Mar  5 10:06:00 2024
From: bugzilla-daemon@example.org
Subject: [Bug 42] Crash when saving
X-Bugzilla-Type: request
X-Bugzilla-Product: Widgets

alice has granted bob's request for review
";

fn write_mbox(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("bugzilla.mbox");
    fs::write(&path, MBOX).unwrap();
    path
}

#[test]
fn test_poll_announces_and_empties_mailbox() {
    let dir = TempDir::new().unwrap();
    let path = write_mbox(&dir);

    let channels = json!({
        "#widgets": {
            "watched_items": { "fields": { "product": { "values": ["Widgets"] } } }
        }
    });
    let (engine, _, transport) = engine(config(channels), MockTracker::new().with_bug(bug_42()), &["#widgets"]);
    let engine = Mutex::new(engine);

    let poller = MailboxPoller::new(Some(path.clone()), Duration::from_secs(1), Arc::new(HeaderBugmailParser::new()));
    let sent = poller.poll(&engine).unwrap();

    assert_eq!(sent, 2);
    assert_eq!(
        transport.lines_for("#widgets")[0],
        "alice changed the Status on bug 42 from NEW to RESOLVED FIXED."
    );
    assert_eq!(fs::read_to_string(&path).unwrap(), "");

    // nothing left for the next cycle
    assert_eq!(poller.poll(&engine).unwrap(), 0);
}

struct ExplodingParser;

impl BugmailParser for ExplodingParser {
    fn parse(&self, raw: &str) -> Result<Bugmail, ParseError> {
        if raw.contains("lunch") {
            return Err(ParseError::Fatal("unexpected encoding".to_string()));
        }
        HeaderBugmailParser::new().parse(raw)
    }
}

#[test]
fn test_fatal_parse_error_keeps_mailbox() {
    let dir = TempDir::new().unwrap();
    let path = write_mbox(&dir);
    let (engine, _, transport) = engine(config(json!({})), MockTracker::new(), &["#widgets"]);
    let engine = Mutex::new(engine);

    let poller = MailboxPoller::new(Some(path.clone()), Duration::from_secs(1), Arc::new(ExplodingParser));
    let err = poller.poll(&engine).unwrap_err();

    assert!(matches!(err, RelayError::ParseFatal(_)));
    assert_eq!(fs::read_to_string(&path).unwrap(), MBOX);
    assert!(transport.sent.lock().unwrap().is_empty());

    // the lock was released: a working parser can drain it now
    let poller = MailboxPoller::new(Some(path.clone()), Duration::from_secs(1), Arc::new(HeaderBugmailParser::new()));
    assert_eq!(poller.drain().unwrap().len(), 1);
}
