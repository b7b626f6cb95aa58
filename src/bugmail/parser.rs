//! Bugzilla notification mail decoder
//!
//! Reads the `X-Bugzilla-*` headers, the `[Bug N]` subject and the
//! `What |Removed |Added` change table of a raw RFC 822 message.

use regex::Regex;
use std::collections::BTreeMap;

use super::{canonical_field, Bugmail, BugmailParser, Diff, Flag, FlagChanges, ParseError};

/// Header → internal field name.
const HEADER_FIELDS: &[(&str, &str)] = &[
    ("x-bugzilla-product", "product"),
    ("x-bugzilla-component", "component"),
    ("x-bugzilla-keywords", "keywords"),
    ("x-bugzilla-severity", "bug_severity"),
    ("x-bugzilla-status", "bug_status"),
    ("x-bugzilla-priority", "priority"),
    ("x-bugzilla-assigned-to", "assigned_to"),
    ("x-bugzilla-target-milestone", "target_milestone"),
    ("x-bugzilla-classification", "classification"),
    ("x-bugzilla-reporter", "reporter"),
];

/// Default parser for Bugzilla change notification mail.
pub struct HeaderBugmailParser {
    subject: Regex,
    changer: Regex,
    attachment: Regex,
    duplicate: Regex,
    summary_line: Regex,
    attachment_row: Regex,
    flag: Regex,
}

impl HeaderBugmailParser {
    pub fn new() -> Self {
        Self {
            subject: Regex::new(r"(?s)^\s*\[Bug (\d+)\]\s*(New:\s*)?(.*)$").expect("static regex"),
            changer: Regex::new(r"(?m)^(.+?) changed:\s*$").expect("static regex"),
            attachment: Regex::new(r"Created (?:an )?attachment (?:\(id=)?(\d+)").expect("static regex"),
            duplicate: Regex::new(r"marked as a duplicate of(?: bug)? (\d+)").expect("static regex"),
            summary_line: Regex::new(r"^\s*([A-Za-z][A-Za-z/_ ]*?):\s+(.*?)\s*$").expect("static regex"),
            attachment_row: Regex::new(r"^Attachment #(\d+)\s+(.+)$").expect("static regex"),
            flag: Regex::new(r"^(?P<name>.+?)(?P<status>[?+\-])(?:\((?P<requestee>[^)]*)\))?$")
                .expect("static regex"),
        }
    }

    /// Split a raw message into lower-cased headers and the body.
    fn split_message(raw: &str) -> (BTreeMap<String, String>, String) {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        let mut last: Option<String> = None;
        let mut lines = raw.lines();

        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded header
                if let Some(value) = last.as_ref().and_then(|name| headers.get_mut(name)) {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim().to_lowercase();
                headers
                    .entry(name.clone())
                    .or_insert_with(|| value.trim().to_string());
                last = Some(name);
            }
        }

        let body: Vec<&str> = lines.collect();
        (headers, body.join("\n"))
    }

    /// Display name of a `Name <email>` string.
    fn display_name(who: &str) -> String {
        let who = who.trim();
        match who.find(" <") {
            Some(idx) if idx > 0 => who[..idx].trim().trim_matches('"').to_string(),
            _ => who.trim_matches(|c| c == '<' || c == '>').to_string(),
        }
    }

    /// Parse the `What |Removed |Added` table into diffs.
    fn parse_change_table(&self, body: &str) -> Vec<Diff> {
        let mut rows: Vec<(String, String, String)> = Vec::new();
        let mut in_table = false;

        for line in body.lines() {
            if !in_table {
                if line.contains("What") && line.contains("|Removed") && line.contains("|Added") {
                    in_table = true;
                }
                continue;
            }
            if line.starts_with("---") {
                continue;
            }
            let cols: Vec<&str> = line.splitn(3, '|').collect();
            if cols.len() < 3 {
                break;
            }
            let (what, removed, added) = (cols[0].trim(), cols[1].trim(), cols[2].trim());

            match rows.last_mut() {
                // wrapped value
                Some(prev) if what.is_empty() => {
                    append_wrapped(&mut prev.1, removed);
                    append_wrapped(&mut prev.2, added);
                }
                // wrapped field name
                Some(prev) if removed.is_empty() && added.is_empty() => {
                    prev.0.push(' ');
                    prev.0.push_str(what);
                }
                _ => rows.push((what.to_string(), removed.to_string(), added.to_string())),
            }
        }

        rows.into_iter()
            .map(|(what, removed, added)| self.build_diff(what, removed, added))
            .collect()
    }

    fn build_diff(&self, what: String, removed: String, added: String) -> Diff {
        let (what, attachment) = match self.attachment_row.captures(&what) {
            Some(caps) => (caps[2].to_string(), caps[1].parse().ok()),
            None => (what, None),
        };

        let flags = if what == "Flags" {
            Some(self.parse_flags(&removed, &added))
        } else {
            None
        };

        Diff {
            what: Some(what),
            added,
            removed,
            attachment,
            flags,
        }
    }

    /// `review?(bob), superreview+` style flag lists into flag changes.
    fn parse_flags(&self, removed: &str, added: &str) -> FlagChanges {
        let mut changes = FlagChanges::default();
        let mut added_names = Vec::new();

        for token in flag_tokens(added) {
            let Some(caps) = self.flag.captures(token) else { continue };
            let name = caps["name"].to_string();
            added_names.push(name.clone());
            match &caps["status"] {
                "+" => changes.granted.push(Flag::new(name)),
                "-" => changes.denied.push(Flag::new(name)),
                _ => changes.requested.push(Flag {
                    name,
                    requestee: caps
                        .name("requestee")
                        .map(|r| r.as_str().trim().to_string())
                        .filter(|r| !r.is_empty()),
                }),
            }
        }

        for token in flag_tokens(removed) {
            let Some(caps) = self.flag.captures(token) else { continue };
            let name = caps["name"].to_string();
            if !added_names.contains(&name) {
                changes.cancelled.push(Flag::new(name));
            }
        }

        changes
    }

    /// `Key: Value` block at the top of a new-bug mail.
    fn parse_summary_block(&self, body: &str, fields: &mut BTreeMap<String, String>) {
        let block = body.split("\n\n").find(|block| {
            block
                .lines()
                .any(|l| l.starts_with(' ') && self.summary_line.is_match(l))
        });
        let Some(block) = block else { return };

        for line in block.lines() {
            let Some(caps) = self.summary_line.captures(line) else { continue };
            let name = canonical_field(caps[1].trim()).to_string();
            let value = caps[2].to_string();
            if !value.is_empty() {
                fields.entry(name).or_insert(value);
            }
        }
    }
}

impl Default for HeaderBugmailParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BugmailParser for HeaderBugmailParser {
    fn parse(&self, raw: &str) -> Result<Bugmail, ParseError> {
        let (headers, body) = Self::split_message(raw);

        if !headers.keys().any(|k| k.starts_with("x-bugzilla-")) {
            return Err(ParseError::NotBugmail);
        }
        let mail_type = headers
            .get("x-bugzilla-type")
            .map(|t| t.to_lowercase())
            .unwrap_or_default();
        if mail_type == "request" {
            return Err(ParseError::NotBugmail);
        }

        let subject = headers.get("subject").ok_or(ParseError::NotBugmail)?;
        let caps = self.subject.captures(subject).ok_or(ParseError::NotBugmail)?;
        let bug_id: u64 = caps[1].parse().map_err(|_| ParseError::NotBugmail)?;
        let is_new = mail_type == "new" || caps.get(2).is_some();

        let mut fields = BTreeMap::new();
        let summary = caps[3].trim();
        if !summary.is_empty() {
            fields.insert("short_desc".to_string(), summary.to_string());
        }
        for (header, field) in HEADER_FIELDS {
            if let Some(value) = headers.get(*header).filter(|v| !v.is_empty()) {
                fields.insert(field.to_string(), value.clone());
            }
        }
        if is_new {
            self.parse_summary_block(&body, &mut fields);
        }

        let changer = self
            .changer
            .captures(&body)
            .map(|c| Self::display_name(&c[1]))
            .or_else(|| headers.get("x-bugzilla-who").map(|w| Self::display_name(w)))
            .unwrap_or_default();

        let mut bugmail = Bugmail::new(bug_id, changer);
        bugmail.new = is_new;
        bugmail.attach_id = self.attachment.captures(&body).and_then(|c| c[1].parse().ok());
        bugmail.dupe_of = self.duplicate.captures(&body).and_then(|c| c[1].parse().ok());
        bugmail.fields = fields;
        bugmail.diffs = self.parse_change_table(&body);

        Ok(bugmail)
    }
}

fn append_wrapped(target: &mut String, piece: &str) {
    if piece.is_empty() {
        return;
    }
    if !target.is_empty() && !target.ends_with(',') && !target.ends_with('-') {
        target.push(' ');
    }
    target.push_str(piece);
}

fn flag_tokens(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHANGED: &str = "\
From: bugzilla-daemon@example.org
To: dev@example.org
Subject: [Bug 42] Crash when saving
X-Bugzilla-Type: changed
X-Bugzilla-Product: Widgets
X-Bugzilla-Component: Editor
X-Bugzilla-Status: RESOLVED
X-Bugzilla-Who: alice@example.org

https://bugs.example.org/show_bug.cgi?id=42

Alice Smith <alice@example.org> changed:

           What    |Removed                     |Added
----------------------------------------------------------------------------
             Status|NEW                         |RESOLVED
         Resolution|                            |FIXED
                 CC|                            |bob@example.org,
                   |                            |carol@example.org
  Attachment #7 Flags|review?(bob)                |review+, sr?
";

    #[test]
    fn test_parse_changed_mail() {
        let bm = HeaderBugmailParser::new().parse(CHANGED).unwrap();

        assert_eq!(bm.bug_id, 42);
        assert_eq!(bm.changer, "Alice Smith");
        assert!(!bm.new);
        assert_eq!(bm.fields()["product"], "Widgets");
        assert_eq!(bm.fields()["short_desc"], "Crash when saving");

        let diffs = bm.diffs();
        assert_eq!(diffs.len(), 4);
        assert_eq!(diffs[0], Diff::new("Status", "NEW", "RESOLVED"));
        assert_eq!(diffs[2].added, "bob@example.org,carol@example.org");
    }

    #[test]
    fn test_parse_attachment_flags() {
        let bm = HeaderBugmailParser::new().parse(CHANGED).unwrap();
        let flags_diff = &bm.diffs()[3];

        assert_eq!(flags_diff.what(), "Flags");
        assert_eq!(flags_diff.attachment, Some(7));
        let flags = flags_diff.flags.as_ref().unwrap();
        assert_eq!(flags.granted, vec![Flag::new("review")]);
        assert_eq!(flags.requested, vec![Flag::new("sr")]);
        assert!(flags.cancelled.is_empty());
    }

    #[test]
    fn test_parse_flags_cancelled_and_hyphenated_names() {
        let parser = HeaderBugmailParser::new();
        let flags = parser.parse_flags("approval-1.9?, review?(bob)", "approval-1.9-");
        assert_eq!(flags.denied, vec![Flag::new("approval-1.9")]);
        assert_eq!(flags.cancelled, vec![Flag::new("review")]);

        let flags = parser.parse_flags("", "review?(bob@example.org)");
        assert_eq!(
            flags.requested,
            vec![Flag::requested_from("review", "bob@example.org")]
        );
    }

    #[test]
    fn test_parse_new_bug_mail() {
        let raw = "\
Subject: [Bug 10] New: Toolbar icons are blurry
X-Bugzilla-Type: new
X-Bugzilla-Product: Widgets

https://bugs.example.org/show_bug.cgi?id=10

           Summary: Toolbar icons are blurry
           Product: Widgets
        ReportedBy: dave@example.org

Created an attachment (id=55)
";
        let bm = HeaderBugmailParser::new().parse(raw).unwrap();
        assert!(bm.new);
        assert_eq!(bm.fields()["reporter"], "dave@example.org");
        assert_eq!(bm.fields()["short_desc"], "Toolbar icons are blurry");
        assert_eq!(bm.attach_id, Some(55));
        assert!(bm.diffs().is_empty());
    }

    #[test]
    fn test_duplicate_target_detected() {
        let raw = "\
Subject: [Bug 3] Old crash
X-Bugzilla-Type: changed

*** This bug has been marked as a duplicate of bug 2 ***
";
        let bm = HeaderBugmailParser::new().parse(raw).unwrap();
        assert_eq!(bm.dupe_of, Some(2));
    }

    #[test]
    fn test_non_bugzilla_mail_is_skipped() {
        let parser = HeaderBugmailParser::new();
        assert_eq!(
            parser.parse("Subject: lunch?\n\nanyone?\n"),
            Err(ParseError::NotBugmail)
        );
        assert_eq!(
            parser.parse("Subject: [Bug 5] x\nX-Bugzilla-Type: request\n\nbody\n"),
            Err(ParseError::NotBugmail)
        );
    }
}
