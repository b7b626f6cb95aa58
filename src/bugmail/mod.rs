//! Bugmail model - one decoded Bugzilla change notification
//!
//! A [`Bugmail`] is produced by a [`BugmailParser`] and only read by the
//! rest of the crate. Rendering never mutates it; reclassification (the
//! merged Status/Resolution view) produces new [`Diff`] values.

pub mod parser;

pub use parser::HeaderBugmailParser;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fields whose values are lists; their diffs render as added/removed clauses.
pub const MULTI_FIELDS: &[&str] = &[
    "CC",
    "Keywords",
    "Depends on",
    "Blocks",
    "See Also",
    "Group",
    "BugsThisDependsOn",
    "OtherBugsDependingOnThis",
];

/// Marker Bugzilla puts in the Resolution when a bug is closed as a duplicate.
pub const DUPLICATE_MARKER: &str = "DUPLICATE";

/// One flag in a flag change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pub name: String,
    pub requestee: Option<String>,
}

impl Flag {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requestee: None,
        }
    }

    pub fn requested_from(name: impl Into<String>, requestee: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requestee: Some(requestee.into()),
        }
    }
}

/// Flag changes grouped by status symbol (`+`, `-`, `cancelled`, `?`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagChanges {
    /// `+`
    pub granted: Vec<Flag>,
    /// `-`
    pub denied: Vec<Flag>,
    /// removed without replacement
    pub cancelled: Vec<Flag>,
    /// `?`
    pub requested: Vec<Flag>,
}

impl FlagChanges {
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty()
            && self.denied.is_empty()
            && self.cancelled.is_empty()
            && self.requested.is_empty()
    }
}

/// One field-level (or flag-level) change inside a bugmail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    /// Display name of the field; `None` for flag-only diffs.
    pub what: Option<String>,
    pub added: String,
    pub removed: String,
    /// Attachment id this change concerns.
    pub attachment: Option<u64>,
    pub flags: Option<FlagChanges>,
}

impl Diff {
    pub fn new(what: impl Into<String>, removed: impl Into<String>, added: impl Into<String>) -> Self {
        Self {
            what: Some(what.into()),
            added: added.into(),
            removed: removed.into(),
            attachment: None,
            flags: None,
        }
    }

    pub fn flags(flags: FlagChanges) -> Self {
        Self {
            flags: Some(flags),
            ..Self::default()
        }
    }

    pub fn on_attachment(mut self, attach_id: u64) -> Self {
        self.attachment = Some(attach_id);
        self
    }

    pub fn what(&self) -> &str {
        self.what.as_deref().unwrap_or("")
    }

    /// Internal field name of this diff.
    pub fn field(&self) -> &str {
        canonical_field(self.what())
    }

    /// Whether this diff touches `field` (display name or internal name).
    pub fn touches(&self, field: &str) -> bool {
        self.what.is_some() && self.field() == canonical_field(field)
    }
}

/// Map a bugmail display name to the internal Bugzilla field name.
pub fn canonical_field(display: &str) -> &str {
    match display {
        "Status" => "bug_status",
        "Resolution" => "resolution",
        "Product" => "product",
        "Component" => "component",
        "AssignedTo" | "Assignee" | "Assigned To" => "assigned_to",
        "Severity" => "bug_severity",
        "Priority" => "priority",
        "Keywords" => "keywords",
        "Target Milestone" | "Target_Milestone" | "TargetMilestone" => "target_milestone",
        "Summary" => "short_desc",
        "Classification" => "classification",
        "CC" => "cc",
        "ReportedBy" | "Reporter" => "reporter",
        "Version" => "version",
        "OS/Version" | "OS" => "op_sys",
        "Platform" => "rep_platform",
        other => other,
    }
}

/// A decoded change notification for one bug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bugmail {
    pub bug_id: u64,
    pub changer: String,
    /// The bug was just filed.
    pub new: bool,
    /// The notification is about a new attachment.
    pub attach_id: Option<u64>,
    /// The bug was just marked a duplicate of this one.
    pub dupe_of: Option<u64>,
    fields: BTreeMap<String, String>,
    diffs: Vec<Diff>,
}

impl Bugmail {
    pub fn new(bug_id: u64, changer: impl Into<String>) -> Self {
        Self {
            bug_id,
            changer: changer.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_diff(mut self, diff: Diff) -> Self {
        self.diffs.push(diff);
        self
    }

    pub fn mark_new(mut self) -> Self {
        self.new = true;
        self
    }

    pub fn with_attachment(mut self, attach_id: u64) -> Self {
        self.attach_id = Some(attach_id);
        self
    }

    pub fn with_dupe_of(mut self, dupe_of: u64) -> Self {
        self.dupe_of = Some(dupe_of);
        self
    }

    /// Current field values, keyed by internal field name.
    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn diffs(&self) -> &[Diff] {
        &self.diffs
    }

    /// Diffs touching `field`, in notification order.
    pub fn changed(&self, field: &str) -> Vec<&Diff> {
        self.diffs.iter().filter(|d| d.touches(field)).collect()
    }

    /// Values available to message templates.
    pub fn template_values(&self) -> BTreeMap<String, String> {
        let mut values = self.fields.clone();
        values.insert("bug_id".to_string(), self.bug_id.to_string());
        values.insert("changer".to_string(), self.changer.clone());
        if let Some(attach_id) = self.attach_id {
            values.insert("attach_id".to_string(), attach_id.to_string());
        }
        if let Some(dupe_of) = self.dupe_of {
            values.insert("dupe_of".to_string(), dupe_of.to_string());
        }
        values
    }

    /// Diffs with the Resolution text folded into the Status diff.
    ///
    /// When both fields changed, the Status diff's added/removed gain the
    /// Resolution's added/removed (space separated). Otherwise the diffs are
    /// returned as they are.
    pub fn merged_diffs(&self) -> Vec<Diff> {
        let mut diffs = self.diffs.clone();
        let status = diffs.iter().position(|d| d.touches("bug_status"));
        let resolution = self.diffs.iter().find(|d| d.touches("resolution"));

        if let (Some(idx), Some(resolution)) = (status, resolution) {
            let merged = &mut diffs[idx];
            if !resolution.added.is_empty() {
                merged.added = format!("{} {}", merged.added, resolution.added);
            }
            if !resolution.removed.is_empty() {
                merged.removed = format!("{} {}", merged.removed, resolution.removed);
            }
        }
        diffs
    }

    /// Both Status and Resolution changed in this notification.
    pub fn status_and_resolution_changed(&self) -> bool {
        !self.changed("bug_status").is_empty() && !self.changed("resolution").is_empty()
    }
}

/// Why a parser did not produce a bugmail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Not a change notification; the message is skipped.
    NotBugmail,
    /// Unexpected failure; aborts the poll cycle.
    Fatal(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::NotBugmail => write!(f, "not a bugmail"),
            ParseError::Fatal(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decodes one raw mailbox message into a [`Bugmail`].
pub trait BugmailParser: Send + Sync {
    fn parse(&self, raw: &str) -> Result<Bugmail, ParseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn closed_bug() -> Bugmail {
        Bugmail::new(42, "alice")
            .with_field("bug_status", "RESOLVED")
            .with_diff(Diff::new("Status", "NEW", "RESOLVED"))
            .with_diff(Diff::new("Resolution", "", "FIXED"))
    }

    #[test]
    fn test_changed_matches_display_and_internal_names() {
        let bm = closed_bug();
        assert_eq!(bm.changed("Status").len(), 1);
        assert_eq!(bm.changed("bug_status").len(), 1);
        assert_eq!(bm.changed("resolution").len(), 1);
        assert!(bm.changed("product").is_empty());
    }

    #[test]
    fn test_merged_diffs_folds_resolution_into_status() {
        let bm = closed_bug();
        let merged = bm.merged_diffs();

        assert_eq!(merged[0].added, "RESOLVED FIXED");
        assert_eq!(merged[0].removed, "NEW");
        // source diffs untouched
        assert_eq!(bm.diffs()[0].added, "RESOLVED");
    }

    #[test]
    fn test_internal_names_match_and_merge() {
        let bm = Bugmail::new(42, "alice")
            .with_diff(Diff::new("bug_status", "NEW", "RESOLVED"))
            .with_diff(Diff::new("resolution", "", "FIXED"));

        assert_eq!(bm.changed("Status").len(), 1);
        assert_eq!(bm.changed("Resolution").len(), 1);
        assert!(bm.status_and_resolution_changed());
        assert_eq!(bm.merged_diffs()[0].added, "RESOLVED FIXED");
        assert_eq!(bm.diffs()[0].field(), "bug_status");
    }

    #[test]
    fn test_merged_diffs_reopened_bug_keeps_old_resolution() {
        let bm = Bugmail::new(7, "bob")
            .with_diff(Diff::new("Status", "RESOLVED", "REOPENED"))
            .with_diff(Diff::new("Resolution", "FIXED", ""));
        let merged = bm.merged_diffs();
        assert_eq!(merged[0].removed, "RESOLVED FIXED");
        assert_eq!(merged[0].added, "REOPENED");
    }

    #[test]
    fn test_merged_diffs_without_resolution_is_identity() {
        let bm = Bugmail::new(1, "x").with_diff(Diff::new("Status", "NEW", "ASSIGNED"));
        assert_eq!(bm.merged_diffs(), bm.diffs().to_vec());
        assert!(!bm.status_and_resolution_changed());
    }

    #[test]
    fn test_template_values_include_identity() {
        let bm = closed_bug().with_attachment(9);
        let values = bm.template_values();
        assert_eq!(values["bug_id"], "42");
        assert_eq!(values["changer"], "alice");
        assert_eq!(values["attach_id"], "9");
        assert!(!values.contains_key("dupe_of"));
    }
}
