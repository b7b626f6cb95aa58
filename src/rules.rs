//! Watch-rule evaluation
//!
//! Decides per channel whether a bugmail is announced at all and which report
//! categories apply. Watch-lists match against a field snapshot that also
//! carries the value a field held before this notification, so a bug moved
//! out of a watched product is still announced to that product's channel.

use std::collections::BTreeMap;

use crate::bugmail::{canonical_field, Bugmail, Diff};
use crate::config::ChannelConfig;

/// Report category matching every change.
pub const ALL: &str = "All";
pub const NEW_BUG: &str = "newBug";
pub const NEW_ATTACHMENT: &str = "newAttach";

/// Field name → current value, then the removed value if it changed.
pub type FieldSnapshot = BTreeMap<String, Vec<String>>;

/// Build the field snapshot for a bugmail from its merged diffs.
pub fn field_snapshot(bugmail: &Bugmail, merged: &[Diff]) -> FieldSnapshot {
    bugmail
        .fields()
        .iter()
        .map(|(field, current)| {
            let mut values = vec![current.clone()];
            if let Some(diff) = merged.iter().find(|d| d.touches(field)) {
                if !diff.removed.is_empty() {
                    values.push(diff.removed.clone());
                }
            }
            (field.clone(), values)
        })
        .collect()
}

/// Report categories in effect for one channel and bugmail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSet {
    categories: Vec<String>,
}

impl ReportSet {
    pub fn new(categories: Vec<String>) -> Self {
        Self { categories }
    }

    pub fn contains(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    /// Whether a diff on field `what` is reported.
    pub fn allows(&self, what: &str) -> bool {
        self.contains(ALL)
            || (!what.is_empty() && (self.contains(what) || self.contains(canonical_field(what))))
    }

    /// [`Self::allows`] for a diff; attachment changes also match
    /// `Attachment <field>` (e.g. `Attachment Flags`).
    pub fn allows_diff(&self, diff: &Diff) -> bool {
        if self.allows(diff.what()) {
            return true;
        }
        diff.attachment.is_some()
            && !diff.what().is_empty()
            && self.contains(&format!("Attachment {}", diff.what()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchDecision {
    pub should_announce: bool,
    pub report: ReportSet,
}

/// Match the snapshot against the channel's watch-lists.
///
/// A matching field replaces the channel's report categories with the ones
/// configured on its rule (when it has any). Fields are visited in name
/// order, so the last matching rule wins.
pub fn evaluate(config: &ChannelConfig, snapshot: &FieldSnapshot) -> WatchDecision {
    let mut should_announce = false;
    let mut categories = config.reported_changes.clone();

    for (field, values) in snapshot {
        let Some(rule) = config.watched_items.fields.get(field) else {
            continue;
        };
        if values.iter().any(|v| rule.values.contains(v)) {
            should_announce = true;
            if !rule.reported_changes.is_empty() {
                categories = rule.reported_changes.clone();
            }
        }
    }

    if config.watched_items.all {
        should_announce = true;
    }

    WatchDecision {
        should_announce,
        report: ReportSet::new(categories),
    }
}
