//! Notification engine
//!
//! Turns bugmail batches and on-demand queries into formatted channel lines.
//! For every bugmail and every joined channel it evaluates the watch rules,
//! renders the reported diffs, then appends bug, duplicate-target and
//! attachment details that are not within the channel's dedup cooldown.
//! Failures stay local to one channel and one fetch; they become lines.

use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info, warn};

use crate::bugmail::Bugmail;
use crate::config::{ChannelConfig, ConfigStore, LineKind};
use crate::dedup::{DedupRegistry, EntityKind};
use crate::format::{format_line, render_template};
use crate::render::{render_diff, RenderContext};
use crate::rules::{self, NEW_ATTACHMENT, NEW_BUG};
use crate::snarf::find_references;
use crate::tracker::{fetch_attachment_details, AttachmentLookup, BugRecord, BugTracker, SearchOutcome};
use crate::transport::{ChatTransport, SendResult};

fn id_separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"(?i)[!?.,()\s]+|\band\b|\bbug\b").expect("static regex"))
}

/// Split free text such as `"12, 15 and bug 20"` into bug ids or aliases.
pub fn parse_bug_ids(text: &str) -> Vec<String> {
    id_separator()
        .split(text)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn fetch_error_line(reference: &str, error: &impl std::fmt::Display) -> String {
    format!("{} could not be retrieved: {}", reference, error)
}

fn formatted(config: &ChannelConfig, kind: LineKind, lines: Vec<String>) -> Vec<String> {
    let directives = config.format.for_kind(kind);
    lines.into_iter().map(|l| format_line(&l, directives)).collect()
}

pub struct NotificationEngine {
    config: Arc<dyn ConfigStore>,
    tracker: Arc<dyn BugTracker>,
    transport: Arc<dyn ChatTransport>,
    dedup: DedupRegistry,
}

impl NotificationEngine {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        tracker: Arc<dyn BugTracker>,
        transport: Arc<dyn ChatTransport>,
    ) -> Self {
        Self {
            config,
            tracker,
            transport,
            dedup: DedupRegistry::new(),
        }
    }

    /// Announce a batch in order. Returns the number of lines sent.
    pub fn handle_batch(&mut self, bugmails: &[Bugmail]) -> usize {
        let channels = self.transport.joined_channels();
        let mut sent = 0;

        for bugmail in bugmails {
            debug!(bug_id = bugmail.bug_id, changer = %bugmail.changer, "Handling bugmail");
            for channel in &channels {
                let lines = self.announcements_for(channel, bugmail);
                if !lines.is_empty() {
                    info!(channel = %channel, bug_id = bugmail.bug_id, lines = lines.len(), "Reporting changes");
                }
                sent += self.send_lines(channel, &lines);
            }
        }
        sent
    }

    /// Send lines to a channel; returns how many were delivered.
    pub fn send_lines(&self, channel: &str, lines: &[String]) -> usize {
        let mut sent = 0;
        for line in lines {
            match self.transport.send(channel, line) {
                Ok(SendResult::Sent) => sent += 1,
                Ok(SendResult::Skipped(reason)) => {
                    debug!(channel = %channel, reason = %reason, "Line skipped");
                }
                Ok(SendResult::Failed(reason)) => {
                    warn!(channel = %channel, transport = self.transport.name(), reason = %reason, "Send failed");
                }
                Err(e) => {
                    warn!(channel = %channel, transport = self.transport.name(), error = %e, "Send failed");
                }
            }
        }
        sent
    }

    /// Formatted lines announcing `bugmail` in `channel`, in output order.
    pub fn announcements_for(&mut self, channel: &str, bugmail: &Bugmail) -> Vec<String> {
        let config = self.config.channel(channel);
        let merged = bugmail.merged_diffs();

        let snapshot = rules::field_snapshot(bugmail, &merged);
        let decision = rules::evaluate(&config, &snapshot);
        if !decision.should_announce {
            debug!(channel = %channel, bug_id = bugmail.bug_id, "Not watched in channel");
            return Vec::new();
        }
        let report = decision.report;

        let values = bugmail.template_values();
        let mut changes = Vec::new();
        let mut attachments: Vec<u64> = Vec::new();

        if bugmail.new && report.contains(NEW_BUG) {
            changes.push(render_template(&config.messages.new_bug, &values));
        }
        if let Some(attach_id) = bugmail.attach_id {
            if report.contains(NEW_ATTACHMENT) {
                changes.push(render_template(&config.messages.new_attachment, &values));
                self.mark_attachment(channel, &config, attach_id, &mut attachments);
            }
        }

        // Status and Resolution both reported: one merged line, in Resolution's slot.
        let fold_status = report.allows("Resolution") && bugmail.status_and_resolution_changed();
        let merged_status = merged.iter().find(|d| d.touches("bug_status"));

        let ctx = RenderContext::new(&bugmail.changer, bugmail.bug_id)
            .with_dupe_of(bugmail.dupe_of)
            .with_no_requestee(&config.messages.no_requestee);

        for diff in &merged {
            if !report.allows_diff(diff) {
                continue;
            }
            if let Some(attach_id) = diff.attachment {
                self.mark_attachment(channel, &config, attach_id, &mut attachments);
            }

            let diff = match (fold_status, diff.field(), merged_status) {
                (true, "bug_status", _) => continue,
                (true, "resolution", Some(status)) => status,
                _ => diff,
            };
            changes.extend(render_diff(&ctx, diff));
        }

        if changes.is_empty() {
            return Vec::new();
        }

        let mut lines = formatted(&config, LineKind::Change, changes);

        let bug_id = bugmail.bug_id.to_string();
        if self.dedup.should_report(channel, EntityKind::Bug, &bug_id, config.cooldown()) {
            lines.extend(self.bug_details(&config, &[bug_id], true));
        }
        if let Some(dupe_of) = bugmail.dupe_of {
            let dupe_id = dupe_of.to_string();
            if self.dedup.should_report(channel, EntityKind::Bug, &dupe_id, config.cooldown()) {
                lines.extend(self.bug_details(&config, &[dupe_id], true));
            }
        }
        if !attachments.is_empty() {
            lines.extend(self.attachments_on_bug(&config, bugmail.bug_id, &attachments));
        }

        lines
    }

    fn mark_attachment(&mut self, channel: &str, config: &ChannelConfig, attach_id: u64, marked: &mut Vec<u64>) {
        if marked.contains(&attach_id) {
            return;
        }
        if self.dedup.should_report(channel, EntityKind::Attachment, &attach_id.to_string(), config.cooldown()) {
            marked.push(attach_id);
        }
    }

    /// Formatted summary lines for bugs, as for the `bug` command.
    pub fn bug_lines(&self, channel: &str, ids: &[String], show_url: bool) -> Vec<String> {
        let config = self.config.channel(channel);
        self.bug_details(&config, ids, show_url)
    }

    fn bug_details(&self, config: &ChannelConfig, ids: &[String], show_url: bool) -> Vec<String> {
        if ids.is_empty() {
            return Vec::new();
        }
        let base = config.base_url();
        let reference = |id: &str| {
            if show_url {
                format!("{}/show_bug.cgi?id={}", base, id)
            } else {
                id.to_string()
            }
        };

        let lines = match self.tracker.fetch_bugs(base, ids, &config.bug_format) {
            Ok(records) => records
                .iter()
                .enumerate()
                .map(|(idx, record)| {
                    let id = match record.bug_id() {
                        "" => ids.get(idx).map(String::as_str).unwrap_or(""),
                        id => id,
                    };
                    match record {
                        BugRecord::Found(bug) => {
                            let summary = bug.summary(&config.bug_format);
                            if show_url {
                                format!("Bug {} {}", reference(id), summary)
                            } else {
                                format!("Bug {}: {}", id, summary)
                            }
                        }
                        BugRecord::Error { kind, .. } => kind.describe(&reference(id)),
                    }
                })
                .collect(),
            Err(e) => {
                warn!(bugs = ?ids, error = %e, "Failed to fetch bugs");
                vec![fetch_error_line(&format!("Bug {}", ids.join(", ")), &e)]
            }
        };
        formatted(config, LineKind::Bug, lines)
    }

    /// Formatted attachment lines, resolving each attachment's bug first.
    pub fn attachment_lines(&self, channel: &str, ids: &[u64]) -> Vec<String> {
        let config = self.config.channel(channel);
        let base = config.base_url();

        let lines = fetch_attachment_details(self.tracker.as_ref(), base, ids)
            .into_iter()
            .map(|lookup| match lookup {
                AttachmentLookup::Found(attachment) => format!(
                    "Attachment {}/attachment.cgi?id={}&action=edit {}",
                    base,
                    attachment.attach_id,
                    attachment.summary(&config.attach_format)
                ),
                AttachmentLookup::Inaccessible(id) => {
                    format!("Attachment {} was not found or is not accessible.", id)
                }
                AttachmentLookup::BugError { bug_id, kind } => kind.describe(&bug_id),
                AttachmentLookup::Failed { reference, error } => fetch_error_line(&reference, &error),
            })
            .collect();
        formatted(&config, LineKind::Attachment, lines)
    }

    /// Attachment lines when the owning bug is already known. A bug error
    /// yields nothing; a failed fetch yields an error line.
    fn attachments_on_bug(&self, config: &ChannelConfig, bug_id: u64, ids: &[u64]) -> Vec<String> {
        let base = config.base_url();
        let lines = match self.tracker.fetch_bugs(base, &[bug_id.to_string()], &[]) {
            Ok(records) => match records.into_iter().next() {
                Some(BugRecord::Found(bug)) => bug
                    .attachments_in(ids)
                    .into_iter()
                    .map(|a| {
                        format!(
                            "Attachment {}/attachment.cgi?id={}&action=edit {}",
                            base,
                            a.attach_id,
                            a.summary(&config.attach_format)
                        )
                    })
                    .collect(),
                _ => Vec::new(),
            },
            Err(e) => {
                warn!(bug_id, attachments = ?ids, error = %e, "Failed to fetch attachments");
                vec![fetch_error_line(&format!("Attachments on bug {}", bug_id), &e)]
            }
        };
        formatted(config, LineKind::Attachment, lines)
    }

    /// QuickSearch `terms`, replying with a count or the matching bugs.
    pub fn query_lines(&self, channel: &str, terms: &str, total: bool) -> Vec<String> {
        let config = self.config.channel(channel);
        let query = format!("{} {}", terms, config.query_terms);
        let limit = (!total).then_some(config.query_result_limit);

        let ids = match self.tracker.quicksearch(config.base_url(), query.trim(), limit) {
            Ok(SearchOutcome::Bugs(ids)) => ids,
            Ok(SearchOutcome::SingleBug) => vec![terms.to_string()],
            Err(e) => {
                warn!(query = %query, error = %e, "QuickSearch failed");
                return vec![fetch_error_line(&format!("Query \"{}\"", terms), &e)];
            }
        };

        if ids.is_empty() {
            return vec![format!("No results for \"{}.\"", terms)];
        }
        if total {
            return vec![format!("{} results for \"{}.\"", ids.len(), terms)];
        }
        self.bug_details(&config, &ids, true)
    }

    /// Answer bug and attachment references in chat text, if the channel
    /// has the snarfer enabled. URL references bypass the cooldown.
    pub fn snarf(&mut self, channel: &str, text: &str) -> Vec<String> {
        let config = self.config.channel(channel);
        if !config.bug_snarfer {
            return Vec::new();
        }

        let refs = find_references(text);
        if refs.is_empty() {
            return Vec::new();
        }
        debug!(channel = %channel, refs = ?refs, "Snarfed references");

        let mut lines = self.bug_details(&config, &refs.url_bugs, false);

        let bugs: Vec<String> = refs
            .bugs
            .into_iter()
            .filter(|id| self.dedup.should_report(channel, EntityKind::Bug, id, config.cooldown()))
            .collect();
        lines.extend(self.bug_details(&config, &bugs, true));

        let attachments: Vec<u64> = refs
            .attachments
            .into_iter()
            .filter(|id| {
                self.dedup
                    .should_report(channel, EntityKind::Attachment, &id.to_string(), config.cooldown())
            })
            .collect();
        if !attachments.is_empty() {
            lines.extend(self.attachment_lines(channel, &attachments));
        }

        lines
    }
}

impl std::fmt::Debug for NotificationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationEngine")
            .field("transport", &self.transport.name())
            .field("dedup", &self.dedup)
            .finish()
    }
}
