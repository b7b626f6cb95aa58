//! Bugzilla query client
//!
//! Bugs come from `show_bug.cgi?ctype=xml`. Attachments have no XML lookup
//! by id, so they resolve in two phases: scrape the owning bug id out of the
//! `attachment.cgi?action=edit` page title, then read the owning bug's XML
//! and keep the requested attachments.

use regex::Regex;
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// How much of an attachment edit page to read when looking for its title.
pub const ATTACH_TITLE_SIZE: u64 = 512;

/// Bulk fields never requested from show_bug.cgi.
const EXCLUDED_FIELDS: &[&str] = &["long_desc", "attachmentdata"];

/// Tracker-reported reason a bug could not be returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BugErrorKind {
    NotFound,
    NotPermitted,
    Other(String),
}

impl BugErrorKind {
    fn from_attribute(value: &str) -> Self {
        match value {
            "NotFound" => BugErrorKind::NotFound,
            "NotPermitted" => BugErrorKind::NotPermitted,
            other => BugErrorKind::Other(other.to_string()),
        }
    }

    /// User-facing sentence for a bug error; `reference` is a URL or id.
    pub fn describe(&self, reference: &str) -> String {
        match self {
            BugErrorKind::NotFound => format!("Bug {} was not found.", reference),
            BugErrorKind::NotPermitted => format!("Bug {} is not accessible.", reference),
            BugErrorKind::Other(kind) => {
                format!("Bug {} could not be retrieved: {}", reference, kind)
            }
        }
    }
}

/// Attachment metadata from a bug's XML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub attach_id: u64,
    pub is_patch: bool,
    fields: BTreeMap<String, String>,
}

impl AttachmentRecord {
    pub fn new(attach_id: u64, is_patch: bool) -> Self {
        Self {
            attach_id,
            is_patch,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Field value; `type` reads as `patch` for patches.
    pub fn get(&self, field: &str) -> Option<String> {
        let value = self.fields.get(field)?;
        if field == "type" && self.is_patch {
            return Some("patch".to_string());
        }
        Some(value.clone())
    }

    /// Comma-joined values of `fields`, skipping absent ones.
    pub fn summary(&self, fields: &[String]) -> String {
        fields
            .iter()
            .filter_map(|f| self.get(f))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Field values of one bug.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BugFields {
    pub bug_id: String,
    fields: BTreeMap<String, String>,
    pub attachments: Vec<AttachmentRecord>,
}

impl BugFields {
    pub fn new(bug_id: impl Into<String>) -> Self {
        Self {
            bug_id: bug_id.into(),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, attachment: AttachmentRecord) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Field value; `bug_status` includes the resolution when there is one.
    pub fn get(&self, field: &str) -> Option<String> {
        let value = self.fields.get(field)?;
        if field == "bug_status" {
            if let Some(resolution) = self.fields.get("resolution").filter(|r| !r.is_empty()) {
                return Some(format!("{} {}", value, resolution));
            }
        }
        Some(value.clone())
    }

    pub fn summary(&self, fields: &[String]) -> String {
        fields
            .iter()
            .filter_map(|f| self.get(f))
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Attachments of this bug whose id is in `ids`, in bug order.
    pub fn attachments_in(&self, ids: &[u64]) -> Vec<&AttachmentRecord> {
        self.attachments
            .iter()
            .filter(|a| ids.contains(&a.attach_id))
            .collect()
    }
}

/// One `<bug>` element: either an error or the bug's fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BugRecord {
    Error { bug_id: String, kind: BugErrorKind },
    Found(BugFields),
}

impl BugRecord {
    pub fn bug_id(&self) -> &str {
        match self {
            BugRecord::Error { bug_id, .. } => bug_id,
            BugRecord::Found(fields) => &fields.bug_id,
        }
    }
}

/// Outcome of a QuickSearch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchOutcome {
    /// Matching bug ids.
    Bugs(Vec<String>),
    /// The tracker answered with a bug page: the terms were a bug alias.
    SingleBug,
}

/// The remote bug tracker.
pub trait BugTracker: Send + Sync {
    /// One batched query for `ids`. An empty `fields` requests every field.
    fn fetch_bugs(&self, base_url: &str, ids: &[String], fields: &[String]) -> Result<Vec<BugRecord>>;

    /// The first [`ATTACH_TITLE_SIZE`] bytes of an attachment's edit page.
    fn attachment_page(&self, base_url: &str, attach_id: u64) -> Result<String>;

    fn quicksearch(&self, base_url: &str, query: &str, limit: Option<usize>) -> Result<SearchOutcome>;
}

/// HTTP implementation of [`BugTracker`].
pub struct TrackerClient {
    client: Client,
}

impl TrackerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("bugzilla-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RelayError::Config(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn get(&self, url: &str, params: &[(&str, String)]) -> Result<reqwest::blocking::Response> {
        debug!(url = %url, params = ?params, "Querying tracker");
        self.client
            .get(url)
            .query(params)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|source| RelayError::Http {
                url: url.to_string(),
                source,
            })
    }

    fn get_text(&self, url: &str, params: &[(&str, String)]) -> Result<String> {
        let body = self.get(url, params)?.text().map_err(|source| RelayError::Http {
            url: url.to_string(),
            source,
        })?;
        if body.trim().is_empty() {
            return Err(RelayError::FetchEmpty(url.to_string()));
        }
        Ok(body)
    }
}

impl BugTracker for TrackerClient {
    fn fetch_bugs(&self, base_url: &str, ids: &[String], fields: &[String]) -> Result<Vec<BugRecord>> {
        let url = format!("{}/show_bug.cgi", base_url);
        let xml = self.get_text(&url, &bug_query_params(ids, fields))?;
        parse_bug_xml(&xml)
    }

    fn attachment_page(&self, base_url: &str, attach_id: u64) -> Result<String> {
        let url = format!("{}/attachment.cgi", base_url);
        let response = self.get(&url, &attachment_page_params(attach_id))?;

        let mut prefix = Vec::new();
        response.take(ATTACH_TITLE_SIZE).read_to_end(&mut prefix)?;
        Ok(String::from_utf8_lossy(&prefix).into_owned())
    }

    fn quicksearch(&self, base_url: &str, query: &str, limit: Option<usize>) -> Result<SearchOutcome> {
        let url = format!("{}/buglist.cgi", base_url);
        let csv = self.get_text(&url, &quicksearch_params(query, limit))?;
        Ok(parse_quicksearch(&csv))
    }
}

/// Query string for `show_bug.cgi`. With an explicit field list, `bug_id`
/// and `resolution` are always requested too.
pub fn bug_query_params(ids: &[String], fields: &[String]) -> Vec<(&'static str, String)> {
    let mut params = vec![("ctype", "xml".to_string())];
    params.extend(EXCLUDED_FIELDS.iter().map(|f| ("excludefield", f.to_string())));
    if !fields.is_empty() {
        params.push(("field", "bug_id".to_string()));
        params.push(("field", "resolution".to_string()));
        params.extend(fields.iter().map(|f| ("field", f.clone())));
    }
    params.extend(ids.iter().map(|id| ("id", id.clone())));
    params
}

pub fn attachment_page_params(attach_id: u64) -> Vec<(&'static str, String)> {
    vec![("id", attach_id.to_string()), ("action", "edit".to_string())]
}

pub fn quicksearch_params(query: &str, limit: Option<usize>) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("quicksearch", query.to_string()),
        ("ctype", "csv".to_string()),
        ("columnlist", "bug_id".to_string()),
    ];
    if let Some(limit) = limit {
        params.push(("limit", limit.to_string()));
    }
    params
}

/// Parse a `show_bug.cgi?ctype=xml` document.
pub fn parse_bug_xml(xml: &str) -> Result<Vec<BugRecord>> {
    let options = roxmltree::ParsingOptions {
        allow_dtd: true,
        ..roxmltree::ParsingOptions::default()
    };
    let doc = roxmltree::Document::parse_with_options(xml, options)?;

    Ok(doc
        .root_element()
        .children()
        .filter(|n| n.has_tag_name("bug"))
        .map(parse_bug)
        .collect())
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|c| c.has_tag_name(name))
        .and_then(|c| c.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Text of every element child, first occurrence wins.
fn element_fields(node: roxmltree::Node<'_, '_>, skip: &[&str]) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for child in node.children().filter(|c| c.is_element()) {
        let name = child.tag_name().name();
        if skip.contains(&name) {
            continue;
        }
        if let Some(text) = child.text().map(str::trim).filter(|t| !t.is_empty()) {
            fields.entry(name.to_string()).or_insert_with(|| text.to_string());
        }
    }
    fields
}

fn parse_bug(node: roxmltree::Node<'_, '_>) -> BugRecord {
    let bug_id = child_text(node, "bug_id").unwrap_or_default();

    if let Some(error) = node.attribute("error") {
        return BugRecord::Error {
            bug_id,
            kind: BugErrorKind::from_attribute(error),
        };
    }

    let attachments = node
        .children()
        .filter(|c| c.has_tag_name("attachment"))
        .filter_map(|a| {
            let attach_id = child_text(a, "attachid")?.parse().ok()?;
            Some(AttachmentRecord {
                attach_id,
                is_patch: a.attribute("ispatch") == Some("1"),
                fields: element_fields(a, &[]),
            })
        })
        .collect();

    BugRecord::Found(BugFields {
        bug_id,
        fields: element_fields(node, &["attachment", "long_desc"]),
        attachments,
    })
}

/// Interpret a `buglist.cgi?ctype=csv` answer.
pub fn parse_quicksearch(body: &str) -> SearchOutcome {
    if body.contains("DOCTYPE") {
        return SearchOutcome::SingleBug;
    }
    SearchOutcome::Bugs(
        body.lines()
            .skip(1)
            .map(|l| l.trim().trim_matches('"'))
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

fn title_pattern() -> &'static Regex {
    static TITLE: OnceLock<Regex> = OnceLock::new();
    TITLE.get_or_init(|| Regex::new(r"(?is)<title>(.*?)</title>").expect("static regex"))
}

fn owner_pattern() -> &'static Regex {
    static OWNER: OnceLock<Regex> = OnceLock::new();
    OWNER.get_or_init(|| Regex::new(r"(?i)Attachment.*bug (\d+)").expect("static regex"))
}

/// Owning bug id from the title of an attachment edit page.
pub fn owning_bug(page: &str) -> Option<String> {
    let title = title_pattern().captures(page)?;
    let title = title[1].split_whitespace().collect::<Vec<_>>().join(" ");
    owner_pattern().captures(&title).map(|c| c[1].to_string())
}

/// Attachment ids grouped by owning bug, in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachmentOwners {
    pub by_bug: Vec<(String, Vec<u64>)>,
    /// Ids whose page title did not name a bug.
    pub unresolved: Vec<u64>,
    /// Ids whose page could not be fetched.
    pub failed: Vec<(u64, String)>,
}

impl AttachmentOwners {
    fn add(&mut self, bug_id: String, attach_id: u64) {
        match self.by_bug.iter_mut().find(|(bug, _)| *bug == bug_id) {
            Some((_, ids)) => ids.push(attach_id),
            None => self.by_bug.push((bug_id, vec![attach_id])),
        }
    }
}

/// Phase one of attachment resolution: find each attachment's bug.
pub fn locate_attachments(tracker: &dyn BugTracker, base_url: &str, ids: &[u64]) -> AttachmentOwners {
    let mut owners = AttachmentOwners::default();
    for &attach_id in ids {
        match tracker.attachment_page(base_url, attach_id) {
            Ok(page) => match owning_bug(&page) {
                Some(bug_id) => owners.add(bug_id, attach_id),
                None => {
                    debug!(attach_id, "No owning bug in attachment page title");
                    owners.unresolved.push(attach_id);
                }
            },
            Err(e) => {
                warn!(attach_id, error = %e, "Failed to fetch attachment page");
                owners.failed.push((attach_id, e.to_string()));
            }
        }
    }
    owners
}

/// Result of resolving one requested attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentLookup {
    Found(AttachmentRecord),
    /// The attachment page did not reveal an owning bug.
    Inaccessible(u64),
    /// The owning bug itself is an error record.
    BugError { bug_id: String, kind: BugErrorKind },
    /// A remote call failed.
    Failed { reference: String, error: String },
}

/// Both phases of attachment resolution.
pub fn fetch_attachment_details(
    tracker: &dyn BugTracker,
    base_url: &str,
    ids: &[u64],
) -> Vec<AttachmentLookup> {
    let owners = locate_attachments(tracker, base_url, ids);
    let mut results: Vec<AttachmentLookup> = owners
        .unresolved
        .iter()
        .map(|&id| AttachmentLookup::Inaccessible(id))
        .chain(owners.failed.iter().map(|(id, error)| AttachmentLookup::Failed {
            reference: format!("Attachment {}", id),
            error: error.clone(),
        }))
        .collect();

    for (bug_id, attach_ids) in &owners.by_bug {
        debug!(bug_id = %bug_id, attachments = ?attach_ids, "Getting attachments on bug");
        match tracker.fetch_bugs(base_url, std::slice::from_ref(bug_id), &[]) {
            Ok(records) => match records.into_iter().next() {
                Some(BugRecord::Found(bug)) => results.extend(
                    bug.attachments_in(attach_ids)
                        .into_iter()
                        .cloned()
                        .map(AttachmentLookup::Found),
                ),
                Some(BugRecord::Error { kind, .. }) => results.push(AttachmentLookup::BugError {
                    bug_id: bug_id.clone(),
                    kind,
                }),
                None => results.push(AttachmentLookup::Failed {
                    reference: format!("Bug {}", bug_id),
                    error: "no bug in response".to_string(),
                }),
            },
            Err(e) => results.push(AttachmentLookup::Failed {
                reference: format!("Bug {}", bug_id),
                error: e.to_string(),
            }),
        }
    }
    results
}
