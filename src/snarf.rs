//! Passive bug/attachment reference detection in chat text

use regex::Regex;
use std::sync::OnceLock;

fn reference_pattern() -> &'static Regex {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    REFERENCE.get_or_init(|| {
        Regex::new(r"(?i)\b(bug|attachment)\b[\s#]*(\d+)").expect("static regex")
    })
}

fn url_pattern() -> &'static Regex {
    static URL: OnceLock<Regex> = OnceLock::new();
    URL.get_or_init(|| Regex::new(r"(https?://\S+)/show_bug\.cgi\?id=(\w+)").expect("static regex"))
}

/// References found in one chat message, in order of appearance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    /// `bug N` / `bug #N` mentions.
    pub bugs: Vec<String>,
    /// `attachment N` mentions.
    pub attachments: Vec<u64>,
    /// Bug ids (or aliases) taken from `show_bug.cgi?id=` URLs.
    pub url_bugs: Vec<String>,
}

impl References {
    pub fn is_empty(&self) -> bool {
        self.bugs.is_empty() && self.attachments.is_empty() && self.url_bugs.is_empty()
    }
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

pub fn find_references(text: &str) -> References {
    let mut refs = References::default();

    for caps in url_pattern().captures_iter(text) {
        push_unique(&mut refs.url_bugs, caps[2].to_string());
    }

    for caps in reference_pattern().captures_iter(text) {
        let id = &caps[2];
        if caps[1].eq_ignore_ascii_case("bug") {
            push_unique(&mut refs.bugs, id.to_string());
        } else if let Ok(attach_id) = id.parse() {
            push_unique(&mut refs.attachments, attach_id);
        }
    }

    refs
}
