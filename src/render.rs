//! Diff → sentence rendering
//!
//! Pure functions turning one [`Diff`] into announcement lines. Exactly one
//! branch applies per diff, checked in this order: flags, multi-value field,
//! duplicate marker, pure addition, pure removal, value change.

use crate::bugmail::{Diff, FlagChanges, DUPLICATE_MARKER, MULTI_FIELDS};

/// Everything the renderer needs besides the diff itself.
#[derive(Debug, Clone, Copy)]
pub struct RenderContext<'a> {
    pub changer: &'a str,
    pub bug_id: u64,
    pub dupe_of: Option<u64>,
    /// Phrase used when a flag is requested from nobody in particular.
    pub no_requestee: &'a str,
}

impl<'a> RenderContext<'a> {
    pub fn new(changer: &'a str, bug_id: u64) -> Self {
        Self {
            changer,
            bug_id,
            dupe_of: None,
            no_requestee: "from the wind",
        }
    }

    pub fn with_dupe_of(mut self, dupe_of: Option<u64>) -> Self {
        self.dupe_of = dupe_of;
        self
    }

    pub fn with_no_requestee(mut self, phrase: &'a str) -> Self {
        self.no_requestee = phrase;
        self
    }
}

/// ` for attachment N on bug B` or ` on bug B`.
fn location(ctx: &RenderContext<'_>, diff: &Diff) -> String {
    match diff.attachment {
        Some(attach_id) => format!(" for attachment {} on bug {}", attach_id, ctx.bug_id),
        None => format!(" on bug {}", ctx.bug_id),
    }
}

/// Render one diff as announcement lines.
pub fn render_diff(ctx: &RenderContext<'_>, diff: &Diff) -> Vec<String> {
    let at = location(ctx, diff);

    if let Some(flags) = diff.flags.as_ref().filter(|f| !f.is_empty()) {
        return render_flags(ctx, flags, &at);
    }

    let changer = ctx.changer;
    let what = diff.what();
    let (added, removed) = (diff.added.as_str(), diff.removed.as_str());

    let line = if MULTI_FIELDS.contains(&what) {
        let mut line = changer.to_string();
        if !added.is_empty() {
            line.push_str(&format!(" added {} to", added));
        }
        if !added.is_empty() && !removed.is_empty() {
            line.push_str(" and");
        }
        if !removed.is_empty() {
            line.push_str(&format!(" removed {} from", removed));
        }
        line.push_str(&format!(" the {} field{}.", what, at));
        line
    } else if matches!(diff.field(), "bug_status" | "resolution") && added.contains(DUPLICATE_MARKER) {
        match ctx.dupe_of {
            Some(dupe_of) => format!(
                "{} marked bug {} as a duplicate of bug {}.",
                changer, ctx.bug_id, dupe_of
            ),
            None => format!("{} marked bug {} as a duplicate.", changer, ctx.bug_id),
        }
    } else if removed.is_empty() {
        format!("{} set the {} field{} to {}.", changer, what, at, added)
    } else if added.is_empty() {
        format!("{} cleared the {} '{}'{}.", changer, what, removed, at)
    } else {
        format!(
            "{} changed the {}{} from {} to {}.",
            changer, what, at, removed, added
        )
    };

    vec![line]
}

fn render_flags(ctx: &RenderContext<'_>, flags: &FlagChanges, at: &str) -> Vec<String> {
    let mut lines = Vec::new();

    let decided = [
        ("granted", &flags.granted),
        ("denied", &flags.denied),
        ("cancelled", &flags.cancelled),
    ];
    for (word, list) in decided {
        for flag in list {
            lines.push(format!("{} {} {}{}.", ctx.changer, word, flag.name, at));
        }
    }

    for flag in &flags.requested {
        let from = match &flag.requestee {
            Some(requestee) => format!("from {}", requestee),
            None => ctx.no_requestee.to_string(),
        };
        lines.push(format!(
            "{} requested {} {}{}.",
            ctx.changer, flag.name, from, at
        ));
    }

    lines
}
