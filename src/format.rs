//! Line formatting - IRC control codes and message templates

use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::OnceLock;

const BOLD: char = '\x02';
const COLOR: char = '\x03';
const REVERSE: char = '\x16';
const UNDERLINE: char = '\x1f';

/// mIRC colour names → colour code.
const MIRC_COLORS: &[(&str, u8)] = &[
    ("white", 0),
    ("black", 1),
    ("blue", 2),
    ("green", 3),
    ("red", 4),
    ("brown", 5),
    ("purple", 6),
    ("orange", 7),
    ("yellow", 8),
    ("light green", 9),
    ("teal", 10),
    ("light blue", 11),
    ("dark blue", 12),
    ("pink", 13),
    ("dark grey", 14),
    ("light grey", 15),
];

fn color_code(name: &str) -> Option<u8> {
    let name = name.trim().to_lowercase().replace(['_', '-'], " ");
    MIRC_COLORS
        .iter()
        .find(|(color, _)| *color == name)
        .map(|(_, code)| *code)
}

/// Apply `bold` / `reverse` / `underlined` / colour directives to a line.
///
/// The first colour is the foreground, the second the background. Unknown
/// directives are ignored.
pub fn format_line(line: &str, directives: &[String]) -> String {
    let mut out = line.to_string();
    let mut fg = None;
    let mut bg = None;

    for directive in directives {
        match directive.as_str() {
            "bold" => out = format!("{BOLD}{out}{BOLD}"),
            "reverse" => out = format!("{REVERSE}{out}{REVERSE}"),
            "underlined" | "underline" => out = format!("{UNDERLINE}{out}{UNDERLINE}"),
            other => match color_code(other) {
                Some(code) if fg.is_none() => fg = Some(code),
                Some(code) if bg.is_none() => bg = Some(code),
                _ => {}
            },
        }
    }

    match (fg, bg) {
        (Some(fg), Some(bg)) => format!("{COLOR}{fg:02},{bg:02}{out}{COLOR}"),
        (Some(fg), None) => format!("{COLOR}{fg:02}{out}{COLOR}"),
        _ => out,
    }
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"%\((\w+)\)[sd]|%%").expect("static regex"))
}

/// Expand `%(name)s` / `%(name)d` placeholders. Unknown names expand empty.
pub fn render_template(template: &str, values: &BTreeMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| match caps.get(1) {
            Some(name) => values.get(name.as_str()).cloned().unwrap_or_default(),
            None => "%".to_string(),
        })
        .into_owned()
}
