//! Sanitizer for untrusted header and body text.
//!
//! Everything extracted from a message passes through [`clean`] before it is
//! embedded in a classification request. The output never contains control
//! characters or line breaks, never contains runs that could be read as
//! template delimiters (`---`, `===`, triple backticks), and never exceeds the
//! requested length in characters.

use std::sync::LazyLock;

use regex::Regex;

/// Limit for From / To / Reply-To / Subject.
pub const HEADER_MAX_LEN: usize = 200;

/// Limit for the body preview sent to the classifier.
pub const BODY_PREVIEW_MAX_LEN: usize = 800;

/// Limit for body previews used in summaries.
pub const SUMMARY_PREVIEW_MAX_LEN: usize = 300;

/// Default limit for untrusted text written to logs.
pub const LOG_MAX_LEN: usize = 100;

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("valid ANSI regex"));

static DELIMITER_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"-{3,}|={3,}|`{3,}").expect("valid delimiter regex"));

/// Clean one untrusted field and bound it to `max_len` characters.
pub fn clean(field: &str, max_len: usize) -> String {
    if field.is_empty() || max_len == 0 {
        return String::new();
    }

    let without_ansi = ANSI_ESCAPE.replace_all(field, "");

    // A run of line breaks becomes one space; other control or format
    // characters are dropped.
    let mut flat = String::with_capacity(without_ansi.len());
    let mut in_break = false;
    for ch in without_ansi.chars() {
        if is_line_break(ch) {
            if !in_break {
                flat.push(' ');
            }
            in_break = true;
            continue;
        }
        in_break = false;
        match ch {
            '\t' => flat.push(' '),
            c if c.is_control() || is_invisible(c) => {}
            c => flat.push(c),
        }
    }

    // Removing one run can join its neighbours into a new one, so repeat.
    let mut text = flat;
    while DELIMITER_RUN.is_match(&text) {
        text = DELIMITER_RUN.replace_all(&text, "").into_owned();
    }

    truncate_chars(text.trim(), max_len).trim_end().to_string()
}

/// Clean untrusted text for a log line.
pub fn sanitize_for_log(text: &str, max_len: usize) -> String {
    clean(text, max_len)
}

fn is_line_break(c: char) -> bool {
    matches!(c, '\r' | '\n' | '\u{0B}' | '\u{0C}' | '\u{85}' | '\u{2028}' | '\u{2029}')
}

/// Zero-width and bidi-control characters that render as nothing.
fn is_invisible(c: char) -> bool {
    matches!(
        c,
        '\u{200B}'..='\u{200F}' | '\u{202A}'..='\u{202E}' | '\u{2060}'..='\u{2064}' | '\u{FEFF}'
    )
}

fn truncate_chars(text: &str, max_len: usize) -> &str {
    match text.char_indices().nth(max_len) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
