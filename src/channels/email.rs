//! Header extraction for staged messages, via `mail-parser`.

use mail_parser::{Address, MessageParser, MimeHeaders};

use crate::pipeline::types::MessageHeaders;

/// Characters of body text kept before sanitizing. The sanitizer applies the
/// real limit; this just keeps huge bodies out of memory twice.
const RAW_PREVIEW_CHARS: usize = 4096;

/// Extract the headers and body preview the classifier needs.
///
/// Returns `None` when the bytes do not parse as a message at all, or parse
/// to something with none of From, To or Subject.
pub fn parse_headers(raw: &[u8]) -> Option<MessageHeaders> {
    let parsed = MessageParser::default().parse(raw)?;

    let from = parsed.from().and_then(render_first);
    let to = parsed.to().and_then(render_first);
    let subject = parsed.subject().map(str::to_string);

    if from.is_none() && to.is_none() && subject.is_none() {
        return None;
    }

    let to_address = parsed
        .to()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());

    Some(MessageHeaders {
        from: from.unwrap_or_default(),
        to: to.unwrap_or_default(),
        reply_to: parsed.reply_to().and_then(render_first),
        subject: subject.unwrap_or_default(),
        body_preview: extract_preview(&parsed),
        to_address,
    })
}

/// `Name <addr>`, bare address, or bare name, for the first entry.
fn render_first(address: &Address) -> Option<String> {
    let first = address.first()?;
    let rendered = match (first.name(), first.address()) {
        (Some(name), Some(addr)) if !name.trim().is_empty() => format!("{name} <{addr}>"),
        (_, Some(addr)) => addr.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => return None,
    };
    Some(rendered)
}

fn extract_preview(parsed: &mail_parser::Message) -> String {
    if let Some(text) = parsed.body_text(0) {
        return text.chars().take(RAW_PREVIEW_CHARS).collect();
    }
    if let Some(html) = parsed.body_html(0) {
        let text = strip_html(html.as_ref());
        return text.chars().take(RAW_PREVIEW_CHARS).collect();
    }
    for part in parsed.attachments() {
        let part: &mail_parser::MessagePart = part;
        if let Some(ct) = MimeHeaders::content_type(part)
            && ct.ctype() == "text"
            && let Ok(text) = std::str::from_utf8(part.contents())
        {
            let name = MimeHeaders::attachment_name(part).unwrap_or("file");
            return format!("[Attachment: {name}] {text}")
                .chars()
                .take(RAW_PREVIEW_CHARS)
                .collect();
        }
    }
    String::new()
}

/// Drop tags and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Domain part of an address, lowercased.
pub fn address_domain(address: &str) -> Option<String> {
    let (_, domain) = address.rsplit_once('@')?;
    let domain = domain.trim().trim_end_matches('>').to_lowercase();
    (!domain.is_empty()).then_some(domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAIN: &[u8] = b"From: Alice Example <alice@example.org>\r\n\
To: bob@example.com\r\n\
Reply-To: replies@example.org\r\n\
Subject: Lunch on Friday\r\n\
Message-ID: <1@example.org>\r\n\
\r\n\
Are we still on for Friday?\r\n";

    #[test]
    fn extracts_plain_message() {
        let headers = parse_headers(PLAIN).unwrap();
        assert_eq!(headers.from, "Alice Example <alice@example.org>");
        assert_eq!(headers.to, "bob@example.com");
        assert_eq!(headers.reply_to.as_deref(), Some("replies@example.org"));
        assert_eq!(headers.subject, "Lunch on Friday");
        assert!(headers.body_preview.contains("still on for Friday"));
        assert_eq!(headers.to_address.as_deref(), Some("bob@example.com"));
    }

    #[test]
    fn missing_reply_to_is_none() {
        let raw = b"From: a@example.org\r\nTo: b@example.com\r\nSubject: hi\r\n\r\nbody\r\n";
        let headers = parse_headers(raw).unwrap();
        assert!(headers.reply_to.is_none());
    }

    #[test]
    fn html_only_body_is_stripped() {
        let raw = b"From: a@example.org\r\n\
To: b@example.com\r\n\
Subject: news\r\n\
Content-Type: text/html; charset=utf-8\r\n\
\r\n\
<html><body><p>Hello <b>there</b></p></body></html>\r\n";
        let headers = parse_headers(raw).unwrap();
        assert!(headers.body_preview.contains("Hello"));
        assert!(headers.body_preview.contains("there"));
        assert!(!headers.body_preview.contains('<'));
    }

    #[test]
    fn garbage_is_unparseable() {
        assert!(parse_headers(b"").is_none());
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello <b>World</b></p>"), "Hello World");
        assert_eq!(strip_html("plain text"), "plain text");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn address_domain_lowercases() {
        assert_eq!(address_domain("Bob@Example.COM").as_deref(), Some("example.com"));
        assert_eq!(address_domain("no-at-sign"), None);
        assert_eq!(address_domain("trailing@"), None);
    }
}
