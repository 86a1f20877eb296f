//! Address validation, recipient splitting and MIME text encoding.

use std::fmt::Write;
use std::sync::OnceLock;

use regex::Regex;

fn email_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^[\w.-]+@[\w.-]+\.\w+$").expect("address pattern is a valid regex")
    })
}

fn separator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[,\n]+").expect("separator pattern is a valid regex"))
}

/// Checks an address against `local@domain.tld`, where local part and domain
/// are word, dot or hyphen characters. Surrounding whitespace is ignored.
pub fn is_valid_email(email: &str) -> bool {
    email_pattern().is_match(email.trim())
}

/// Returns the invalid addresses from a list, trimmed, in input order.
pub fn validate_emails(emails: &[String]) -> Vec<String> {
    emails
        .iter()
        .map(|e| e.trim())
        .filter(|e| !is_valid_email(e))
        .map(str::to_string)
        .collect()
}

/// Splits a free-form recipients blob on commas and newlines, dropping blanks.
pub fn split_recipients(raw: &str) -> Vec<String> {
    separator_pattern()
        .split(raw)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Quoted-printable body encoding (RFC 2045).
///
/// Line breaks (`\n` or `\r\n`) come out as CRLF. Lines longer than
/// `line_length` get soft breaks.
pub fn encode_quoted_printable(text: &str, line_length: usize) -> String {
    let limit = line_length.saturating_sub(3);
    let segments: Vec<&[u8]> = text.as_bytes().split(|b| *b == b'\n').collect();
    let last = segments.len() - 1;
    let mut out = String::with_capacity(text.len());

    for (n, segment) in segments.into_iter().enumerate() {
        // A lone CR at the very end is data, not half a line break.
        let line = match segment.strip_suffix(b"\r") {
            Some(stripped) if n != last => stripped,
            _ => segment,
        };
        if n > 0 {
            out.push_str("\r\n");
        }

        let mut width = 0;
        for (i, &byte) in line.iter().enumerate() {
            let blank = byte == b' ' || byte == b'\t';
            let ends_line = matches!(line.get(i + 1), None | Some(b'\r'));
            let literal = (byte.is_ascii_graphic() && byte != b'=') || (blank && !ends_line);
            let len = if literal { 1 } else { 3 };

            if width + len > limit {
                out.push_str("=\r\n");
                width = 0;
            }
            if literal {
                out.push(char::from(byte));
            } else {
                let _ = write!(out, "={byte:02X}");
            }
            width += len;
        }
    }
    out
}

/// RFC 2047 `Q` encoding for header values.
///
/// Printable ASCII is returned unchanged. Anything else, control characters
/// included, is encoded so the value can never span more than one line.
pub fn encode_header(text: &str) -> String {
    if text.bytes().all(|b| b == b' ' || b.is_ascii_graphic()) {
        return text.to_string();
    }
    let words = text.bytes().fold(String::new(), |mut acc, byte| {
        match byte {
            b' ' => acc.push('_'),
            b'?' | b'=' | b'_' => {
                let _ = write!(acc, "={byte:02X}");
            }
            b if b.is_ascii_graphic() => acc.push(char::from(b)),
            b => {
                let _ = write!(acc, "={b:02X}");
            }
        }
        acc
    });
    format!("=?UTF-8?Q?{words}?=")
}
