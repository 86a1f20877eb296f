//! SMTP reply parsing.

use std::fmt;

use crate::errors::SmtpConnectionError;

/// A complete, possibly multi-line, SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub fn new(code: u16, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Splits one reply line into `(code, is_last, text)`.
    ///
    /// `250-SIZE` continues the reply, `250 OK` and a bare `250` end it.
    pub fn parse_line(line: &str) -> Result<(u16, bool, String), SmtpConnectionError> {
        let code = line
            .get(..3)
            .filter(|c| c.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| SmtpConnectionError(format!("malformed SMTP reply: {line:?}")))?;

        match line.as_bytes().get(3) {
            None => Ok((code, true, String::new())),
            Some(b' ') => Ok((code, true, line[4..].to_string())),
            Some(b'-') => Ok((code, false, line[4..].to_string())),
            Some(_) => Err(SmtpConnectionError(format!(
                "malformed SMTP reply: {line:?}"
            ))),
        }
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lines.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{} {}", self.code, self.message())
        }
    }
}
