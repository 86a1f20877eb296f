//! Per-recipient message building and RFC 5322 rendering.

use crate::request::SendRequest;
use crate::utils::{encode_header, encode_quoted_printable};

/// One outbound message, addressed to exactly one recipient.
///
/// Built fresh from the request for every recipient so nothing leaks from
/// one send into the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Email {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub text: String,
    headers: Vec<(String, String)>,
}

impl Email {
    pub fn for_recipient(request: &SendRequest, recipient: &str) -> Self {
        Self {
            from: request.sender().to_string(),
            to: recipient.trim().to_string(),
            subject: request.subject().to_string(),
            text: request.body().to_string(),
            headers: Vec::new(),
        }
    }

    /// Header fields in the order they are written, resolving defaults on first use.
    pub fn headers(&mut self) -> &[(String, String)] {
        if self.headers.is_empty() {
            self.resolve_headers();
        }
        &self.headers
    }

    fn resolve_headers(&mut self) {
        let domain = self.from.split('@').nth(1).unwrap_or("localhost");
        let message_id = format!("<{}@{}>", uuid::Uuid::new_v4(), domain);

        self.headers = vec![
            ("From".to_string(), self.from.clone()),
            ("To".to_string(), self.to.clone()),
            ("Subject".to_string(), encode_header(&self.subject)),
            ("Date".to_string(), chrono::Utc::now().to_rfc2822()),
            ("Message-ID".to_string(), message_id),
            ("MIME-Version".to_string(), "1.0".to_string()),
            (
                "Content-Type".to_string(),
                "text/plain; charset=\"UTF-8\"".to_string(),
            ),
            (
                "Content-Transfer-Encoding".to_string(),
                "quoted-printable".to_string(),
            ),
        ];
    }

    fn apply_dot_stuffing(data: &str) -> String {
        let mut result = data.replace("\r\n.", "\r\n..");
        if result.starts_with('.') {
            result.insert(0, '.');
        }
        result
    }

    /// Raw message for the DATA phase, terminated with `CRLF.CRLF`.
    pub fn get_email_data(&mut self) -> String {
        let mut email_data: String = self
            .headers()
            .iter()
            .map(|(k, v)| format!("{}: {}\r\n", k, v))
            .collect();
        email_data.push_str("\r\n");
        email_data.push_str(&encode_quoted_printable(&self.text, 76));
        email_data.push_str("\r\n");

        let safe = Self::apply_dot_stuffing(&email_data);
        format!("{}.\r\n", safe)
    }
}
