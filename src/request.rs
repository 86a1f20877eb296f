//! Send request: the caller's draft and its validated, immutable form.

use crate::utils::split_recipients;

/// Host used when the draft leaves the server blank.
pub const DEFAULT_HOST: &str = "smtp.gmail.com";

/// Subject used when the draft leaves it blank.
pub const DEFAULT_SUBJECT: &str = "(No Subject)";

/// Default port that implies TLS from the first byte.
pub const IMPLICIT_TLS_PORT: u16 = 465;

/// Unvalidated send request, as typed in by a user.
///
/// Every field is free-form text; [`crate::validator::validate`] turns it
/// into a [`SendRequest`] or reports what is wrong with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SendRequestDraft {
    pub sender: String,
    pub credential: String,
    pub host: String,
    pub port: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
}

impl SendRequestDraft {
    /// Replace the recipients with the entries of a comma or newline separated blob.
    pub fn with_raw_recipients(mut self, raw: &str) -> Self {
        self.recipients = split_recipients(raw);
        self
    }

    pub(crate) fn normalized_host(&self) -> String {
        match self.host.trim() {
            "" => DEFAULT_HOST.to_string(),
            host => host.to_string(),
        }
    }

    pub(crate) fn normalized_subject(&self) -> String {
        match self.subject.trim() {
            "" => DEFAULT_SUBJECT.to_string(),
            subject => subject.to_string(),
        }
    }

    /// Trimmed recipients with blank entries removed, in input order.
    pub(crate) fn normalized_recipients(&self) -> Vec<String> {
        non_blank(&self.recipients).map(str::to_string).collect()
    }
}

/// A validated send request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SendRequest {
    sender: String,
    #[serde(skip_serializing)]
    credential: String,
    host: String,
    port: u16,
    recipients: Vec<String>,
    subject: String,
    body: String,
}

impl SendRequest {
    pub(crate) fn from_parts(
        sender: String,
        credential: String,
        host: String,
        port: u16,
        recipients: Vec<String>,
        subject: String,
        body: String,
    ) -> Self {
        Self {
            sender,
            credential,
            host,
            port,
            recipients,
            subject,
            body,
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn credential(&self) -> &str {
        &self.credential
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Recipients as given, in order.
    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Trimmed, non-blank recipients in send order.
    pub fn deliverable_recipients(&self) -> impl Iterator<Item = &str> {
        non_blank(&self.recipients)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }
}

fn non_blank(recipients: &[String]) -> impl Iterator<Item = &str> {
    recipients
        .iter()
        .map(|r| r.trim())
        .filter(|r| !r.is_empty())
}
