//! Pre-flight checks on a send request.
//!
//! Every check runs on every call so the caller gets the full list of
//! problems at once. Nothing here touches the network.

use crate::errors::{Field, ValidationErrors, Violation};
use crate::request::{SendRequest, SendRequestDraft};
use crate::utils::validate_emails;

/// Validate a draft, returning the immutable request it describes.
///
/// Violations are reported in a fixed order: sender, credential, port,
/// empty recipient list, one entry per malformed address in input order,
/// then a multi-line subject.
pub fn validate(draft: &SendRequestDraft) -> Result<SendRequest, ValidationErrors> {
    let mut violations = Vec::new();

    let sender = draft.sender.trim();
    if sender.is_empty() {
        violations.push(Violation::new(Field::Sender, "sender address is required"));
    } else if has_control(sender) {
        violations.push(Violation::new(
            Field::Sender,
            "sender address must not contain control characters",
        ));
    }

    let credential = draft.credential.trim();
    if credential.is_empty() {
        violations.push(Violation::new(Field::Credential, "credential is required"));
    } else if has_control(credential) {
        violations.push(Violation::new(
            Field::Credential,
            "credential must not contain control characters",
        ));
    }

    let port = parse_port(&draft.port);
    if port.is_none() {
        violations.push(Violation::new(
            Field::Port,
            format!("port must be a number between 1 and 65535, got {:?}", draft.port.trim()),
        ));
    }

    let recipients = draft.normalized_recipients();
    if recipients.is_empty() {
        violations.push(Violation::new(
            Field::Recipients,
            "at least one recipient is required",
        ));
    }
    for rcpt in validate_emails(&recipients) {
        violations.push(Violation::new(
            Field::Recipients,
            format!("invalid address: {rcpt}"),
        ));
    }

    // Header values are written verbatim, so a line break would start a new header.
    let subject = draft.normalized_subject();
    if subject.contains(['\r', '\n']) {
        violations.push(Violation::new(Field::Subject, "subject must be a single line"));
    }

    match port {
        Some(port) if violations.is_empty() => Ok(SendRequest::from_parts(
            sender.to_string(),
            credential.to_string(),
            draft.normalized_host(),
            port,
            recipients,
            subject,
            draft.body.trim().to_string(),
        )),
        _ => Err(ValidationErrors { violations }),
    }
}

fn has_control(value: &str) -> bool {
    value.chars().any(char::is_control)
}

fn parse_port(raw: &str) -> Option<u16> {
    raw.trim().parse::<u16>().ok().filter(|port| *port > 0)
}

impl SendRequestDraft {
    /// Shorthand for [`validate`].
    pub fn validate(&self) -> Result<SendRequest, ValidationErrors> {
        validate(self)
    }
}
