//! Error types for the bulk mailer.

use std::fmt;

use thiserror::Error;

/// Top-level error for the bulk mailer.
#[derive(Error, Debug)]
pub enum MailerError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Connection(#[from] SmtpConnectionError),
    #[error(transparent)]
    Auth(#[from] SmtpAuthError),
    #[error(transparent)]
    Recipient(#[from] SmtpRecipientError),
    #[error(transparent)]
    Timeout(#[from] SmtpTimeoutError),
    #[error(transparent)]
    Tls(#[from] SmtpTlsError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A dispatch from the same dispatcher is still running.
    #[error("a dispatch is already in progress")]
    Busy,
    #[error("dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl MailerError {
    pub fn code(&self) -> &'static str {
        match self {
            MailerError::Validation(_) => ValidationErrors::CODE,
            MailerError::Connection(_) => SmtpConnectionError::CODE,
            MailerError::Auth(_) => SmtpAuthError::CODE,
            MailerError::Recipient(_) => SmtpRecipientError::CODE,
            MailerError::Timeout(_) => SmtpTimeoutError::CODE,
            MailerError::Tls(_) => SmtpTlsError::CODE,
            MailerError::Io(_) => "IO",
            MailerError::Busy => "BUSY",
            MailerError::Task(_) => "TASK_FAILED",
        }
    }
}

/// Which part of a send request a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Sender,
    Credential,
    Port,
    Recipients,
    Subject,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Sender => "sender",
            Field::Credential => "credential",
            Field::Port => "port",
            Field::Recipients => "recipients",
            Field::Subject => "subject",
        })
    }
}

/// A single problem found while validating a send request.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Violation {
    pub field: Field,
    pub reason: String,
}

impl Violation {
    pub fn new(field: Field, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

/// Send request refused before any network activity.
///
/// Always holds at least one violation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid send request: {}", join_violations(.violations))]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub const CODE: &'static str = "INVALID_REQUEST";

    /// Fields with at least one violation, in report order and without repeats.
    pub fn fields(&self) -> Vec<Field> {
        let mut fields: Vec<Field> = Vec::new();
        for v in &self.violations {
            if !fields.contains(&v.field) {
                fields.push(v.field);
            }
        }
        fields
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// SMTP authentication failed.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SmtpAuthError(pub String);

impl SmtpAuthError {
    pub const CODE: &'static str = "AUTH_FAILED";
}

/// SMTP connection failed.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SmtpConnectionError(pub String);

impl SmtpConnectionError {
    pub const CODE: &'static str = "CONNECTION_FAILED";
}

/// Recipient rejected by SMTP server.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct SmtpRecipientError {
    pub message: String,
    pub recipient: String,
}

impl SmtpRecipientError {
    pub const CODE: &'static str = "RECIPIENT_REJECTED";
    pub fn new(message: impl Into<String>, recipient: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recipient: recipient.into(),
        }
    }
}

/// SMTP operation timeout.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SmtpTimeoutError(pub String);

impl SmtpTimeoutError {
    pub const CODE: &'static str = "TIMEOUT";
}

/// TLS negotiation failed.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct SmtpTlsError(pub String);

impl SmtpTlsError {
    pub const CODE: &'static str = "TLS_FAILED";
}
