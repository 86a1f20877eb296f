//! bulk-mailer: send one message to a batch of recipients over SMTP.
//!
//! A [`SendRequestDraft`] is checked by [`validate`] and becomes an immutable
//! [`SendRequest`]. A [`Dispatcher`] then opens one SMTP session, sends a
//! separate message to each recipient and reports every step as a
//! [`ProgressEvent`]. A rejected recipient is reported and skipped; only a
//! failure to connect or log in ends the batch early.
//!
//! ```no_run
//! use bulk_mailer::{Dispatcher, MailerOptions, SendRequestDraft};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let request = SendRequestDraft {
//!     sender: "me@example.com".into(),
//!     credential: "app-password".into(),
//!     host: "smtp.example.com".into(),
//!     port: "587".into(),
//!     subject: "Hello".into(),
//!     body: "Hi all".into(),
//!     ..Default::default()
//! }
//! .with_raw_recipients("a@example.com, b@example.com")
//! .validate()?;
//!
//! let dispatcher = Dispatcher::new(MailerOptions::default());
//! let mut handle = dispatcher.start(request)?;
//! while let Some(event) = handle.next_event().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod dispatcher;
pub mod email;
pub mod errors;
pub mod event;
pub mod logger;
pub mod request;
pub mod response;
pub mod session;
pub mod utils;
pub mod validator;

// Re-exports
pub use dispatcher::{DispatchHandle, DispatchOutcome, Dispatcher};
pub use email::Email;
pub use errors::{
    Field, MailerError, SmtpAuthError, SmtpConnectionError, SmtpRecipientError, SmtpTimeoutError,
    SmtpTlsError, ValidationErrors, Violation,
};
pub use event::{EventSink, FnSink, ProgressEvent};
pub use logger::{LogLevel, Logger};
pub use request::{
    SendRequest, SendRequestDraft, DEFAULT_HOST, DEFAULT_SUBJECT, IMPLICIT_TLS_PORT,
};
pub use response::Response;
pub use session::{AuthType, Capabilities, Credentials, MailerOptions, SmtpSession, StartTls};
pub use utils::{
    encode_header, encode_quoted_printable, is_valid_email, split_recipients, validate_emails,
};
pub use validator::validate;
