pub mod mock_server;

use bulk_mailer::{LogLevel, MailerOptions, SendRequest, SendRequestDraft};

pub fn request(port: u16, recipients: &[&str]) -> SendRequest {
    SendRequestDraft {
        sender: "sender@example.com".into(),
        credential: "app-password".into(),
        host: "127.0.0.1".into(),
        port: port.to_string(),
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        subject: "Status update".into(),
        body: "The build is green.".into(),
    }
    .validate()
    .unwrap()
}

pub fn options() -> MailerOptions {
    bulk_mailer::logger::init();
    MailerOptions {
        connect_timeout_ms: 2_000,
        response_timeout_ms: 2_000,
        log_level: LogLevel::Debug,
        ..MailerOptions::default()
    }
}
