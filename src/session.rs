//! SMTP client session over TCP, with implicit TLS or STARTTLS.

use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as B64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::email::Email;
use crate::errors::{
    MailerError, SmtpAuthError, SmtpConnectionError, SmtpRecipientError, SmtpTimeoutError,
    SmtpTlsError,
};
use crate::logger::{LogLevel, Logger};
use crate::request::IMPLICIT_TLS_PORT;
use crate::response::Response;

/// Longest reply line accepted before the server is considered broken.
const MAX_LINE_LENGTH: usize = 64 * 1024;

const READ_CHUNK: usize = 4096;

/// Auth methods supported by the client, in default preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthType {
    Plain,
    Login,
}

/// What to do with a plaintext connection on a port other than 465.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTls {
    /// Upgrade when possible; stay in plaintext if the server does not
    /// offer STARTTLS or refuses it.
    #[default]
    Opportunistic,
    /// Any failure to upgrade aborts the session.
    Required,
    /// Never upgrade.
    Disabled,
}

/// SMTP credentials.
#[derive(Clone, serde::Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session and dispatch options.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MailerOptions {
    /// Name announced in EHLO/HELO.
    #[serde(default = "default_ehlo_name")]
    pub ehlo_name: String,
    #[serde(default)]
    pub start_tls: StartTls,
    #[serde(default = "default_auth_type")]
    pub auth_type: Vec<AuthType>,
    /// Skip certificate verification. Only for test servers.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub log_level: LogLevel,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    /// Port that is wrapped in TLS before the greeting.
    #[serde(default = "default_implicit_tls_port")]
    pub implicit_tls_port: u16,
}

fn default_ehlo_name() -> String {
    "localhost".to_string()
}
fn default_auth_type() -> Vec<AuthType> {
    vec![AuthType::Plain, AuthType::Login]
}
fn default_connect_timeout_ms() -> u64 {
    20_000
}
fn default_response_timeout_ms() -> u64 {
    30_000
}
fn default_implicit_tls_port() -> u16 {
    IMPLICIT_TLS_PORT
}

impl Default for MailerOptions {
    fn default() -> Self {
        Self {
            ehlo_name: default_ehlo_name(),
            start_tls: StartTls::default(),
            auth_type: default_auth_type(),
            accept_invalid_certs: false,
            log_level: LogLevel::Info,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            implicit_tls_port: default_implicit_tls_port(),
        }
    }
}

impl MailerOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Extensions advertised in the EHLO reply that the session cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub starttls: bool,
    pub auth: bool,
    pub auth_types: Vec<AuthType>,
}

impl Capabilities {
    /// Reads the keywords out of an EHLO reply. The first line is the greeting.
    pub fn parse(response: &Response) -> Self {
        let mut caps = Self::default();
        for line in response.lines.iter().skip(1) {
            let upper = line.to_ascii_uppercase();
            let mut words = upper.split(|c: char| c == ' ' || c == '=');
            match words.next() {
                Some("STARTTLS") => caps.starttls = true,
                Some("AUTH") => {
                    caps.auth = true;
                    for word in words {
                        let mechanism = match word {
                            "PLAIN" => AuthType::Plain,
                            "LOGIN" => AuthType::Login,
                            _ => continue,
                        };
                        if !caps.auth_types.contains(&mechanism) {
                            caps.auth_types.push(mechanism);
                        }
                    }
                }
                _ => {}
            }
        }
        caps
    }
}

enum Connection {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Connection {
    async fn write_all(&mut self, data: &[u8]) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await
            }
        }
    }

    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf).await,
            Self::Tls(stream) => stream.read(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(stream) => stream.shutdown().await,
            Self::Tls(stream) => stream.shutdown().await,
        }
    }
}

/// An open SMTP connection, owned by a single dispatch.
pub struct SmtpSession {
    connection: Option<Connection>,
    buffer: Vec<u8>,
    host: String,
    port: u16,
    options: MailerOptions,
    logger: Logger,
    capabilities: Capabilities,
}

impl SmtpSession {
    /// Connect, read the greeting, say EHLO and settle on TLS.
    ///
    /// [`MailerOptions::implicit_tls_port`] (465 unless overridden) is wrapped
    /// in TLS before the greeting. Any other port starts in plaintext and
    /// follows [`MailerOptions::start_tls`].
    pub async fn connect(
        host: &str,
        port: u16,
        options: MailerOptions,
    ) -> Result<Self, MailerError> {
        let logger = Logger::new(options.log_level, format!("[BulkMailer:{host}:{port}] "));
        let implicit_tls = port == options.implicit_tls_port;

        let connect = TcpStream::connect((host, port));
        let stream = match timeout(options.connect_timeout(), connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let cause = format!("failed to connect to {host}:{port}: {e}");
                return Err(SmtpConnectionError(cause).into());
            }
            Err(_) => {
                return Err(SmtpTimeoutError(format!(
                    "connecting to {host}:{port} timed out after {:?}",
                    options.connect_timeout()
                ))
                .into())
            }
        };

        let mut session = Self {
            connection: Some(Connection::Plain(stream)),
            buffer: Vec::with_capacity(READ_CHUNK),
            host: host.to_string(),
            port,
            options,
            logger,
            capabilities: Capabilities::default(),
        };

        if implicit_tls {
            let handshake = timeout(session.options.connect_timeout(), session.upgrade_tls());
            match handshake.await {
                Ok(result) => result?,
                Err(_) => return Err(SmtpTimeoutError("TLS handshake timed out".into()).into()),
            }
        }

        session.greet().await?;
        session.ehlo().await?;
        if !implicit_tls {
            session.negotiate_start_tls().await?;
        }
        Ok(session)
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.connection, Some(Connection::Tls(_)))
    }

    /// False once a timeout or I/O error has left the reply stream out of step.
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn greet(&mut self) -> Result<(), MailerError> {
        let response = self.read_response().await?;
        if response.code != 220 {
            return Err(SmtpConnectionError(format!("Failed to connect: {response}")).into());
        }
        Ok(())
    }

    async fn ehlo(&mut self) -> Result<(), MailerError> {
        let name = self.options.ehlo_name.clone();
        self.write_line(&format!("EHLO {name}")).await?;
        let response = self.read_response().await?;
        if response.code == 421 {
            return Err(SmtpConnectionError(format!("EHLO failed: {response}")).into());
        }
        if !response.is_success() {
            return self.helo().await;
        }
        self.capabilities = Capabilities::parse(&response);
        Ok(())
    }

    async fn helo(&mut self) -> Result<(), MailerError> {
        let name = self.options.ehlo_name.clone();
        self.write_line(&format!("HELO {name}")).await?;
        let response = self.read_response().await?;
        if !response.is_success() {
            return Err(SmtpConnectionError(format!("HELO failed: {response}")).into());
        }
        self.capabilities = Capabilities::default();
        Ok(())
    }

    async fn negotiate_start_tls(&mut self) -> Result<(), MailerError> {
        let required = match self.options.start_tls {
            StartTls::Disabled => return Ok(()),
            StartTls::Required => true,
            StartTls::Opportunistic => false,
        };

        if !self.capabilities.starttls {
            let err = SmtpTlsError("server does not offer STARTTLS".into());
            if required {
                return Err(err.into());
            }
            self.logger.warn(&format!("{err}, continuing without TLS"));
            return Ok(());
        }

        self.write_line("STARTTLS").await?;
        let response = self.read_response().await?;
        if response.code != 220 {
            let err = SmtpTlsError(format!("STARTTLS refused: {response}"));
            if required {
                return Err(err.into());
            }
            self.logger.warn(&format!("{err}, continuing without TLS"));
            return Ok(());
        }

        // The server is already talking TLS, so a failed handshake leaves
        // nothing to fall back to.
        match timeout(self.options.response_timeout(), self.upgrade_tls()).await {
            Ok(result) => result?,
            Err(_) => return Err(SmtpTimeoutError("TLS handshake timed out".into()).into()),
        }
        self.ehlo().await
    }

    async fn upgrade_tls(&mut self) -> Result<(), MailerError> {
        let stream = match self.connection.take() {
            Some(Connection::Plain(stream)) => stream,
            Some(tls @ Connection::Tls(_)) => {
                self.connection = Some(tls);
                return Err(SmtpTlsError("connection is already TLS".into()).into());
            }
            None => return Err(SmtpConnectionError("connection closed".into()).into()),
        };
        // Anything buffered before the handshake was sent in plaintext.
        self.buffer.clear();

        let config = tls_config(self.options.accept_invalid_certs, &self.logger);
        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.host.clone())
            .map_err(|e| SmtpTlsError(format!("invalid server name {}: {e}", self.host)))?;
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| SmtpTlsError(format!("TLS handshake with {} failed: {e}", self.host)))?;

        self.connection = Some(Connection::Tls(Box::new(tls)));
        self.logger.debug("TLS established");
        Ok(())
    }

    /// Log in with the first mechanism both sides support.
    pub async fn authenticate(&mut self, credentials: &Credentials) -> Result<(), MailerError> {
        if !self.capabilities.auth {
            return Err(SmtpAuthError("server does not support AUTH".into()).into());
        }

        let mechanism = self
            .options
            .auth_type
            .iter()
            .copied()
            .find(|m| self.capabilities.auth_types.contains(m))
            .ok_or_else(|| SmtpAuthError("No supported auth method".into()))?;

        match mechanism {
            AuthType::Plain => self.auth_plain(credentials).await,
            AuthType::Login => self.auth_login(credentials).await,
        }
    }

    async fn auth_plain(&mut self, creds: &Credentials) -> Result<(), MailerError> {
        let blob = format!("\u{0}{}\u{0}{}", creds.username, creds.password);
        let b64 = B64.encode(blob.as_bytes());
        self.write_secret_line(&format!("AUTH PLAIN {}", b64), "AUTH PLAIN <redacted>")
            .await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpAuthError(format!("AUTH PLAIN failed: {}", r)).into());
        }
        Ok(())
    }

    async fn auth_login(&mut self, creds: &Credentials) -> Result<(), MailerError> {
        self.write_line("AUTH LOGIN").await?;
        let r = self.read_response().await?;
        if r.code != 334 {
            return Err(SmtpAuthError(format!("AUTH LOGIN failed: {}", r)).into());
        }
        let u = B64.encode(creds.username.as_bytes());
        self.write_secret_line(&u, "<username>").await?;
        let r = self.read_response().await?;
        if r.code != 334 {
            return Err(SmtpAuthError(format!("AUTH LOGIN user rejected: {}", r)).into());
        }
        let p = B64.encode(creds.password.as_bytes());
        self.write_secret_line(&p, "<password>").await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpAuthError(format!("AUTH LOGIN failed: {}", r)).into());
        }
        Ok(())
    }

    /// Send one message: MAIL FROM, RCPT TO for its single recipient, DATA.
    pub async fn send(&mut self, email: &mut Email) -> Result<Response, MailerError> {
        self.cmd_mail(email).await?;
        self.cmd_rcpt(email).await?;
        self.cmd_data(email).await?;
        let body = email.get_email_data();
        self.write(&body).await?;
        let response = self.read_response().await?;
        if !response.is_success() {
            return Err(SmtpRecipientError::new(
                format!("message rejected: {}", response),
                email.to.clone(),
            )
            .into());
        }
        Ok(response)
    }

    async fn cmd_mail(&mut self, email: &Email) -> Result<(), MailerError> {
        self.write_line(&format!("MAIL FROM:<{}>", email.from)).await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            let cause = format!("MAIL FROM failed: {}", r);
            return Err(SmtpRecipientError::new(cause, email.to.clone()).into());
        }
        Ok(())
    }

    async fn cmd_rcpt(&mut self, email: &Email) -> Result<(), MailerError> {
        self.write_line(&format!("RCPT TO:<{}>", email.to)).await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpRecipientError::new(
                format!("RCPT TO failed for {}: {}", email.to, r),
                email.to.clone(),
            )
            .into());
        }
        Ok(())
    }

    async fn cmd_data(&mut self, email: &Email) -> Result<(), MailerError> {
        self.write_line("DATA").await?;
        let r = self.read_response().await?;
        if r.code != 354 {
            let cause = format!("DATA failed: {}", r);
            return Err(SmtpRecipientError::new(cause, email.to.clone()).into());
        }
        Ok(())
    }

    /// Abort the current transaction so the next message starts clean.
    pub async fn reset(&mut self) -> Result<(), MailerError> {
        self.write_line("RSET").await?;
        let r = self.read_response().await?;
        if !r.is_success() {
            return Err(SmtpConnectionError(format!("RSET failed: {}", r)).into());
        }
        Ok(())
    }

    /// Say QUIT and shut the connection down.
    pub async fn close(mut self) -> Result<(), MailerError> {
        let quit = async {
            self.write_line("QUIT").await?;
            self.read_response().await
        }
        .await;
        if let Some(mut connection) = self.connection.take() {
            let _ = timeout(self.options.response_timeout(), connection.shutdown()).await;
        }
        let r = quit?;
        if r.code != 221 {
            return Err(SmtpConnectionError(format!("QUIT failed: {}", r)).into());
        }
        Ok(())
    }

    async fn write_line(&mut self, line: &str) -> Result<(), MailerError> {
        self.logger.debug(&format!("C: {}", line));
        let bytes = command_bytes(line)?;
        self.send_bytes(&bytes).await
    }

    async fn write_secret_line(&mut self, line: &str, shown: &str) -> Result<(), MailerError> {
        self.logger.debug(&format!("C: {}", shown));
        let bytes = command_bytes(line)?;
        self.send_bytes(&bytes).await
    }

    async fn write(&mut self, data: &str) -> Result<(), MailerError> {
        self.logger.debug(&format!("C: <{} bytes of message data>", data.len()));
        self.send_bytes(data.as_bytes()).await
    }

    async fn send_bytes(&mut self, data: &[u8]) -> Result<(), MailerError> {
        let limit = self.options.response_timeout();
        let connection = self.connection.as_mut().ok_or_else(connection_lost)?;
        let err = match timeout(limit, connection.write_all(data)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => MailerError::from(e),
            Err(_) => SmtpTimeoutError(format!("write timed out after {:?}", limit)).into(),
        };
        self.abandon(&err);
        Err(err)
    }

    /// Any failure here may leave a reply in flight, so the connection is
    /// dropped rather than read out of step.
    async fn read_response(&mut self) -> Result<Response, MailerError> {
        let limit = self.options.response_timeout();
        let err = match timeout(limit, self.read_reply()).await {
            Ok(Ok(response)) => return Ok(response),
            Ok(Err(e)) => e,
            Err(_) => SmtpTimeoutError(format!(
                "no reply from {}:{} within {:?}",
                self.host, self.port, limit
            ))
            .into(),
        };
        self.abandon(&err);
        Err(err)
    }

    fn abandon(&mut self, cause: &MailerError) {
        if self.connection.take().is_some() {
            self.logger.warn(&format!("dropping connection: {cause}"));
        }
    }

    async fn read_reply(&mut self) -> Result<Response, MailerError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            self.logger.debug(&format!("S: {}", line));
            let (code, last, text) = Response::parse_line(&line)?;
            lines.push(text);
            if last {
                return Ok(Response::new(code, lines));
            }
        }
    }

    async fn read_line(&mut self) -> Result<String, MailerError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                return Ok(line.trim_end_matches(['\r', '\n']).to_string());
            }
            if self.buffer.len() > MAX_LINE_LENGTH {
                return Err(SmtpConnectionError("SMTP reply line too long".into()).into());
            }

            let mut chunk = [0u8; READ_CHUNK];
            let connection = self.connection.as_mut().ok_or_else(connection_lost)?;
            let n = connection.read(&mut chunk).await?;
            if n == 0 {
                return Err(SmtpConnectionError("connection closed by server".into()).into());
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }
}

fn connection_lost() -> SmtpConnectionError {
    SmtpConnectionError("connection lost after an earlier error".into())
}

/// A command line with its CRLF. A line break inside would smuggle in a
/// second command.
fn command_bytes(line: &str) -> Result<Vec<u8>, SmtpConnectionError> {
    if line.contains(['\r', '\n']) {
        return Err(SmtpConnectionError(
            "refusing to send a command containing a line break".into(),
        ));
    }
    Ok(format!("{line}\r\n").into_bytes())
}

fn tls_config(accept_invalid_certs: bool, logger: &Logger) -> ClientConfig {
    let mut root_store = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        logger.warn(&format!(
            "some system certificates could not be loaded: {:?}",
            native.errors
        ));
    }
    let (_, ignored) = root_store.add_parsable_certificates(native.certs);
    if ignored > 0 {
        logger.debug(&format!("ignored {ignored} unparsable system certificates"));
    }

    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    if accept_invalid_certs {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerifier));
    }
    config
}

/// Accepts any certificate. Only reachable through `accept_invalid_certs`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ehlo_reply(lines: &[&str]) -> Response {
        Response::new(250, lines.iter().map(|l| l.to_string()).collect())
    }

    #[test]
    fn parses_auth_and_starttls() {
        let caps = Capabilities::parse(&ehlo_reply(&[
            "mail.example.com Hello",
            "SIZE 35882577",
            "STARTTLS",
            "AUTH LOGIN PLAIN XOAUTH2",
        ]));
        assert!(caps.starttls);
        assert!(caps.auth);
        assert_eq!(caps.auth_types, vec![AuthType::Login, AuthType::Plain]);
    }

    #[test]
    fn parses_legacy_auth_equals_form() {
        let caps = Capabilities::parse(&ehlo_reply(&["mx", "AUTH=PLAIN", "auth login"]));
        assert!(caps.auth);
        assert!(!caps.starttls);
        assert_eq!(caps.auth_types, vec![AuthType::Plain, AuthType::Login]);
    }

    #[test]
    fn greeting_line_is_not_a_keyword() {
        let caps = Capabilities::parse(&ehlo_reply(&["STARTTLS.example.com"]));
        assert_eq!(caps, Capabilities::default());
    }

    #[test]
    fn options_default_to_bounded_timeouts() {
        let options = MailerOptions::default();
        assert_eq!(options.connect_timeout(), Duration::from_secs(20));
        assert_eq!(options.response_timeout(), Duration::from_secs(30));
        assert_eq!(options.start_tls, StartTls::Opportunistic);
        assert_eq!(options.auth_type, vec![AuthType::Plain, AuthType::Login]);
        assert_eq!(options.implicit_tls_port, 465);
    }

    #[test]
    fn command_lines_cannot_carry_a_second_command() {
        assert_eq!(command_bytes("RSET").unwrap(), b"RSET\r\n".to_vec());
        assert!(command_bytes("MAIL FROM:<a@x.com>\r\nRCPT TO:<evil@x.com>").is_err());
        assert!(command_bytes("EHLO host\n").is_err());
        assert!(command_bytes("EHLO host\r").is_err());
    }

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials {
            username: "me@example.com".into(),
            password: "hunter2".into(),
        };
        let shown = format!("{creds:?}");
        assert!(shown.contains("me@example.com"));
        assert!(!shown.contains("hunter2"));
    }
}
