//! Scriptable in-process SMTP server for dispatch tests.
//!
//! Speaks just enough SMTP for a submission session: greeting, EHLO/HELO,
//! STARTTLS (refused, or a real upgrade with a self-signed certificate),
//! implicit TLS, AUTH PLAIN/LOGIN, MAIL/RCPT/DATA, RSET and QUIT.
//! Every command line it receives is recorded, and every accepted message
//! is kept with its envelope recipients.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_rustls::{
    rustls::{
        pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
        ServerConfig,
    },
    TlsAcceptor,
};

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type Stream = BufReader<Box<dyn Io>>;

#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub message: String,
}

impl Reply {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn line(&self) -> String {
        format!("{} {}\r\n", self.code, self.message)
    }
}

/// A message the server accepted.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub from: String,
    pub recipients: Vec<String>,
    pub data: String,
    /// Whether the message arrived over TLS.
    pub tls: bool,
}

#[derive(Clone)]
struct Config {
    greeting: Reply,
    greeting_delay: Option<Duration>,
    auth_mechanisms: Vec<&'static str>,
    auth_reply: Reply,
    starttls_reply: Option<Reply>,
    implicit_tls: bool,
    rejected_recipients: HashMap<String, Reply>,
    rejected_data: HashMap<String, Reply>,
    slow_data: HashMap<String, Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.example.com ESMTP ready"),
            greeting_delay: None,
            auth_mechanisms: vec!["PLAIN", "LOGIN"],
            auth_reply: Reply::new(235, "2.7.0 Authentication successful"),
            starttls_reply: None,
            implicit_tls: false,
            rejected_recipients: HashMap::new(),
            rejected_data: HashMap::new(),
            slow_data: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct Recorded {
    commands: Vec<String>,
    delivered: Vec<Delivered>,
    connections: usize,
}

pub struct MockSmtpServerBuilder {
    config: Config,
}

impl MockSmtpServerBuilder {
    pub fn with_greeting(mut self, code: u16, message: &str) -> Self {
        self.config.greeting = Reply::new(code, message);
        self
    }

    /// Wait this long after accepting before sending the greeting.
    pub fn with_greeting_delay(mut self, delay: Duration) -> Self {
        self.config.greeting_delay = Some(delay);
        self
    }

    /// Mechanisms listed in the EHLO AUTH line. Empty means no AUTH line.
    pub fn with_auth_mechanisms(mut self, mechanisms: Vec<&'static str>) -> Self {
        self.config.auth_mechanisms = mechanisms;
        self
    }

    pub fn with_auth_reply(mut self, code: u16, message: &str) -> Self {
        self.config.auth_reply = Reply::new(code, message);
        self
    }

    /// Advertise STARTTLS and answer it with this reply. A 220 is followed
    /// by a real TLS handshake.
    pub fn with_starttls_reply(mut self, code: u16, message: &str) -> Self {
        self.config.starttls_reply = Some(Reply::new(code, message));
        self
    }

    /// Speak TLS from the first byte.
    pub fn with_implicit_tls(mut self) -> Self {
        self.config.implicit_tls = true;
        self
    }

    pub fn reject_recipient(mut self, address: &str, code: u16, message: &str) -> Self {
        self.config
            .rejected_recipients
            .insert(address.to_string(), Reply::new(code, message));
        self
    }

    /// Accept the recipient but refuse the message body for it.
    pub fn reject_data_for(mut self, address: &str, code: u16, message: &str) -> Self {
        self.config
            .rejected_data
            .insert(address.to_string(), Reply::new(code, message));
        self
    }

    /// Queue the message for this recipient, then wait before saying so.
    pub fn delay_data_reply_for(mut self, address: &str, delay: Duration) -> Self {
        self.config.slow_data.insert(address.to_string(), delay);
        self
    }

    pub async fn build(self) -> MockSmtpServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let recorded = Arc::new(Mutex::new(Recorded::default()));

        let config = self.config;
        let acceptor = tls_acceptor();
        let state = Arc::clone(&recorded);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = config.clone();
                let acceptor = acceptor.clone();
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let _ = serve(Box::new(stream), config, acceptor, state).await;
                });
            }
        });

        MockSmtpServer {
            addr,
            recorded,
            handle,
        }
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    recorded: Arc<Mutex<Recorded>>,
    handle: JoinHandle<()>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            config: Config::default(),
        }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn commands(&self) -> Vec<String> {
        self.recorded.lock().unwrap().commands.clone()
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.recorded.lock().unwrap().delivered.clone()
    }

    pub fn connections(&self) -> usize {
        self.recorded.lock().unwrap().connections
    }
}

impl Drop for MockSmtpServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn tls_acceptor() -> TlsAcceptor {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let chain = vec![CertificateDer::from(cert.serialize_der().unwrap())];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.serialize_private_key_der()));
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .unwrap();
    TlsAcceptor::from(Arc::new(config))
}

async fn reply(stream: &mut Stream, text: &str) -> std::io::Result<()> {
    stream.write_all(text.as_bytes()).await?;
    stream.flush().await
}

async fn serve(
    raw: Box<dyn Io>,
    config: Config,
    acceptor: TlsAcceptor,
    state: Arc<Mutex<Recorded>>,
) -> std::io::Result<()> {
    state.lock().unwrap().connections += 1;
    if let Some(delay) = config.greeting_delay {
        tokio::time::sleep(delay).await;
    }

    let mut tls = config.implicit_tls;
    let mut stream: Stream = if tls {
        let secured: Box<dyn Io> = Box::new(acceptor.accept(raw).await?);
        BufReader::new(secured)
    } else {
        BufReader::new(raw)
    };

    reply(&mut stream, &config.greeting.line()).await?;
    if config.greeting.code != 220 {
        return Ok(());
    }

    let mut from = String::new();
    let mut recipients: Vec<String> = Vec::new();

    loop {
        let Some(line) = read_line(&mut stream).await? else {
            return Ok(());
        };
        state.lock().unwrap().commands.push(line.clone());
        let upper = line.to_ascii_uppercase();

        let answer = if upper.starts_with("EHLO") {
            let mut lines = vec!["mock.example.com".to_string()];
            if config.starttls_reply.is_some() && !tls {
                lines.push("STARTTLS".to_string());
            }
            if !config.auth_mechanisms.is_empty() {
                lines.push(format!("AUTH {}", config.auth_mechanisms.join(" ")));
            }
            lines.push("8BITMIME".to_string());
            let last = lines.len() - 1;
            lines
                .iter()
                .enumerate()
                .map(|(i, l)| format!("250{}{}\r\n", if i == last { ' ' } else { '-' }, l))
                .collect::<String>()
        } else if upper.starts_with("HELO") {
            "250 mock.example.com\r\n".to_string()
        } else if upper == "STARTTLS" {
            match &config.starttls_reply {
                Some(answer) if answer.code == 220 && !tls => {
                    reply(&mut stream, &answer.line()).await?;
                    let plain = stream.into_inner();
                    let secured: Box<dyn Io> = Box::new(acceptor.accept(plain).await?);
                    stream = BufReader::new(secured);
                    tls = true;
                    from.clear();
                    recipients.clear();
                    continue;
                }
                Some(answer) => answer.line(),
                None => "502 5.5.1 Not implemented\r\n".to_string(),
            }
        } else if upper.starts_with("AUTH PLAIN") {
            config.auth_reply.line()
        } else if upper == "AUTH LOGIN" {
            reply(&mut stream, "334 VXNlcm5hbWU6\r\n").await?;
            if read_line(&mut stream).await?.is_none() {
                return Ok(());
            }
            reply(&mut stream, "334 UGFzc3dvcmQ6\r\n").await?;
            if read_line(&mut stream).await?.is_none() {
                return Ok(());
            }
            config.auth_reply.line()
        } else if upper.starts_with("MAIL FROM:") {
            from = angle_addr(&line);
            recipients.clear();
            "250 2.1.0 OK\r\n".to_string()
        } else if upper.starts_with("RCPT TO:") {
            let rcpt = angle_addr(&line);
            match config.rejected_recipients.get(&rcpt) {
                Some(rejection) => rejection.line(),
                None => {
                    recipients.push(rcpt);
                    "250 2.1.5 OK\r\n".to_string()
                }
            }
        } else if upper == "DATA" {
            if recipients.is_empty() {
                "554 5.5.1 No valid recipients\r\n".to_string()
            } else {
                reply(&mut stream, "354 End data with <CR><LF>.<CR><LF>\r\n").await?;
                let mut data = String::new();
                loop {
                    let Some(data_line) = read_line(&mut stream).await? else {
                        return Ok(());
                    };
                    if data_line == "." {
                        break;
                    }
                    data.push_str(&data_line);
                    data.push_str("\r\n");
                }
                let rejection = recipients
                    .iter()
                    .find_map(|r| config.rejected_data.get(r))
                    .cloned();
                let answer = match rejection {
                    Some(rejection) => rejection.line(),
                    None => {
                        state.lock().unwrap().delivered.push(Delivered {
                            from: from.clone(),
                            recipients: recipients.clone(),
                            data,
                            tls,
                        });
                        let delay = recipients.iter().find_map(|r| config.slow_data.get(r));
                        if let Some(delay) = delay {
                            tokio::time::sleep(*delay).await;
                        }
                        "250 2.0.0 OK queued\r\n".to_string()
                    }
                };
                recipients.clear();
                answer
            }
        } else if upper == "RSET" {
            from.clear();
            recipients.clear();
            "250 2.0.0 OK\r\n".to_string()
        } else if upper == "QUIT" {
            reply(&mut stream, "221 2.0.0 Bye\r\n").await?;
            return Ok(());
        } else {
            "502 5.5.2 Command not recognized\r\n".to_string()
        };

        reply(&mut stream, &answer).await?;
    }
}

async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> std::io::Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
}

fn angle_addr(line: &str) -> String {
    let start = line.find('<').map_or(0, |i| i + 1);
    let end = line.rfind('>').unwrap_or(line.len());
    line[start..end].to_string()
}
