//! Bulk dispatch: one session, one message per recipient, progress as events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::email::Email;
use crate::errors::MailerError;
use crate::event::{EventSink, ProgressEvent};
use crate::logger::Logger;
use crate::request::SendRequest;
use crate::session::{Credentials, MailerOptions, SmtpSession};

/// How a dispatch ended. Mirrors the terminal event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The recipient loop ran; `sent <= total`.
    Completed { sent: usize, total: usize },
    /// Connecting or logging in failed; nothing was sent.
    Aborted { cause: String },
}

impl DispatchOutcome {
    fn into_event(self) -> ProgressEvent {
        match self {
            Self::Completed { sent, total } => ProgressEvent::Summary { sent, total },
            Self::Aborted { cause } => ProgressEvent::Fatal { cause },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Authenticating,
    Sending(usize),
    Closing,
}

/// Runs bulk sends, one at a time.
///
/// A second [`Dispatcher::start`] or [`Dispatcher::run`] while one is in
/// flight fails with [`MailerError::Busy`]. The dispatcher becomes free
/// again as the terminal event goes out.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    options: MailerOptions,
    busy: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(options: MailerOptions) -> Self {
        Self {
            options,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn options(&self) -> &MailerOptions {
        &self.options
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Spawn the dispatch on its own tokio task and return immediately.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, request: SendRequest) -> Result<DispatchHandle, MailerError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(MailerError::Busy)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));

        let options = self.options.clone();
        let cancelled = Arc::clone(&cancel);
        let join = tokio::spawn(async move {
            let mut sink = ReleasingSink::new(tx, guard);
            dispatch(&options, &request, &mut sink, &cancelled).await
        });

        Ok(DispatchHandle {
            events: rx,
            join,
            cancel,
        })
    }

    /// Dispatch on the current task, returning once the terminal event is out.
    pub async fn run<S: EventSink>(
        &self,
        request: &SendRequest,
        sink: &mut S,
    ) -> Result<DispatchOutcome, MailerError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(MailerError::Busy)?;
        let mut sink = ReleasingSink::new(sink, guard);
        Ok(dispatch(&self.options, request, &mut sink, &AtomicBool::new(false)).await)
    }
}

/// A running dispatch started by [`Dispatcher::start`].
pub struct DispatchHandle {
    events: mpsc::UnboundedReceiver<ProgressEvent>,
    join: JoinHandle<DispatchOutcome>,
    cancel: Arc<AtomicBool>,
}

impl DispatchHandle {
    /// Next event, or `None` once the terminal event has been taken.
    pub async fn next_event(&mut self) -> Option<ProgressEvent> {
        self.events.recv().await
    }

    /// Stop before the next recipient. Messages already handed to the
    /// server are not recalled.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Drain the remaining events and wait for the task to end.
    pub async fn finish(mut self) -> Result<(Vec<ProgressEvent>, DispatchOutcome), MailerError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.join.await?;
        Ok((events, outcome))
    }
}

struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Frees the dispatcher just before the terminal event reaches the caller,
/// so a caller reacting to it can start the next dispatch.
struct ReleasingSink<S> {
    inner: S,
    guard: Option<BusyGuard>,
}

impl<S> ReleasingSink<S> {
    fn new(inner: S, guard: BusyGuard) -> Self {
        Self {
            inner,
            guard: Some(guard),
        }
    }
}

impl<S: EventSink> EventSink for ReleasingSink<S> {
    fn emit(&mut self, event: ProgressEvent) {
        if event.is_terminal() {
            self.guard.take();
        }
        self.inner.emit(event);
    }
}

async fn dispatch<S: EventSink>(
    options: &MailerOptions,
    request: &SendRequest,
    sink: &mut S,
    cancelled: &AtomicBool,
) -> DispatchOutcome {
    let logger = Logger::new(
        options.log_level,
        format!("[BulkMailer:{}:{}] ", request.host(), request.port()),
    );
    let outcome = send_all(options, request, sink, cancelled, &logger).await;
    match &outcome {
        DispatchOutcome::Completed { sent, total } => {
            logger.info(&format!("dispatch finished, {sent}/{total} sent"))
        }
        DispatchOutcome::Aborted { cause } => logger.error(&format!("dispatch aborted: {cause}")),
    }
    sink.emit(outcome.clone().into_event());
    outcome
}

async fn send_all<S: EventSink>(
    options: &MailerOptions,
    request: &SendRequest,
    sink: &mut S,
    cancelled: &AtomicBool,
    logger: &Logger,
) -> DispatchOutcome {
    sink.emit(ProgressEvent::info(format!(
        "connecting to {}:{}",
        request.host(),
        request.port()
    )));
    let mut session = match open_session(options, request, logger).await {
        Ok(session) => Some(session),
        Err(e) => return DispatchOutcome::Aborted { cause: e.to_string() },
    };
    sink.emit(ProgressEvent::info("logged in, starting send"));

    let recipients: Vec<&str> = request.deliverable_recipients().collect();
    let total = recipients.len();
    let mut sent = 0;
    // Set when a reconnect fails; every remaining recipient fails with it.
    let mut lost: Option<String> = None;

    for (i, recipient) in recipients.into_iter().enumerate() {
        if cancelled.load(Ordering::Acquire) {
            logger.info(&format!("cancelled before recipient {}/{total}", i + 1));
            sink.emit(ProgressEvent::info("cancelled"));
            break;
        }

        let index = i + 1;
        logger.debug(&format!("{:?}", Phase::Sending(index)));

        if session.is_none() && lost.is_none() {
            sink.emit(ProgressEvent::info("connection lost, reconnecting"));
            match open_session(options, request, logger).await {
                Ok(fresh) => session = Some(fresh),
                Err(e) => lost = Some(format!("reconnect failed: {e}")),
            }
        }
        let Some(active) = session.as_mut() else {
            let cause = lost.clone().unwrap_or_default();
            sink.emit(ProgressEvent::Failed {
                index,
                total,
                address: recipient.to_string(),
                cause,
            });
            continue;
        };

        let mut email = Email::for_recipient(request, recipient);
        match active.send(&mut email).await {
            Ok(_) => {
                sent += 1;
                sink.emit(ProgressEvent::Sent {
                    index,
                    total,
                    address: recipient.to_string(),
                });
            }
            Err(e) => {
                logger.warn(&format!("[{index}/{total}] {recipient}: {e}"));
                sink.emit(ProgressEvent::Failed {
                    index,
                    total,
                    address: recipient.to_string(),
                    cause: e.to_string(),
                });
                if !active.is_open() {
                    session = None;
                } else if let Err(e) = active.reset().await {
                    logger.debug(&format!("RSET after failure: {e}"));
                    if !active.is_open() {
                        session = None;
                    }
                }
            }
        }
    }

    logger.debug(&format!("{:?}", Phase::Closing));
    if let Some(session) = session {
        if let Err(e) = session.close().await {
            logger.warn(&format!("error while closing session: {e}"));
        }
    }

    DispatchOutcome::Completed { sent, total }
}

/// Connect and log in as the sender.
async fn open_session(
    options: &MailerOptions,
    request: &SendRequest,
    logger: &Logger,
) -> Result<SmtpSession, MailerError> {
    logger.debug(&format!("{:?}", Phase::Connecting));
    let mut session = SmtpSession::connect(request.host(), request.port(), options.clone()).await?;
    if !session.is_tls() {
        logger.warn("session is not encrypted");
    }

    logger.debug(&format!("{:?}", Phase::Authenticating));
    let credentials = Credentials {
        username: request.sender().to_string(),
        password: request.credential().to_string(),
    };
    session.authenticate(&credentials).await?;
    Ok(session)
}
