//! Progress events and the sinks that receive them.

use std::fmt;

/// One step of a dispatch, in emission order.
///
/// Every dispatch ends with exactly one terminal event: [`ProgressEvent::Fatal`]
/// or [`ProgressEvent::Summary`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgressEvent {
    Info {
        message: String,
    },
    Sent {
        index: usize,
        total: usize,
        address: String,
    },
    Failed {
        index: usize,
        total: usize,
        address: String,
        cause: String,
    },
    Fatal {
        cause: String,
    },
    Summary {
        sent: usize,
        total: usize,
    },
}

impl ProgressEvent {
    pub fn info(message: impl Into<String>) -> Self {
        Self::Info {
            message: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fatal { .. } | Self::Summary { .. })
    }
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info { message } => f.write_str(message),
            Self::Sent {
                index,
                total,
                address,
            } => write!(f, "[{index}/{total}] Sent to {address}"),
            Self::Failed {
                index,
                total,
                address,
                cause,
            } => write!(f, "[{index}/{total}] FAILED {address}: {cause}"),
            Self::Fatal { cause } => write!(f, "ERROR: {cause}"),
            Self::Summary { sent, total } => write!(f, "Done. Sent {sent}/{total} messages."),
        }
    }
}

/// Receives progress events in the order they are emitted.
///
/// A sink that can no longer deliver (e.g. a dropped receiver) drops the
/// event; the dispatch carries on regardless.
pub trait EventSink {
    fn emit(&mut self, event: ProgressEvent);
}

impl EventSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        if self.send(event).is_err() {
            tracing::debug!(target: "bulk_mailer", "progress receiver dropped");
        }
    }
}

impl EventSink for std::sync::mpsc::Sender<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        if self.send(event).is_err() {
            tracing::debug!(target: "bulk_mailer", "progress receiver dropped");
        }
    }
}

impl EventSink for Vec<ProgressEvent> {
    fn emit(&mut self, event: ProgressEvent) {
        self.push(event);
    }
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn emit(&mut self, event: ProgressEvent) {
        (**self).emit(event);
    }
}

/// Adapts a closure into a sink, for callers that want a callback.
pub struct FnSink<F>(pub F);

impl<F: FnMut(ProgressEvent)> EventSink for FnSink<F> {
    fn emit(&mut self, event: ProgressEvent) {
        (self.0)(event);
    }
}
