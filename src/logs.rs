//! Workflow log lines and the channel that carries them to the caller.
//!
//! Producers hold a [`LogSink`]; the caller pulls lines from the paired
//! [`LogStream`] at its own pace. The stream ends once every sink is gone.

use chrono::{DateTime, Utc};
use futures_util::Stream;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    Info,
}

impl LogSource {
    pub fn prefix(&self) -> &'static str {
        match self {
            LogSource::Stdout => "[stdout] ",
            LogSource::Stderr => "[stderr] ",
            LogSource::Info => "[info] ",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub source: LogSource,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(source: LogSource, text: impl Into<String>) -> Self {
        Self {
            source,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.source.prefix(), self.text)
    }
}

/// Sending half. Cheap to clone; sends never block and never fail the producer.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl LogSink {
    /// A sink nobody listens to.
    pub fn discard() -> Self {
        let (sink, _stream) = channel();
        sink
    }

    pub fn send(&self, line: LogLine) {
        // consumer may have gone away; the capture buffers still hold everything
        let _ = self.tx.send(line);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(LogLine::new(LogSource::Info, message));
    }
}

/// Receiving half: a finite, non-restartable sequence of log lines.
#[derive(Debug)]
pub struct LogStream {
    rx: mpsc::UnboundedReceiver<LogLine>,
}

impl LogStream {
    pub async fn next_line(&mut self) -> Option<LogLine> {
        self.rx.recv().await
    }
}

impl Stream for LogStream {
    type Item = LogLine;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub fn channel() -> (LogSink, LogStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LogSink { tx }, LogStream { rx })
}
