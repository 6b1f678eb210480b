//! Followed container logs.

use crate::translator::{LogLine, parse_log_line};
use crate::transport::{LineStream, TransportError};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::time::{Instant, Sleep};

/// Lazy, non-restartable sequence of log lines from `logs --follow`.
///
/// Ends when the container stops, the channel drops, or the optional
/// deadline passes. After it ends a new stream has to be requested.
pub struct LogStream {
    lines: LineStream,
    timestamps: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    finished: bool,
}

impl LogStream {
    pub(crate) fn new(lines: LineStream, timestamps: bool, deadline: Option<Instant>) -> Self {
        Self {
            lines,
            timestamps,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            finished: false,
        }
    }

    /// Wait for the next line; `None` once the stream has ended.
    pub async fn next_line(&mut self) -> Option<Result<LogLine, TransportError>> {
        self.next().await
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for LogStream {
    type Item = Result<LogLine, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                this.finished = true;
                return Poll::Ready(None);
            }
        }

        match Pin::new(&mut this.lines).poll_next(cx) {
            Poll::Ready(Some(Ok(line))) => {
                Poll::Ready(Some(Ok(parse_log_line(&line, this.timestamps))))
            }
            Poll::Ready(Some(Err(error))) => Poll::Ready(Some(Err(error))),
            Poll::Ready(None) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("lines", &self.lines)
            .field("timestamps", &self.timestamps)
            .field("finished", &self.finished)
            .finish()
    }
}
