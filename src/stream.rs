//! Hand-off between the background run and the HTTP body: an unbounded FIFO
//! of fragments terminated by an end-of-stream sentinel.

use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::protocol::{Fragment, RunFault};

#[derive(Debug)]
enum QueueItem {
    Fragment(Fragment),
    End,
}

pub fn fragment_queue() -> (FragmentSender, FragmentStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        FragmentSender { tx },
        FragmentStream {
            rx: UnboundedReceiverStream::new(rx),
            finished: false,
            _cancel: None,
        },
    )
}

#[derive(Debug, Clone)]
pub struct FragmentSender {
    tx: mpsc::UnboundedSender<QueueItem>,
}

impl FragmentSender {
    /// Returns false once the consumer has gone away.
    pub fn push(&self, fragment: Fragment) -> bool {
        self.tx.send(QueueItem::Fragment(fragment)).is_ok()
    }

    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Fragment::text(text))
    }

    pub fn push_fault(&self, fault: RunFault) -> bool {
        self.push(Fragment::Fault { error: fault })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn end(self) {
        let _ = self.tx.send(QueueItem::End);
    }
}

/// Yields fragments in queue order until the sentinel is seen. Dropping it
/// cancels the attached token, if any.
#[derive(Debug)]
pub struct FragmentStream {
    rx: UnboundedReceiverStream<QueueItem>,
    finished: bool,
    _cancel: Option<DropGuard>,
}

impl FragmentStream {
    pub fn cancel_on_drop(mut self, token: CancellationToken) -> Self {
        self._cancel = Some(token.drop_guard());
        self
    }
}

impl Stream for FragmentStream {
    type Item = Fragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(QueueItem::Fragment(fragment))) => Poll::Ready(Some(fragment)),
            Poll::Ready(Some(QueueItem::End)) => {
                self.finished = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                tracing::warn!("fragment queue closed without end-of-stream marker");
                self.finished = true;
                Poll::Ready(None)
            }
        }
    }
}
