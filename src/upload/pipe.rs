//! In-process byte pipe
//!
//! Connects the upload producer task to the request body. Bytes arrive at
//! the reader in exactly the order they were written. Unlike a plain
//! duplex stream, the writer can close the pipe with an error, and the
//! reader reports it as a failed body rather than a short one.
//!
//! Closing with an error never waits for channel capacity: the error is
//! parked in a shared slot and surfaces after the buffered chunks.

use bytes::Bytes;
use futures::Stream;
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Create a pipe buffering up to `capacity` chunks (at least one)
pub fn pipe(capacity: usize) -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let error = Arc::new(Mutex::new(None));
    (
        PipeWriter {
            tx,
            error: Arc::clone(&error),
        },
        PipeReader {
            rx,
            error,
            finished: false,
        },
    )
}

/// Producer end of a [`pipe`]
#[derive(Debug)]
pub struct PipeWriter {
    tx: mpsc::Sender<Bytes>,
    error: Arc<Mutex<Option<io::Error>>>,
}

impl PipeWriter {
    /// Queue a chunk, waiting while the pipe is full
    ///
    /// Fails with `BrokenPipe` once the reader has been dropped.
    pub async fn write(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "pipe reader closed"))
    }

    /// Clean end of stream
    pub fn close(self) {
        drop(self);
    }

    /// End the stream with `err`, delivered after any buffered chunks
    ///
    /// Returns immediately even when the pipe is full or the reader has
    /// stopped polling.
    pub fn close_with_error(self, err: io::Error) {
        *self.error.lock() = Some(err);
    }
}

/// Consumer end of a [`pipe`]
#[derive(Debug)]
pub struct PipeReader {
    rx: mpsc::Receiver<Bytes>,
    error: Arc<Mutex<Option<io::Error>>>,
    finished: bool,
}

impl Stream for PipeReader {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {
                // The sender is gone, so the slot is final.
                self.finished = true;
                match self.error.lock().take() {
                    Some(err) => Poll::Ready(Some(Err(err))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
