//! Bounded fan-out of script output.
//!
//! [`tee`] splits one byte stream into two independent consumers, each backed
//! by its own [`OutputBuffer`]:
//!
//! - a [`LiveOutput`] that observers drain while the script is still running;
//! - a [`Capture`] that keeps everything (up to its cap) for persistence.
//!
//! Both buffers drop their oldest bytes once full, so a chatty script can
//! never grow memory past `2 × capacity` per stream.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::OutputStream;

/// Bytes requested per read from the source stream.
const READ_CHUNK_BYTES: usize = 8 * 1024;

// ---------------------------------------------------------------------------
// OutputBuffer
// ---------------------------------------------------------------------------

/// Byte ring buffer with a hard cap. Overflow evicts the oldest bytes.
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    dropped: u64,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    /// Append `chunk`, evicting from the front when the cap is exceeded.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.capacity {
            let keep_from = chunk.len() - self.capacity;
            self.dropped += (self.data.len() + keep_from) as u64;
            self.data.clear();
            self.data.extend(&chunk[keep_from..]);
            return;
        }

        let overflow = (self.data.len() + chunk.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.data.drain(..overflow);
            self.dropped += overflow as u64;
        }
        self.data.extend(chunk);
    }

    /// Remove and return everything currently buffered.
    pub fn take(&mut self) -> Vec<u8> {
        self.data.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Copy the buffered bytes out as UTF-8, replacing invalid sequences.
    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.data.as_slices();
        let mut bytes = Vec::with_capacity(self.data.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

fn lock(buffer: &Mutex<OutputBuffer>) -> MutexGuard<'_, OutputBuffer> {
    buffer.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// LiveOutput
// ---------------------------------------------------------------------------

struct LiveShared {
    buffer: Mutex<OutputBuffer>,
    notify: Notify,
    closed: AtomicBool,
}

/// Live view of a running script's stream.
///
/// Clones share one buffer: a byte is handed to whichever reader drains it
/// first.
#[derive(Clone)]
pub struct LiveOutput {
    shared: Arc<LiveShared>,
}

impl LiveOutput {
    fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(LiveShared {
                buffer: Mutex::new(OutputBuffer::new(capacity)),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Drain whatever is buffered right now without waiting.
    pub fn read(&self) -> Vec<u8> {
        lock(&self.shared.buffer).take()
    }

    /// Wait for the next bytes. Returns `None` once the stream has ended and
    /// everything buffered has been read.
    pub async fn next_chunk(&self) -> Option<Vec<u8>> {
        loop {
            // Register before checking so a push between check and await is not lost.
            let notified = self.shared.notify.notified();
            {
                let mut buffer = lock(&self.shared.buffer);
                if !buffer.is_empty() {
                    return Some(buffer.take());
                }
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Read until the stream ends and return everything as lossy UTF-8.
    pub async fn read_to_end(&self) -> String {
        let mut bytes = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            bytes.extend_from_slice(&chunk);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes evicted because nobody drained the live buffer in time.
    pub fn dropped_bytes(&self) -> u64 {
        lock(&self.shared.buffer).dropped()
    }

    fn push(&self, chunk: &[u8]) {
        lock(&self.shared.buffer).push(chunk);
        self.shared.notify.notify_waiters();
    }

    fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl std::fmt::Debug for LiveOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveOutput")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

/// Output retained for persistence after the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub text: String,
    /// Oldest bytes evicted because the stream exceeded the buffer cap.
    pub dropped_bytes: u64,
}

/// Persistence-side consumer created by [`tee`].
pub struct Capture {
    buffer: Arc<Mutex<OutputBuffer>>,
    live: LiveOutput,
    task: JoinHandle<()>,
}

impl Capture {
    /// Wait up to `grace` for the stream to end, then snapshot the buffer.
    ///
    /// A stream still open after `grace` (e.g. a grandchild process holding
    /// the pipe) is abandoned and whatever was read so far is returned.
    pub async fn collect(self, grace: Duration) -> CapturedOutput {
        let Capture {
            buffer,
            live,
            mut task,
        } = self;

        if tokio::time::timeout(grace, &mut task).await.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "output stream still open after grace period, abandoning"
            );
            task.abort();
            live.close();
        }

        let buffer = lock(&buffer);
        CapturedOutput {
            text: buffer.to_string_lossy(),
            dropped_bytes: buffer.dropped(),
        }
    }
}

/// Split `source` into a live consumer and a capture consumer, each capped
/// at `capacity` bytes.
pub fn tee(mut source: OutputStream, capacity: usize) -> (LiveOutput, Capture) {
    let live = LiveOutput::new(capacity);
    let buffer = Arc::new(Mutex::new(OutputBuffer::new(capacity)));

    let live_writer = live.clone();
    let capture_writer = Arc::clone(&buffer);

    let task = tokio::spawn(async move {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    live_writer.push(&chunk[..n]);
                    lock(&capture_writer).push(&chunk[..n]);
                }
                Err(e) => {
                    warn!(error = %e, "output stream read failed");
                    break;
                }
            }
        }
        live_writer.close();
        debug!("output stream drained");
    });

    (
        live.clone(),
        Capture {
            buffer,
            live,
            task,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn stream(bytes: &[u8]) -> OutputStream {
        Box::pin(Cursor::new(bytes.to_vec()))
    }

    #[test]
    fn buffer_within_capacity_keeps_everything() {
        let mut buffer = OutputBuffer::new(16);
        buffer.push(b"hello ");
        buffer.push(b"world");
        assert_eq!(buffer.to_string_lossy(), "hello world");
        assert_eq!(buffer.dropped(), 0);
    }

    #[test]
    fn buffer_overflow_evicts_oldest_bytes() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push(b"abcdef");
        buffer.push(b"ghij");
        assert_eq!(buffer.to_string_lossy(), "cdefghij");
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.len(), 8);
    }

    #[test]
    fn oversized_chunk_keeps_its_tail() {
        let mut buffer = OutputBuffer::new(4);
        buffer.push(b"xy");
        buffer.push(b"0123456789");
        assert_eq!(buffer.to_string_lossy(), "6789");
        assert_eq!(buffer.dropped(), 8);
    }

    #[test]
    fn take_empties_the_buffer() {
        let mut buffer = OutputBuffer::new(8);
        buffer.push(b"abc");
        assert_eq!(buffer.take(), b"abc".to_vec());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn tee_feeds_both_consumers_independently() {
        let (live, capture) = tee(stream(b"line one\nline two\n"), 1024);

        let live_text = live.read_to_end().await;
        let captured = capture.collect(Duration::from_secs(1)).await;

        assert_eq!(live_text, "line one\nline two\n");
        assert_eq!(captured.text, "line one\nline two\n");
        assert_eq!(captured.dropped_bytes, 0);
    }

    #[tokio::test]
    async fn undrained_live_consumer_does_not_limit_capture() {
        let payload = vec![b'x'; 64 * 1024];
        let (live, capture) = tee(stream(&payload), 100 * 1024);

        let captured = capture.collect(Duration::from_secs(1)).await;
        assert_eq!(captured.text.len(), 64 * 1024);
        assert!(live.is_closed());
        assert_eq!(live.read().len(), 64 * 1024);
    }

    #[tokio::test]
    async fn capture_is_capped() {
        let payload = vec![b'y'; 10_000];
        let (live, capture) = tee(stream(&payload), 1_000);

        let captured = capture.collect(Duration::from_secs(1)).await;
        assert_eq!(captured.text.len(), 1_000);
        assert_eq!(captured.dropped_bytes, 9_000);
        assert_eq!(live.dropped_bytes(), 9_000);
    }

    #[tokio::test]
    async fn stalled_stream_is_abandoned_after_grace() {
        let (_writer, reader) = tokio::io::duplex(64);
        let (live, capture) = tee(Box::pin(reader), 1024);

        let captured = capture.collect(Duration::from_millis(50)).await;
        assert_eq!(captured, CapturedOutput::default());
        assert!(live.is_closed());
        assert_eq!(live.next_chunk().await, None);
    }
}
