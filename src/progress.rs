//! Byte-progress tracking for uploads and downloads
//!
//! A tracker measures bytes moved for one task id and reports fractional
//! completion through the event bus. The final chunk always forces an
//! emission of exactly `1.0`, and a cancelled task emits nothing further.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::events::{ClientEvent, EventBus};

/// Transfer direction, selecting which progress event is emitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request body upload
    Upload,
    /// Response body download
    Download,
}

/// Completed fraction rounded to two decimal places.
///
/// Unknown or zero totals report `0.0` until completion is forced.
pub(crate) fn fraction_completed(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        Some(total) if total > 0 => {
            let fraction = bytes as f64 / total as f64;
            (fraction * 100.0).round() / 100.0
        }
        _ => 0.0,
    }
}

/// Progress state for one transfer task
#[derive(Debug)]
pub struct ProgressTracker {
    task_id: String,
    direction: Direction,
    bus: EventBus,
    cancelled: Arc<AtomicBool>,
    bytes: u64,
    total: Option<u64>,
    last_fraction: Option<f64>,
    finished: bool,
}

impl ProgressTracker {
    /// Create a tracker for a task.
    ///
    /// `skip_bytes` initializes the byte counter for resumed transfers; the
    /// caller is responsible for advancing the underlying stream past the
    /// skipped prefix.
    pub fn new(
        task_id: impl Into<String>,
        direction: Direction,
        total: Option<u64>,
        skip_bytes: u64,
        bus: EventBus,
        cancelled: Arc<AtomicBool>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            direction,
            bus,
            cancelled,
            bytes: skip_bytes,
            total,
            last_fraction: None,
            finished: false,
        }
    }

    /// Bytes transferred so far, including any skipped prefix
    pub fn bytes_read(&self) -> u64 {
        self.bytes
    }

    /// Record a transferred chunk, emitting when the rounded fraction moved
    pub fn record(&mut self, chunk_len: u64) {
        self.bytes += chunk_len;
        let fraction = fraction_completed(self.bytes, self.total);
        if self.last_fraction != Some(fraction) {
            self.emit(fraction);
        }
    }

    /// Force the terminal emission of `1.0`.
    ///
    /// Emitted at most once, even if `finish` is called repeatedly.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.emit(1.0);
    }

    fn emit(&mut self, fraction: f64) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.last_fraction = Some(fraction);
        let event = match self.direction {
            Direction::Upload => ClientEvent::UploadProgress {
                task_id: self.task_id.clone(),
                fraction_completed: fraction,
                bytes_read: self.bytes,
            },
            Direction::Download => ClientEvent::DownloadProgress {
                task_id: self.task_id.clone(),
                fraction_completed: fraction,
                bytes_read: self.bytes,
            },
        };
        self.bus.emit(event);
    }
}

/// An [`AsyncRead`] wrapper that reports progress as its inner stream drains.
///
/// Used for uploads: the request body streams through this reader and every
/// chunk handed to the transport is counted. EOF forces the final `1.0`.
#[derive(Debug)]
pub struct ProgressReader<R> {
    inner: R,
    tracker: ProgressTracker,
}

impl<R> ProgressReader<R> {
    /// Wrap a stream with progress tracking
    pub fn new(inner: R, tracker: ProgressTracker) -> Self {
        Self { inner, tracker }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let read = buf.filled().len() - before;
                if read == 0 {
                    this.tracker.finish();
                } else {
                    this.tracker.record(read as u64);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
