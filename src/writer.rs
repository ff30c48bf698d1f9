//! Per-socket writer task.
//!
//! Every link owns one writer task fed through an mpsc channel, so the
//! coordinator, responders and busy signallers never share a socket lock and
//! frames queued back-to-back leave in a single vectored write.
//!
//! ```text
//! Coordinator ─┐
//! Responder   ─┼─► mpsc::Sender<Bytes> ─► Writer Task ─► TcpStream (write half)
//! Busy ticker ─┘
//! ```

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::protocol::WireFrame;

/// Default maximum queued frames before senders start waiting.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default timeout for a sender stuck behind a full queue.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames drained from the queue per vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Limits for one writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Queued frames at which senders start waiting.
    pub max_pending_frames: usize,
    /// How long a sender waits for the queue to drain.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

impl From<&ShareConfig> for WriterConfig {
    /// A peer that drains nothing for a whole busy timeout is treated like a
    /// silent one, so the queue shares the receive side's limits.
    fn from(config: &ShareConfig) -> Self {
        Self {
            max_pending_frames: config.event_capacity,
            backpressure_timeout: config.busy_timeout(),
        }
    }
}

/// Queue depth shared by every handle and the writer task.
#[derive(Debug, Default)]
struct Queue {
    pending: AtomicUsize,
    drained: Notify,
}

impl Queue {
    fn depth(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn push(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    fn pop(&self, count: usize) {
        self.pending.fetch_sub(count, Ordering::AcqRel);
        self.drained.notify_waiters();
    }
}

/// Cheaply cloneable handle for queueing frames on one socket.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Bytes>,
    queue: Arc<Queue>,
    max_pending: usize,
    timeout: Duration,
}

impl std::fmt::Debug for WriterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterHandle")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WriterHandle {
    /// Queue a frame, waiting while the socket is behind.
    pub async fn send(&self, frame: &WireFrame) -> Result<()> {
        self.send_encoded(frame.encode()).await
    }

    /// Queue already-encoded frame bytes.
    pub async fn send_encoded(&self, bytes: Bytes) -> Result<()> {
        self.wait_for_room().await?;
        self.enqueue(bytes)
    }

    /// Queue a frame without waiting.
    ///
    /// Fails with [`ShareError::BackpressureTimeout`] straight away when the
    /// queue is full.
    pub fn try_send(&self, frame: &WireFrame) -> Result<()> {
        if self.is_backpressure_active() {
            return Err(ShareError::BackpressureTimeout);
        }
        self.enqueue(frame.encode())
    }

    fn enqueue(&self, bytes: Bytes) -> Result<()> {
        self.queue.push();
        self.tx.send(bytes).map_err(|_| {
            self.queue.pop(1);
            ShareError::ConnectionClosed
        })
    }

    async fn wait_for_room(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            // Registered before the check so a drain in between is not lost.
            let drained = self.queue.drained.notified();

            if self.is_closed() {
                return Err(ShareError::ConnectionClosed);
            }
            if !self.is_backpressure_active() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                return Err(ShareError::BackpressureTimeout);
            }
        }
    }

    /// Whether senders are currently throttled.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.queue.depth() >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.queue.depth()
    }

    /// True once the writer task has exited.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for queueing frames.
///
/// The task ends when every handle is dropped or a write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(Queue::default());

    let handle = WriterHandle {
        tx,
        queue: queue.clone(),
        max_pending: config.max_pending_frames.max(1),
        timeout: config.backpressure_timeout,
    };

    (handle, tokio::spawn(writer_loop(rx, writer, queue)))
}

/// Spawn the writer task with default limits.
pub fn spawn_writer_task_default<W>(writer: W) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    spawn_writer_task(writer, WriterConfig::default())
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    queue: Arc<Queue>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let result = write_batch(&mut writer, &batch).await;
        queue.pop(batch.len());
        batch.clear();

        if let Err(e) = result {
            tracing::debug!(error = %e, "writer task stopping");
            rx.close();
            queue.drained.notify_waiters();
            return Err(e);
        }
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write encoded frames with scatter/gather I/O, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, batch: &[Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(Bytes::len).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ShareError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Slices covering everything after the first `skip_bytes` of the batch.
fn build_remaining_slices(batch: &[Bytes], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}
