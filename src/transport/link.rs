//! One connected socket as seen by the coordinator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::writer::WriterHandle;

/// A connected socket: its writer handle plus the tasks driving it.
///
/// The reader task clears `alive` when it sees EOF or a read error.
/// Dropping the link aborts both tasks, which closes the socket.
#[derive(Debug)]
pub struct PeerLink {
    peer_addr: Option<SocketAddr>,
    writer: WriterHandle,
    alive: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<Result<()>>,
}

impl PeerLink {
    /// Assemble a link from its already spawned tasks.
    pub fn new(
        peer_addr: Option<SocketAddr>,
        writer: WriterHandle,
        writer_task: JoinHandle<Result<()>>,
        alive: Arc<AtomicBool>,
        reader_task: JoinHandle<()>,
    ) -> Self {
        Self {
            peer_addr,
            writer,
            alive,
            reader_task,
            writer_task,
        }
    }

    /// Remote address, when the OS reported one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Handle for queueing frames on this socket.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

/// Liveness check: the peer has not hung up and both halves are running.
pub fn is_connected(link: &PeerLink) -> bool {
    link.alive.load(Ordering::Acquire)
        && !link.reader_task.is_finished()
        && !link.writer_task.is_finished()
        && !link.writer.is_closed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::spawn_writer_task_default;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_liveness_follows_alive_flag() {
        let (client, _server) = duplex(64);
        let (writer, writer_task) = spawn_writer_task_default(client);
        let alive = Arc::new(AtomicBool::new(true));
        let reader_task = tokio::spawn(std::future::pending::<()>());

        let link = PeerLink::new(None, writer, writer_task, alive.clone(), reader_task);
        assert!(is_connected(&link));

        alive.store(false, Ordering::Release);
        assert!(!is_connected(&link));
    }

    #[tokio::test]
    async fn test_liveness_detects_finished_reader() {
        let (client, _server) = duplex(64);
        let (writer, writer_task) = spawn_writer_task_default(client);
        let reader_task = tokio::spawn(async {});
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let link = PeerLink::new(
            None,
            writer,
            writer_task,
            Arc::new(AtomicBool::new(true)),
            reader_task,
        );
        assert!(!is_connected(&link));
    }
}
