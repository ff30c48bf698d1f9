//! Reply handle passed alongside each received frame.
//!
//! A correlated responder wraps whatever the handler sends into a
//! `SendAndWaitResponse` envelope carrying the original correlation id, so
//! handler logic never deals with correlation itself.

use crate::coordinator::PeerId;
use crate::error::Result;
use crate::protocol::{CorrelatedEnvelope, CorrelationId, MessageKind, WireFrame};
use crate::writer::WriterHandle;

/// Sends frames back on the socket a request arrived on.
///
/// `Responder` is `Clone`; busy signals and the final response may come
/// from different tasks.
#[derive(Debug, Clone)]
pub struct Responder {
    writer: Option<WriterHandle>,
    correlation: Option<CorrelationId>,
    peer: Option<PeerId>,
}

impl Responder {
    /// Responder for a plain (uncorrelated) frame.
    pub fn new(writer: WriterHandle) -> Self {
        Self {
            writer: Some(writer),
            correlation: None,
            peer: None,
        }
    }

    /// Responder for the inner request of a `SendAndWaitRequest`.
    pub fn correlated(writer: WriterHandle, correlation: CorrelationId) -> Self {
        Self {
            writer: Some(writer),
            correlation: Some(correlation),
            peer: None,
        }
    }

    /// Responder that drops everything; used when executing locally.
    pub fn detached() -> Self {
        Self {
            writer: None,
            correlation: None,
            peer: None,
        }
    }

    /// Tag the responder with the peer the request came from.
    pub fn from_peer(mut self, peer: PeerId) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Peer the request came from; `None` for local requests.
    #[inline]
    pub fn peer(&self) -> Option<PeerId> {
        self.peer
    }

    /// Whether the sender is waiting for a correlated answer.
    #[inline]
    pub fn is_correlated(&self) -> bool {
        self.correlation.is_some()
    }

    /// Correlation id the reply will carry, if any.
    #[inline]
    pub fn correlation_id(&self) -> Option<&CorrelationId> {
        self.correlation.as_ref()
    }

    /// Send the final response.
    pub async fn respond(&self, frame: WireFrame) -> Result<()> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };

        match &self.correlation {
            Some(id) => {
                let envelope =
                    CorrelatedEnvelope::with_correlation(frame.kind(), frame.payload_bytes(), id.clone());
                writer
                    .send(&envelope.into_frame(MessageKind::SendAndWaitResponse))
                    .await
            }
            None => writer.send(&frame).await,
        }
    }

    /// Tell the waiter the request is still running.
    pub async fn busy(&self) -> Result<()> {
        self.respond(WireFrame::empty(MessageKind::SendAndWaitBusy))
            .await
    }

    /// Tell the waiter the request was abandoned after its command timeout.
    pub async fn timed_out(&self) -> Result<()> {
        self.respond(WireFrame::empty(MessageKind::SendAndWaitTimeOut))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::HEADER_SIZE;
    use crate::writer::spawn_writer_task_default;
    use tokio::io::{duplex, AsyncReadExt};

    async fn read_frame(server: &mut tokio::io::DuplexStream) -> WireFrame {
        let mut header = [0u8; HEADER_SIZE];
        server.read_exact(&mut header).await.unwrap();
        let len = i32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        let mut buf = header.to_vec();
        buf.resize(HEADER_SIZE + len, 0);
        server.read_exact(&mut buf[HEADER_SIZE..]).await.unwrap();
        WireFrame::decode(&buf).unwrap()
    }

    #[tokio::test]
    async fn test_detached_responder_swallows() {
        let responder = Responder::detached();
        assert!(!responder.is_correlated());
        assert!(responder.respond(WireFrame::empty(MessageKind::ExecuteRequestResponse)).await.is_ok());
        assert!(responder.busy().await.is_ok());
    }

    #[test]
    fn test_peer_tag() {
        assert_eq!(Responder::detached().peer(), None);
        assert_eq!(Responder::detached().from_peer(7).peer(), Some(7));
    }

    #[tokio::test]
    async fn test_plain_responder_sends_frame_unchanged() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let responder = Responder::new(writer);

        let frame = WireFrame::from_scalar(MessageKind::CancelCommandResponse, 1i32);
        responder.respond(frame.clone()).await.unwrap();

        assert_eq!(read_frame(&mut server).await, frame);
    }

    #[tokio::test]
    async fn test_correlated_responder_wraps_response() {
        let (client, mut server) = duplex(4096);
        let (writer, _task) = spawn_writer_task_default(client);
        let id = CorrelationId::new();
        let responder = Responder::correlated(writer, id.clone());

        responder.busy().await.unwrap();
        responder
            .respond(WireFrame::from_scalar(MessageKind::ExecuteNonQueryResponseSuccess, 3i32))
            .await
            .unwrap();

        let busy = read_frame(&mut server).await;
        assert_eq!(busy.kind(), MessageKind::SendAndWaitResponse);
        let envelope = CorrelatedEnvelope::from_frame(&busy).unwrap();
        assert_eq!(envelope.kind(), MessageKind::SendAndWaitBusy);
        assert_eq!(envelope.correlation_id(), &id);

        let last = read_frame(&mut server).await;
        let envelope = CorrelatedEnvelope::from_frame(&last).unwrap();
        assert_eq!(envelope.kind(), MessageKind::ExecuteNonQueryResponseSuccess);
        assert_eq!(envelope.to_frame().get::<i32>().unwrap(), 3);
    }
}
