//! Per-socket receive pipeline.
//!
//! Each socket gets a reader task that owns its [`FrameAssembler`], feeds it
//! from a fixed-size receive buffer and dispatches every completed frame:
//! first to the receive broadcast, then to the registered handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use super::{Hub, PeerId};
use crate::handler::Responder;
use crate::protocol::{CorrelatedEnvelope, FrameAssembler, MessageKind, WireFrame};
use crate::transport::PeerLink;
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Split a connected stream and start its reader and writer tasks.
pub(crate) fn open_link(stream: TcpStream, peer: PeerId, hub: Arc<Hub>) -> PeerLink {
    let peer_addr = stream.peer_addr().ok();
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(peer, error = %e, "set_nodelay failed");
    }

    let (read_half, write_half) = stream.into_split();
    let (writer, writer_task) = spawn_writer_task(write_half, WriterConfig::from(&hub.config));
    let alive = Arc::new(AtomicBool::new(true));

    let reader_task = tokio::spawn(read_loop(
        read_half,
        peer,
        writer.clone(),
        alive.clone(),
        hub,
    ));

    PeerLink::new(peer_addr, writer, writer_task, alive, reader_task)
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    peer: PeerId,
    writer: WriterHandle,
    alive: Arc<AtomicBool>,
    hub: Arc<Hub>,
) {
    let mut assembler = FrameAssembler::with_max_payload(hub.config.max_payload_size);
    let mut buf = vec![0u8; hub.config.receive_buffer_size];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(peer, "peer closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(peer, error = %e, "receive failed");
                break;
            }
        };

        if let Err(e) = assembler.queue(&buf[..n]) {
            // The stream cannot be resynchronised after a bad header.
            tracing::warn!(peer, error = %e, "malformed frame, dropping connection");
            break;
        }

        for frame in assembler.drain() {
            dispatch(&hub, peer, &writer, frame);
        }
    }

    alive.store(false, Ordering::Release);
}

fn dispatch(hub: &Hub, peer: PeerId, writer: &WriterHandle, frame: WireFrame) {
    // No subscribers is fine.
    let _ = hub.received.send(frame.clone());

    let Some(handler) = hub.handler.get() else {
        return;
    };

    if frame.kind() != MessageKind::SendAndWaitRequest {
        handler.on_received(frame, Responder::new(writer.clone()).from_peer(peer));
        return;
    }

    match CorrelatedEnvelope::from_frame(&frame) {
        Ok(envelope) => {
            let responder = Responder::correlated(writer.clone(), envelope.correlation_id().clone())
                .from_peer(peer);
            handler.on_received(envelope.to_frame(), responder);
        }
        Err(e) => {
            tracing::warn!(peer, error = %e, "dropping malformed correlated request");
        }
    }
}
