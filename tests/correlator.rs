//! Send-and-wait against a scripted server.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{free_port, init_tracing, test_config};
use sqlite_share::protocol::{MessageKind, WireFrame};
use sqlite_share::{ConnectionCoordinator, FrameHandler, RequestCorrelator, Responder, Role, ShareError};

/// Answers `ExecuteNonQueryRequest` after `busy_rounds` busy signals spaced
/// by `spacing`; never answers anything else.
struct Scripted {
    busy_rounds: u32,
    spacing: Duration,
}

impl FrameHandler for Scripted {
    fn on_received(&self, frame: WireFrame, responder: Responder) {
        if frame.kind() != MessageKind::ExecuteNonQueryRequest || !responder.is_correlated() {
            return;
        }
        let rounds = self.busy_rounds;
        let spacing = self.spacing;
        tokio::spawn(async move {
            for _ in 0..rounds {
                tokio::time::sleep(spacing).await;
                responder.busy().await.unwrap();
            }
            let reply = WireFrame::from_scalar(MessageKind::ExecuteNonQueryResponseSuccess, 7i64);
            responder.respond(reply).await.unwrap();
        });
    }
}

async fn pair(handler: Scripted) -> (ConnectionCoordinator, RequestCorrelator) {
    let port = free_port();
    let server = ConnectionCoordinator::with_handler(test_config(port), Arc::new(handler));
    assert_eq!(server.connect().await.unwrap(), Role::Server);

    let client = ConnectionCoordinator::new(test_config(port));
    assert_eq!(client.connect().await.unwrap(), Role::Client);

    (server, RequestCorrelator::new(client))
}

#[tokio::test]
async fn test_busy_signals_keep_request_alive() {
    init_tracing();
    let (_server, correlator) = pair(Scripted {
        busy_rounds: 10,
        spacing: Duration::from_millis(500),
    })
    .await;

    let started = Instant::now();
    let reply = correlator
        .send_and_wait(
            WireFrame::empty(MessageKind::ExecuteNonQueryRequest),
            Duration::from_millis(1000),
        )
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(4500));
    assert_eq!(reply.kind(), MessageKind::ExecuteNonQueryResponseSuccess);
    assert_eq!(reply.get::<i64>().unwrap(), 7);
}

#[tokio::test]
async fn test_silence_times_out() {
    init_tracing();
    let (_server, correlator) = pair(Scripted {
        busy_rounds: 0,
        spacing: Duration::ZERO,
    })
    .await;

    let started = Instant::now();
    let result = correlator
        .send_and_wait(
            WireFrame::empty(MessageKind::CreateCommandRequest),
            Duration::from_millis(1000),
        )
        .await;
    let elapsed = started.elapsed();

    match result {
        Err(ShareError::Timeout { kind, .. }) => assert_eq!(kind, MessageKind::CreateCommandRequest),
        other => panic!("expected a timeout, got {:?}", other),
    }
    assert!(elapsed >= Duration::from_millis(950), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(2000), "{:?}", elapsed);
}

#[tokio::test]
async fn test_concurrent_waiters_get_their_own_answers() {
    init_tracing();
    let (_server, correlator) = pair(Scripted {
        busy_rounds: 1,
        spacing: Duration::from_millis(50),
    })
    .await;

    let waits = (0..8).map(|_| {
        let correlator = correlator.clone();
        tokio::spawn(async move {
            correlator
                .send_and_wait(
                    WireFrame::empty(MessageKind::ExecuteNonQueryRequest),
                    Duration::from_secs(2),
                )
                .await
        })
    });

    for wait in waits.collect::<Vec<_>>() {
        let reply = wait.await.unwrap().unwrap();
        assert_eq!(reply.get::<i64>().unwrap(), 7);
    }
}

#[tokio::test]
async fn test_server_loss_aborts_wait() {
    init_tracing();
    let (server, correlator) = pair(Scripted {
        busy_rounds: 0,
        spacing: Duration::ZERO,
    })
    .await;

    let wait = tokio::spawn(async move {
        correlator
            .send_and_wait(
                WireFrame::empty(MessageKind::CreateCommandRequest),
                Duration::from_secs(30),
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    server.disconnect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("wait was not aborted")
        .unwrap();
    assert!(matches!(result, Err(ShareError::ConnectionClosed)));
}

#[tokio::test]
async fn test_server_role_cannot_send_and_wait() {
    let port = free_port();
    let server = ConnectionCoordinator::new(test_config(port));
    server.connect().await.unwrap();

    let correlator = RequestCorrelator::new(server);
    let result = correlator
        .send_and_wait(WireFrame::empty(MessageKind::CreateCommandRequest), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(ShareError::InvalidState(_))));
}
