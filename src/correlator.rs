//! Send-and-wait over the coordinator's multiplexed sockets.
//!
//! A request goes out as a `SendAndWaitRequest` envelope with a fresh
//! correlation id. The waiter watches the coordinator's receive stream for
//! a `SendAndWaitResponse` carrying that id and ignores everything else,
//! since other callers share the same socket.
//!
//! `SendAndWaitBusy` answers are keepalives: each one restarts the timeout
//! clock, so a peer that keeps signalling busy never times out locally.
//!
//! # Example
//!
//! ```ignore
//! use sqlite_share::correlator::RequestCorrelator;
//!
//! let correlator = RequestCorrelator::new(coordinator.clone());
//! let reply = correlator
//!     .send_and_wait(WireFrame::from_scalar(MessageKind::CreateCommandRequest, "select 1"), timeout)
//!     .await?;
//! ```

use std::time::Duration;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::time::Instant;

use crate::coordinator::{ConnectionCoordinator, ConnectionEvent, Role};
use crate::error::{Result, ShareError};
use crate::protocol::{CorrelatedEnvelope, MessageKind, WireFrame};

/// Floor for the per-kind busy timeout of long-running requests.
pub const MIN_BUSY_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long a waiter tolerates silence for a request of `kind`.
///
/// Requests that run SQL or wait for the advisory lock may legitimately
/// take up to `command_timeout`; their waiter tolerates a tenth of it
/// (at least [`MIN_BUSY_TIMEOUT`]) between busy signals. With no command
/// timeout, and for every other kind, `default` applies.
pub fn busy_timeout(kind: MessageKind, command_timeout: Duration, default: Duration) -> Duration {
    match kind {
        MessageKind::ExecuteNonQueryRequest
        | MessageKind::ExecuteReaderRequest
        | MessageKind::ExecuteReaderReadRequest
        | MessageKind::ExecuteReaderNextResultRequest
        | MessageKind::LockConnectionRequest => {
            if command_timeout.is_zero() {
                default
            } else {
                (command_timeout / 10).max(MIN_BUSY_TIMEOUT)
            }
        }
        _ => default,
    }
}

/// Synchronous-looking request/response on top of a client coordinator.
#[derive(Debug, Clone)]
pub struct RequestCorrelator {
    coordinator: ConnectionCoordinator,
    poll_interval: Duration,
}

impl RequestCorrelator {
    /// Correlator sending through `coordinator`, polling at the default interval.
    pub fn new(coordinator: ConnectionCoordinator) -> Self {
        let poll_interval = coordinator.config().poll_interval();
        Self {
            coordinator,
            poll_interval,
        }
    }

    /// Override the idle-poll slice.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Coordinator requests are sent through.
    pub fn coordinator(&self) -> &ConnectionCoordinator {
        &self.coordinator
    }

    /// Send `request` to the server and wait for the correlated answer.
    ///
    /// `timeout` bounds the silence since the request or the last busy
    /// signal. Returns the inner response frame.
    ///
    /// # Errors
    ///
    /// - [`ShareError::Timeout`] when the silence exceeds `timeout`, or the
    ///   server reports `SendAndWaitTimeOut`.
    /// - [`ShareError::ConnectionClosed`] when the coordinator disconnects
    ///   while waiting.
    /// - [`ShareError::InvalidState`] on the server role, which never sends
    ///   to itself.
    pub async fn send_and_wait(&self, request: WireFrame, timeout: Duration) -> Result<WireFrame> {
        match self.coordinator.role() {
            Role::Client => {}
            Role::Server => {
                return Err(ShareError::InvalidState(
                    "the server executes requests locally".into(),
                ))
            }
            Role::Unknown => return Err(ShareError::NotConnected),
        }

        let kind = request.kind();
        let envelope = CorrelatedEnvelope::for_frame(&request);
        let id = envelope.correlation_id().clone();

        // Subscribe before sending so the response cannot slip past.
        let mut frames = self.coordinator.subscribe();
        let mut events = self.coordinator.events();

        self.coordinator
            .send_to_server(&envelope.into_frame(MessageKind::SendAndWaitRequest))
            .await?;

        let mut last_signal = Instant::now();
        loop {
            match events.try_recv() {
                Ok(ConnectionEvent::ServerDisconnected) | Ok(ConnectionEvent::Disconnected) => {
                    return Err(ShareError::ConnectionClosed);
                }
                Ok(_) | Err(TryRecvError::Empty) | Err(TryRecvError::Lagged(_)) => {}
                Err(TryRecvError::Closed) => return Err(ShareError::ConnectionClosed),
            }

            let waited = last_signal.elapsed();
            if waited >= timeout {
                return Err(ShareError::Timeout { kind, waited });
            }
            let slice = self.poll_interval.max(Duration::from_millis(1)).min(timeout - waited);

            let frame = match tokio::time::timeout(slice, frames.recv()).await {
                Err(_) => continue,
                Ok(Ok(frame)) => frame,
                Ok(Err(RecvError::Lagged(skipped))) => {
                    tracing::warn!(skipped, %kind, "receive stream lagged while waiting");
                    continue;
                }
                Ok(Err(RecvError::Closed)) => return Err(ShareError::ConnectionClosed),
            };

            if frame.kind() != MessageKind::SendAndWaitResponse {
                continue;
            }
            let response = match CorrelatedEnvelope::from_frame(&frame) {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring malformed correlated response");
                    continue;
                }
            };
            if response.correlation_id() != &id {
                continue;
            }

            match response.kind() {
                MessageKind::SendAndWaitBusy => {
                    tracing::trace!(%kind, "peer busy, extending wait");
                    last_signal = Instant::now();
                }
                MessageKind::SendAndWaitTimeOut => {
                    return Err(ShareError::Timeout {
                        kind,
                        waited: last_signal.elapsed(),
                    });
                }
                _ => return Ok(response.to_frame()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_timeout_long_running_kinds() {
        let default = Duration::from_millis(5000);

        let t = busy_timeout(MessageKind::ExecuteNonQueryRequest, Duration::from_secs(30), default);
        assert_eq!(t, Duration::from_secs(3));

        let t = busy_timeout(MessageKind::LockConnectionRequest, Duration::from_secs(2), default);
        assert_eq!(t, MIN_BUSY_TIMEOUT);

        let t = busy_timeout(MessageKind::ExecuteReaderReadRequest, Duration::ZERO, default);
        assert_eq!(t, default);
    }

    #[test]
    fn test_busy_timeout_other_kinds_use_default() {
        let default = Duration::from_millis(5000);
        for kind in [
            MessageKind::CreateCommandRequest,
            MessageKind::ExecuteReaderGetRowRequest,
            MessageKind::CancelCommandRequest,
        ] {
            assert_eq!(busy_timeout(kind, Duration::from_secs(60), default), default);
        }
    }

    #[tokio::test]
    async fn test_send_and_wait_requires_client_role() {
        let coordinator = ConnectionCoordinator::new(crate::ShareConfig::default());
        let correlator = RequestCorrelator::new(coordinator);

        let request = WireFrame::empty(MessageKind::CreateCommandRequest);
        let result = correlator.send_and_wait(request, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ShareError::NotConnected)));
    }
}
