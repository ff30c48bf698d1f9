//! Connection coordinator: role election, fan-out sends, receive pipeline
//! and heartbeat.
//!
//! [`ConnectionCoordinator`] is a cheap handle onto an actor task that owns
//! the sockets. Received frames are published on a broadcast stream
//! ([`ConnectionCoordinator::subscribe`]) and handed to the registered
//! [`FrameHandler`]; lifecycle changes are published as [`ConnectionEvent`]s.
//!
//! # Example
//!
//! ```ignore
//! use sqlite_share::{ConnectionCoordinator, Role, ShareConfig};
//!
//! let coordinator = ConnectionCoordinator::new(ShareConfig::default());
//! match coordinator.connect().await? {
//!     Role::Server => println!("serving"),
//!     _ => println!("client of an existing server"),
//! }
//! ```

mod actor;
mod heartbeat;
mod peer;

use std::sync::{Arc, OnceLock};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use self::actor::{Actor, Command};
use crate::config::ShareConfig;
use crate::error::{Result, ShareError};
use crate::handler::FrameHandler;
use crate::protocol::WireFrame;
use crate::writer::WriterHandle;

/// Identifies one socket in the server's peer registry.
pub type PeerId = u64;

/// Which side of the bind-or-connect race this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    /// Not connected.
    #[default]
    Unknown,
    /// Owns the listener and the database.
    Server,
    /// Connected to the process that owns the listener.
    Client,
}

/// Lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Role election finished.
    Connected { is_server: bool },
    /// The server accepted a new peer.
    PeerJoined(PeerId),
    /// The heartbeat found a peer dead and removed it.
    PeerEvicted(PeerId),
    /// The heartbeat found the upstream server dead. Always followed by
    /// [`ConnectionEvent::Disconnected`].
    ServerDisconnected,
    /// All sockets closed and the role reset.
    Disconnected,
}

/// State shared between the handle, the actor and the reader tasks.
pub(crate) struct Hub {
    pub(crate) config: ShareConfig,
    role: watch::Sender<Role>,
    pub(crate) received: broadcast::Sender<WireFrame>,
    events: broadcast::Sender<ConnectionEvent>,
    pub(crate) handler: OnceLock<Arc<dyn FrameHandler>>,
}

impl Hub {
    fn set_role(&self, role: Role) {
        self.role.send_replace(role);
    }

    fn emit(&self, event: ConnectionEvent) {
        tracing::debug!(?event, "connection event");
        let _ = self.events.send(event);
    }
}

/// Handle onto the coordinator actor. Cloning is cheap; the actor stops
/// and closes its sockets when the last clone is dropped.
#[derive(Clone)]
pub struct ConnectionCoordinator {
    commands: mpsc::UnboundedSender<Command>,
    hub: Arc<Hub>,
}

impl std::fmt::Debug for ConnectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCoordinator")
            .field("endpoint", &self.hub.config.endpoint())
            .field("role", &self.role())
            .finish()
    }
}

impl ConnectionCoordinator {
    /// Create an unconnected coordinator. Must be called inside a tokio
    /// runtime.
    pub fn new(config: ShareConfig) -> Self {
        let capacity = config.event_capacity.max(1);
        let (received, _) = broadcast::channel(capacity);
        let (events, _) = broadcast::channel(capacity);
        let (role, _) = watch::channel(Role::Unknown);

        let hub = Arc::new(Hub {
            config,
            role,
            received,
            events,
            handler: OnceLock::new(),
        });

        let (commands, rx) = mpsc::unbounded_channel();
        let actor = Actor::new(hub.clone(), commands.downgrade());
        tokio::spawn(actor.run(rx));

        Self { commands, hub }
    }

    /// Create a coordinator with its frame handler already registered.
    pub fn with_handler(config: ShareConfig, handler: Arc<dyn FrameHandler>) -> Self {
        let coordinator = Self::new(config);
        let _ = coordinator.hub.handler.set(handler);
        coordinator
    }

    /// Register the `on_received` handler. Only one handler can be set.
    pub fn set_handler(&self, handler: Arc<dyn FrameHandler>) -> Result<()> {
        self.hub
            .handler
            .set(handler)
            .map_err(|_| ShareError::InvalidState("frame handler already registered".into()))
    }

    /// Run role election: bind and serve, or connect as a client.
    pub async fn connect(&self) -> Result<Role> {
        self.request(|reply| Command::Connect { reply }).await?
    }

    /// Close every socket and reset the role. Does nothing when already
    /// disconnected.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Send a frame.
    ///
    /// A server broadcasts to every registered peer; a client writes to its
    /// server. Per-socket failures are logged and swallowed, leaving dead
    /// peers to the heartbeat.
    pub async fn send(&self, frame: &WireFrame) -> Result<()> {
        let (role, targets) = self.request(|reply| Command::Targets { reply }).await?;
        if role == Role::Unknown {
            return Err(ShareError::NotConnected);
        }

        send_all(&targets, frame).await;
        Ok(())
    }

    /// Send a frame to the server. A no-op for the server itself.
    pub async fn send_to_server(&self, frame: &WireFrame) -> Result<()> {
        let (role, targets) = self.request(|reply| Command::Targets { reply }).await?;
        match role {
            Role::Unknown => Err(ShareError::NotConnected),
            Role::Server => Ok(()),
            Role::Client => {
                send_all(&targets, frame).await;
                Ok(())
            }
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.hub.role.borrow()
    }

    /// Whether this process currently hosts the database.
    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    /// Whether a role (client or server) has been established.
    pub fn is_connected(&self) -> bool {
        self.role() != Role::Unknown
    }

    /// Number of peers in the server's registry (0 for a client).
    pub async fn peer_count(&self) -> Result<usize> {
        self.request(|reply| Command::PeerCount { reply }).await
    }

    /// Stream of every frame received on any socket, in per-socket order.
    pub fn subscribe(&self) -> broadcast::Receiver<WireFrame> {
        self.hub.received.subscribe()
    }

    /// Stream of lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.hub.events.subscribe()
    }

    /// Watch channel following the role.
    pub fn watch_role(&self) -> watch::Receiver<Role> {
        self.hub.role.subscribe()
    }

    /// Configuration this coordinator was created with.
    pub fn config(&self) -> &ShareConfig {
        &self.hub.config
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).map_err(|_| ShareError::Closed)?;
        rx.await.map_err(|_| ShareError::Closed)
    }
}

async fn send_all(targets: &[WriterHandle], frame: &WireFrame) {
    for writer in targets {
        if let Err(e) = writer.send(frame).await {
            tracing::debug!(error = %e, kind = %frame.kind(), "send failed, leaving it to the heartbeat");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::Responder;
    use crate::protocol::{CorrelatedEnvelope, MessageKind};
    use std::time::Duration;

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn config(port: u16) -> ShareConfig {
        ShareConfig::default()
            .port(port)
            .heartbeat_interval(Duration::from_millis(50))
    }

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("event stream closed")
    }

    struct Echo;

    impl FrameHandler for Echo {
        fn on_received(&self, frame: WireFrame, responder: Responder) {
            if frame.kind() != MessageKind::ExecuteNonQueryRequest {
                return;
            }
            tokio::spawn(async move {
                let _ = responder.respond(frame).await;
            });
        }
    }

    #[tokio::test]
    async fn test_unconnected_send_fails() {
        let coordinator = ConnectionCoordinator::new(config(free_port()));
        assert_eq!(coordinator.role(), Role::Unknown);

        let frame = WireFrame::empty(MessageKind::DisposeCommand);
        assert!(matches!(coordinator.send(&frame).await, Err(ShareError::NotConnected)));
        assert!(matches!(
            coordinator.send_to_server(&frame).await,
            Err(ShareError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_twice_is_invalid_state() {
        let coordinator = ConnectionCoordinator::new(config(free_port()));
        assert_eq!(coordinator.connect().await.unwrap(), Role::Server);
        assert!(matches!(coordinator.connect().await, Err(ShareError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let coordinator = ConnectionCoordinator::new(config(free_port()));
        let mut events = coordinator.events();

        coordinator.disconnect().await.unwrap();
        coordinator.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected { is_server: true });

        coordinator.disconnect().await.unwrap();
        coordinator.disconnect().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert!(events.try_recv().is_err());
        assert_eq!(coordinator.role(), Role::Unknown);
    }

    #[tokio::test]
    async fn test_server_send_to_server_is_noop() {
        let coordinator = ConnectionCoordinator::new(config(free_port()));
        coordinator.connect().await.unwrap();

        let frame = WireFrame::empty(MessageKind::DisposeCommand);
        assert!(coordinator.send_to_server(&frame).await.is_ok());
        assert!(coordinator.send(&frame).await.is_ok());
    }

    #[tokio::test]
    async fn test_correlated_request_reaches_handler_and_returns() {
        let port = free_port();
        let server = ConnectionCoordinator::with_handler(config(port), Arc::new(Echo));
        assert_eq!(server.connect().await.unwrap(), Role::Server);

        let client = ConnectionCoordinator::new(config(port));
        assert_eq!(client.connect().await.unwrap(), Role::Client);
        let mut received = client.subscribe();

        let request = CorrelatedEnvelope::new(
            MessageKind::ExecuteNonQueryRequest,
            Some(bytes::Bytes::from_static(b"abc")),
        );
        let id = request.correlation_id().clone();
        client
            .send_to_server(&request.into_frame(MessageKind::SendAndWaitRequest))
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind(), MessageKind::SendAndWaitResponse);

        let response = CorrelatedEnvelope::from_frame(&frame).unwrap();
        assert_eq!(response.correlation_id(), &id);
        assert_eq!(response.kind(), MessageKind::ExecuteNonQueryRequest);
        assert_eq!(response.payload(), b"abc");
    }

    #[tokio::test]
    async fn test_client_detects_server_loss() {
        let port = free_port();
        let server = ConnectionCoordinator::new(config(port));
        server.connect().await.unwrap();

        let client = ConnectionCoordinator::new(config(port));
        let mut events = client.events();
        client.connect().await.unwrap();
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected { is_server: false });

        server.disconnect().await.unwrap();

        assert_eq!(next_event(&mut events).await, ConnectionEvent::ServerDisconnected);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Disconnected);
        assert_eq!(client.role(), Role::Unknown);
    }

    #[tokio::test]
    async fn test_second_handler_rejected() {
        let coordinator = ConnectionCoordinator::with_handler(config(free_port()), Arc::new(Echo));
        assert!(coordinator.set_handler(Arc::new(Echo)).is_err());
    }
}
