//! Database façade on top of the coordinator.
//!
//! [`ShareConnection::open`] runs role election. The winner executes
//! requests against its own [`DatabaseServer`]; everyone else sends them
//! through the [`RequestCorrelator`]. Application code sees the same API on
//! both sides.
//!
//! # Example
//!
//! ```ignore
//! use sqlite_share::{ShareConfig, ShareConnection};
//!
//! let connection = ShareConnection::open(ShareConfig::new("app.db")).await?;
//! connection
//!     .create_command("create table if not exists kv (k text, v integer)")
//!     .execute_non_query()
//!     .await?;
//!
//! let command = connection.create_command("select k, v from kv");
//! let mut reader = command.execute_reader().await?;
//! while reader.read().await? {
//!     println!("{} = {}", reader.get_string(0)?, reader.get_int64(1)?);
//! }
//! ```

mod command;
mod reader;

pub use command::ShareCommand;
pub use reader::ShareDataReader;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::ShareConfig;
use crate::coordinator::{ConnectionCoordinator, ConnectionEvent, Role};
use crate::correlator::{busy_timeout, RequestCorrelator};
use crate::db::DatabaseServer;
use crate::error::{Result, ShareError};
use crate::protocol::{MessageKind, WireFrame};

/// Lifecycle of a [`ShareConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    /// The server went away; role election is being re-run.
    Reconnecting,
}

struct ConnectionInner {
    config: ShareConfig,
    coordinator: ConnectionCoordinator,
    server: DatabaseServer,
    correlator: RequestCorrelator,
    state: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
    }
}

/// A connection to the shared database. Cheap to clone.
#[derive(Clone)]
pub struct ShareConnection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for ShareConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareConnection")
            .field("data_source", &self.inner.config.data_source)
            .field("state", &self.state())
            .field("role", &self.role())
            .finish()
    }
}

impl ShareConnection {
    /// Validate `config`, run role election and start watching for server
    /// loss.
    pub async fn open(config: ShareConfig) -> Result<Self> {
        config.validate()?;

        let server = DatabaseServer::new(&config);
        let coordinator =
            ConnectionCoordinator::with_handler(config.clone(), Arc::new(server.clone()));
        let correlator = RequestCorrelator::new(coordinator.clone());
        let (state, _) = watch::channel(ConnectionState::Connecting);

        let connection = Self {
            inner: Arc::new(ConnectionInner {
                config,
                coordinator,
                server,
                correlator,
                state,
                epoch: AtomicU64::new(0),
                watcher: Mutex::new(None),
            }),
        };

        let events = connection.inner.coordinator.events();
        if let Err(e) = connection.inner.coordinator.connect().await {
            connection.set_state(ConnectionState::Closed);
            return Err(e);
        }
        connection.inner.epoch.fetch_add(1, Ordering::AcqRel);
        connection.set_state(ConnectionState::Open);

        let watcher = tokio::spawn(watch_connection(Arc::downgrade(&connection.inner), events));
        *lock(&connection.inner.watcher) = Some(watcher);

        tracing::info!(role = ?connection.role(), "connection open");
        Ok(connection)
    }

    /// Create a command. Nothing is sent until it first executes.
    pub fn create_command(&self, text: impl Into<String>) -> ShareCommand {
        ShareCommand::new(self.clone(), text.into(), self.inner.config.default_command_timeout())
    }

    /// Take the advisory connection lock, waiting at most `wait`.
    pub async fn lock(&self, wait: Duration) -> Result<()> {
        let wait_ms = i64::try_from(wait.as_millis()).unwrap_or(i64::MAX);
        let request = WireFrame::from_scalar(MessageKind::LockConnectionRequest, wait_ms);
        let reply = self.exchange(request, wait).await?;
        expect_kind(&reply, MessageKind::LockConnectionResponse)
    }

    /// Release the advisory connection lock.
    pub async fn unlock(&self) -> Result<()> {
        let request = WireFrame::empty(MessageKind::UnlockConnectionRequest);
        let reply = self.exchange(request, Duration::ZERO).await?;
        expect_kind(&reply, MessageKind::LockConnectionResponse)
    }

    /// Disconnect. Closing twice is an error.
    pub async fn close(&self) -> Result<()> {
        let previous = self.inner.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return Err(ShareError::Closed);
        }

        if let Some(watcher) = lock(&self.inner.watcher).take() {
            watcher.abort();
        }
        self.inner.coordinator.disconnect().await?;
        let forgotten = self.inner.server.forget_peers();
        tracing::info!(forgotten, "connection closed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Role won in the last election; `Unknown` while disconnected.
    pub fn role(&self) -> Role {
        self.inner.coordinator.role()
    }

    /// Shorthand for `role() == Role::Server`.
    pub fn is_server(&self) -> bool {
        self.role() == Role::Server
    }

    /// Incremented by every successful (re)connect. Commands created under
    /// an older epoch are re-created on the current server.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::Acquire)
    }

    /// Underlying connection coordinator.
    pub fn coordinator(&self) -> &ConnectionCoordinator {
        &self.inner.coordinator
    }

    /// Session configuration.
    pub fn config(&self) -> &ShareConfig {
        &self.inner.config
    }

    /// Request handler this process runs while it holds the server role.
    pub fn database_server(&self) -> &DatabaseServer {
        &self.inner.server
    }

    /// Send a request and return the reply, executing locally on the
    /// server role. Exception replies become [`ShareError::Remote`].
    pub(crate) async fn exchange(&self, request: WireFrame, command_timeout: Duration) -> Result<WireFrame> {
        let kind = request.kind();
        let started = Instant::now();

        let reply = match self.ready().await? {
            Role::Server => self
                .inner
                .server
                .process(request)
                .await
                .ok_or_else(|| ShareError::Protocol(format!("no reply to {}", kind)))?,
            Role::Client => {
                let wait = busy_timeout(kind, command_timeout, self.inner.config.busy_timeout());
                self.inner.correlator.send_and_wait(request, wait).await?
            }
            Role::Unknown => return Err(ShareError::NotConnected),
        };

        if reply.kind() == MessageKind::SendAndWaitTimeOut {
            return Err(ShareError::Timeout {
                kind,
                waited: started.elapsed(),
            });
        }
        if reply.kind().is_exception() {
            return Err(ShareError::Remote(reply.text().unwrap_or_default()));
        }
        Ok(reply)
    }

    /// Send a fire-and-forget request.
    pub(crate) async fn notify(&self, request: WireFrame) -> Result<()> {
        match self.ready().await? {
            Role::Server => {
                self.inner.server.process(request).await;
                Ok(())
            }
            _ => self.inner.coordinator.send_to_server(&request).await,
        }
    }

    /// Wait until the connection is usable and return the current role.
    async fn ready(&self) -> Result<Role> {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Closed => return Err(ShareError::Closed),
                ConnectionState::Open => {
                    let role = self.role();
                    if role != Role::Unknown {
                        return Ok(role);
                    }
                    // Server loss was just detected; give the watcher time
                    // to switch to reconnecting.
                    let grace = self.inner.config.reconnect_delay().max(Duration::from_millis(100));
                    match tokio::time::timeout(grace, state.changed()).await {
                        Ok(Ok(())) => continue,
                        Ok(Err(_)) => return Err(ShareError::Closed),
                        Err(_) => return Err(ShareError::NotConnected),
                    }
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    state.changed().await.map_err(|_| ShareError::Closed)?;
                }
            }
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_replace(state);
    }
}

impl ConnectionInner {
    /// Re-run role election after the server went away.
    async fn reconnect(&self) {
        if *self.state.borrow() == ConnectionState::Closed {
            return;
        }
        self.state.send_replace(ConnectionState::Reconnecting);

        for attempt in 1..=self.config.reconnect_attempts {
            tokio::time::sleep(self.config.reconnect_delay()).await;
            if *self.state.borrow() == ConnectionState::Closed {
                return;
            }

            match self.coordinator.connect().await {
                Ok(role) => {
                    self.epoch.fetch_add(1, Ordering::AcqRel);
                    self.state.send_replace(ConnectionState::Open);
                    tracing::info!(attempt, ?role, "reconnected");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        tracing::error!(attempts = self.config.reconnect_attempts, "giving up reconnecting");
        self.state.send_replace(ConnectionState::Closed);
    }
}

/// Reconnect after server loss; drop what evicted peers left on our server.
async fn watch_connection(inner: Weak<ConnectionInner>, mut events: broadcast::Receiver<ConnectionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "connection events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ConnectionEvent::ServerDisconnected => inner.reconnect().await,
            ConnectionEvent::PeerEvicted(peer) => {
                inner.server.forget_peer(peer);
            }
            _ => {}
        }
    }
}

/// Fail with a protocol error unless `reply` has the expected kind.
pub(crate) fn expect_kind(reply: &WireFrame, expected: MessageKind) -> Result<()> {
    if reply.kind() == expected {
        Ok(())
    } else {
        Err(ShareError::Protocol(format!(
            "expected {}, got {}",
            expected,
            reply.kind()
        )))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
