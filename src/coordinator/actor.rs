//! The task that owns all mutable coordinator state.
//!
//! Role, peer registry, upstream link, accept task and heartbeat timer are
//! only ever touched here; everything else talks to the actor through
//! [`Command`]s. Handlers run on reader tasks and never wait on the actor
//! while it waits on them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{UnboundedReceiver, WeakUnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::heartbeat::Heartbeat;
use super::peer::open_link;
use super::{ConnectionEvent, Hub, PeerId, Role};
use crate::error::{Result, ShareError};
use crate::transport::{is_connected, negotiate, Negotiated, PeerLink};
use crate::writer::WriterHandle;

/// Peer id used for a client's single upstream link.
const UPSTREAM: PeerId = 0;

/// Pause after a failed accept so a persistent error cannot spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub(crate) enum Command {
    Connect {
        reply: oneshot::Sender<Result<Role>>,
    },
    Register {
        stream: TcpStream,
    },
    Targets {
        reply: oneshot::Sender<(Role, Vec<WriterHandle>)>,
    },
    PeerCount {
        reply: oneshot::Sender<usize>,
    },
    HeartbeatTick {
        generation: u64,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

pub(crate) struct Actor {
    hub: Arc<Hub>,
    commands: WeakUnboundedSender<Command>,
    role: Role,
    peers: BTreeMap<PeerId, PeerLink>,
    upstream: Option<PeerLink>,
    accept_task: Option<JoinHandle<()>>,
    heartbeat: Heartbeat,
    next_peer: PeerId,
}

impl Actor {
    pub(crate) fn new(hub: Arc<Hub>, commands: WeakUnboundedSender<Command>) -> Self {
        let heartbeat = Heartbeat::new(hub.config.heartbeat());
        Self {
            hub,
            commands,
            role: Role::Unknown,
            peers: BTreeMap::new(),
            upstream: None,
            accept_task: None,
            heartbeat,
            next_peer: UPSTREAM + 1,
        }
    }

    /// Process commands until every coordinator handle is gone.
    pub(crate) async fn run(mut self, mut rx: UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Connect { reply } => {
                    let result = self.connect().await;
                    let _ = reply.send(result);
                }
                Command::Register { stream } => self.register(stream),
                Command::Targets { reply } => {
                    let _ = reply.send((self.role, self.targets()));
                }
                Command::PeerCount { reply } => {
                    let _ = reply.send(self.peers.len());
                }
                Command::HeartbeatTick { generation } => self.on_heartbeat(generation),
                Command::Disconnect { reply } => {
                    self.disconnect();
                    let _ = reply.send(());
                }
            }
        }

        self.disconnect();
        tracing::debug!("coordinator stopped");
    }

    async fn connect(&mut self) -> Result<Role> {
        if self.role != Role::Unknown {
            return Err(ShareError::InvalidState(format!(
                "already connected as {:?}",
                self.role
            )));
        }

        let hub = self.hub.clone();
        let config = &hub.config;
        match negotiate(&config.address, config.port, config.backlog).await? {
            Negotiated::Server(listener) => {
                self.accept_task = Some(tokio::spawn(accept_loop(listener, self.commands.clone())));
                self.set_role(Role::Server);
                // Armed once the first peer registers.
            }
            Negotiated::Client(stream) => {
                self.upstream = Some(open_link(stream, UPSTREAM, self.hub.clone()));
                self.set_role(Role::Client);
                self.heartbeat.arm(&self.commands);
            }
        }

        self.hub.emit(ConnectionEvent::Connected {
            is_server: self.role == Role::Server,
        });
        Ok(self.role)
    }

    fn register(&mut self, stream: TcpStream) {
        if self.role != Role::Server {
            tracing::debug!(role = ?self.role, "dropping accepted socket, not serving");
            return;
        }

        let id = self.next_peer;
        self.next_peer += 1;

        let link = open_link(stream, id, self.hub.clone());
        tracing::info!(peer = id, addr = ?link.peer_addr(), "peer joined");
        self.peers.insert(id, link);
        self.hub.emit(ConnectionEvent::PeerJoined(id));
        self.heartbeat.arm(&self.commands);
    }

    fn targets(&self) -> Vec<WriterHandle> {
        match self.role {
            Role::Server => self.peers.values().map(|l| l.writer().clone()).collect(),
            Role::Client => self
                .upstream
                .iter()
                .map(|l| l.writer().clone())
                .collect(),
            Role::Unknown => Vec::new(),
        }
    }

    fn on_heartbeat(&mut self, generation: u64) {
        if !self.heartbeat.accept_tick(generation) {
            return;
        }

        match self.role {
            Role::Server => {
                let dead: Vec<PeerId> = self
                    .peers
                    .iter()
                    .filter(|(_, link)| !is_connected(link))
                    .map(|(id, _)| *id)
                    .collect();

                for id in dead {
                    self.peers.remove(&id);
                    tracing::info!(peer = id, "peer evicted");
                    self.hub.emit(ConnectionEvent::PeerEvicted(id));
                }

                if !self.peers.is_empty() {
                    self.heartbeat.arm(&self.commands);
                }
            }
            Role::Client => {
                if self.upstream.as_ref().is_some_and(is_connected) {
                    self.heartbeat.arm(&self.commands);
                } else {
                    tracing::warn!("server connection lost");
                    self.hub.emit(ConnectionEvent::ServerDisconnected);
                    self.disconnect();
                }
            }
            Role::Unknown => {}
        }
    }

    fn disconnect(&mut self) {
        if self.role == Role::Unknown {
            return;
        }

        self.heartbeat.disarm();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.peers.clear();
        self.upstream = None;

        tracing::info!(role = ?self.role, "disconnected");
        self.set_role(Role::Unknown);
        self.hub.emit(ConnectionEvent::Disconnected);
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
        self.hub.set_role(role);
    }
}

async fn accept_loop(listener: TcpListener, commands: WeakUnboundedSender<Command>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted connection");
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::Register { stream }).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
