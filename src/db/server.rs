//! Request handler for the server role.
//!
//! [`DatabaseServer`] answers every database request kind. It owns the
//! engine, the registry of created commands (each with its server-side
//! cursor) and the advisory connection lock.
//!
//! The same `process` path serves remote requests (through the
//! [`FrameHandler`] impl) and the server's own façade, which executes
//! locally instead of sending to itself.
//!
//! Commands and the advisory lock remember their [`Owner`]. When a peer is
//! evicted, [`DatabaseServer::forget_peer`] drops what it left behind.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use super::engine::{is_interrupted, Abandoned, Engine, Ticket};
use super::fields::{
    CreateCommand, DataTypeNameRequest, ExecuteRequest, ReaderMeta, ResultSet, Row,
};
use crate::config::ShareConfig;
use crate::coordinator::PeerId;
use crate::error::{Result, ShareError};
use crate::handler::{FrameHandler, Responder};
use crate::protocol::{CorrelationId, MessageKind, WireFrame};

/// Server-side cursor over the materialized result sets of one reader.
#[derive(Debug, Default)]
struct Cursor {
    sets: Vec<ResultSet>,
    set: usize,
    row: Option<usize>,
}

impl Cursor {
    fn current(&self) -> Option<&ResultSet> {
        self.sets.get(self.set)
    }

    fn meta(&self) -> ReaderMeta {
        ReaderMeta {
            columns: self.current().map(|s| s.columns.clone()).unwrap_or_default(),
        }
    }

    fn read(&mut self) -> bool {
        let Some(set) = self.sets.get(self.set) else {
            return false;
        };
        let next = self.row.map_or(0, |r| r + 1);
        if next < set.rows.len() {
            self.row = Some(next);
            true
        } else {
            self.row = Some(set.rows.len());
            false
        }
    }

    fn next_result(&mut self) -> bool {
        if self.set < self.sets.len() {
            self.set += 1;
        }
        self.row = None;
        self.set < self.sets.len()
    }

    fn row(&self) -> Option<&Row> {
        self.current()?.rows.get(self.row?)
    }
}

/// Who a command or the advisory lock belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The server's own façade.
    Local,
    /// A connected client.
    Peer(PeerId),
}

#[derive(Debug)]
struct CommandEntry {
    text: String,
    owner: Owner,
    cursor: Option<Cursor>,
    /// The execution currently queued or running for this command.
    active: Option<Ticket>,
}

/// Outcome of a blocking engine call run under a command timeout.
enum Execution<T> {
    Done(Result<T>),
    TimedOut,
}

struct ServerInner {
    data_source: PathBuf,
    engine: Mutex<Option<Arc<Engine>>>,
    commands: Mutex<HashMap<String, CommandEntry>>,
    advisory: Arc<tokio::sync::Mutex<()>>,
    held: Mutex<Option<(Owner, OwnedMutexGuard<()>)>>,
    /// Evicted peers; requests still in flight from them leave nothing behind.
    gone: Mutex<HashSet<PeerId>>,
    busy_signal_interval: Duration,
}

/// Executes database requests against the local engine.
#[derive(Clone)]
pub struct DatabaseServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for DatabaseServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseServer")
            .field("data_source", &self.inner.data_source)
            .field("commands", &lock(&self.inner.commands).len())
            .finish()
    }
}

impl DatabaseServer {
    /// Create a server for `config.data_source`. The database is opened on
    /// the first request.
    pub fn new(config: &ShareConfig) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                data_source: config.data_source.clone(),
                engine: Mutex::new(None),
                commands: Mutex::new(HashMap::new()),
                advisory: Arc::new(tokio::sync::Mutex::new(())),
                held: Mutex::new(None),
                gone: Mutex::new(HashSet::new()),
                busy_signal_interval: config.busy_signal_interval(),
            }),
        }
    }

    /// Serve an already opened engine.
    pub fn with_engine(engine: Engine, busy_signal_interval: Duration) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                data_source: PathBuf::new(),
                engine: Mutex::new(Some(Arc::new(engine))),
                commands: Mutex::new(HashMap::new()),
                advisory: Arc::new(tokio::sync::Mutex::new(())),
                held: Mutex::new(None),
                gone: Mutex::new(HashSet::new()),
                busy_signal_interval,
            }),
        }
    }

    /// Number of live commands.
    pub fn command_count(&self) -> usize {
        lock(&self.inner.commands).len()
    }

    /// Whether the advisory lock is currently held.
    pub fn is_locked(&self) -> bool {
        lock(&self.inner.held).is_some()
    }

    /// Current holder of the advisory lock.
    pub fn lock_holder(&self) -> Option<Owner> {
        lock(&self.inner.held).as_ref().map(|(owner, _)| *owner)
    }

    /// Drop every command `peer` created, stop its running work and release
    /// the advisory lock if it holds it. Returns the number of commands
    /// removed.
    pub fn forget_peer(&self, peer: PeerId) -> usize {
        lock(&self.inner.gone).insert(peer);
        let removed = self.purge(|owner| owner == Owner::Peer(peer));
        tracing::debug!(peer, removed, "forgot evicted peer");
        removed
    }

    /// Drop everything owned by any peer; used when the server role ends.
    pub fn forget_peers(&self) -> usize {
        self.purge(|owner| owner != Owner::Local)
    }

    fn purge(&self, matches: impl Fn(Owner) -> bool) -> usize {
        let removed: Vec<CommandEntry> = {
            let mut commands = lock(&self.inner.commands);
            let ids: Vec<String> = commands
                .iter()
                .filter(|(_, entry)| matches(entry.owner))
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| commands.remove(id)).collect()
        };

        if let Some(engine) = self.current_engine() {
            for ticket in removed.iter().filter_map(|entry| entry.active.as_ref()) {
                engine.abandon(ticket);
            }
        }

        let mut held = lock(&self.inner.held);
        if held.as_ref().is_some_and(|(owner, _)| matches(*owner)) {
            *held = None;
            tracing::debug!("connection unlocked for departed owner");
        }

        removed.len()
    }

    fn is_gone(&self, owner: Owner) -> bool {
        match owner {
            Owner::Local => false,
            Owner::Peer(peer) => lock(&self.inner.gone).contains(&peer),
        }
    }

    /// Answer one request from the local façade.
    pub async fn process(&self, frame: WireFrame) -> Option<WireFrame> {
        self.process_for(Owner::Local, frame).await
    }

    /// Answer one request on behalf of `owner`. `None` for fire-and-forget
    /// kinds and for frames that are not requests. A command that exceeds
    /// its timeout answers `SendAndWaitTimeOut`.
    pub async fn process_for(&self, owner: Owner, frame: WireFrame) -> Option<WireFrame> {
        let kind = frame.kind();
        tracing::trace!(%kind, ?owner, len = frame.len(), "processing request");

        let reply = match kind {
            MessageKind::CreateCommandRequest => self.create_command(owner, &frame),
            MessageKind::DisposeCommand => {
                self.dispose_command(&frame);
                return None;
            }
            MessageKind::CancelCommandRequest => self.cancel_command(&frame),
            MessageKind::LockConnectionRequest => self.lock_connection(owner, &frame).await,
            MessageKind::UnlockConnectionRequest => self.unlock_connection(),
            MessageKind::ExecuteNonQueryRequest => self.execute_non_query(&frame).await,
            MessageKind::ExecuteReaderRequest => self.execute_reader(&frame).await,
            MessageKind::ExecuteReaderReadRequest => self.read(&frame),
            MessageKind::ExecuteReaderNextResultRequest => self.next_result(&frame),
            MessageKind::ExecuteReaderGetRowRequest => self.get_row(&frame),
            MessageKind::ExecuteReaderGetDataTypeNameRequest => self.data_type_name(&frame),
            _ => return None,
        };

        Some(reply)
    }

    fn create_command(&self, owner: Owner, frame: &WireFrame) -> WireFrame {
        let request: CreateCommand = match frame.record() {
            Ok(request) => request,
            Err(e) => return exception(MessageKind::CreateCommandException, e),
        };
        if request.text.trim().is_empty() {
            return text_frame(MessageKind::CreateCommandException, "command text is empty");
        }

        if self.is_gone(owner) {
            return text_frame(MessageKind::CreateCommandException, "peer was evicted");
        }

        let id = CorrelationId::new().to_string();
        lock(&self.inner.commands).insert(
            id.clone(),
            CommandEntry {
                text: request.text,
                owner,
                cursor: None,
                active: None,
            },
        );
        tracing::debug!(command_id = %id, "command created");

        WireFrame::from_scalar(MessageKind::CreateCommandResponse, id)
    }

    fn dispose_command(&self, frame: &WireFrame) {
        if let Some(id) = frame.text() {
            if lock(&self.inner.commands).remove(&id).is_some() {
                tracing::debug!(command_id = %id, "command disposed");
            }
        }
    }

    /// Stop the command's queued or running execution.
    fn cancel_command(&self, frame: &WireFrame) -> WireFrame {
        let ticket = frame.text().and_then(|id| {
            lock(&self.inner.commands)
                .get(&id)
                .and_then(|entry| entry.active.clone())
        });
        let stopped = match (ticket, self.current_engine()) {
            (Some(ticket), Some(engine)) => engine.abandon(&ticket) != Abandoned::Finished,
            _ => false,
        };
        WireFrame::from_scalar(MessageKind::CancelCommandResponse, stopped)
    }

    async fn lock_connection(&self, owner: Owner, frame: &WireFrame) -> WireFrame {
        let wait_ms = frame.get_with::<i64>(false).unwrap_or_default();
        let wait = Duration::from_millis(u64::try_from(wait_ms).unwrap_or(0));

        match self.acquire_for(owner, wait).await {
            Ok(()) => WireFrame::empty(MessageKind::LockConnectionResponse),
            Err(e) => exception(MessageKind::LockConnectionException, e),
        }
    }

    /// Take the advisory lock for the local façade, waiting at most `wait`
    /// (zero waits forever).
    pub async fn acquire(&self, wait: Duration) -> Result<()> {
        self.acquire_for(Owner::Local, wait).await
    }

    async fn acquire_for(&self, owner: Owner, wait: Duration) -> Result<()> {
        let pending = self.inner.advisory.clone().lock_owned();
        let guard = if wait.is_zero() {
            pending.await
        } else {
            tokio::time::timeout(wait, pending).await.map_err(|_| {
                ShareError::Remote(format!("connection lock not acquired within {:?}", wait))
            })?
        };

        if self.is_gone(owner) {
            // Dropping the guard hands the lock to the next waiter.
            return Err(ShareError::InvalidState("peer was evicted".into()));
        }

        *lock(&self.inner.held) = Some((owner, guard));
        tracing::debug!(?owner, "connection locked");
        Ok(())
    }

    /// Release the advisory lock. Releasing an unheld lock does nothing.
    pub fn release(&self) {
        if lock(&self.inner.held).take().is_some() {
            tracing::debug!("connection unlocked");
        }
    }

    fn unlock_connection(&self) -> WireFrame {
        self.release();
        WireFrame::empty(MessageKind::LockConnectionResponse)
    }

    async fn execute_non_query(&self, frame: &WireFrame) -> WireFrame {
        let (request, text) = match self.command_request(frame) {
            Ok(found) => found,
            Err(e) => return exception(MessageKind::ExecuteNonQueryException, e),
        };

        let execution = self
            .run_blocking(&request, move |engine, ticket| engine.execute_non_query(ticket, &text))
            .await;

        match execution {
            Execution::TimedOut => WireFrame::empty(MessageKind::SendAndWaitTimeOut),
            Execution::Done(Ok(changed)) => {
                WireFrame::from_scalar(MessageKind::ExecuteNonQueryResponseSuccess, changed)
            }
            Execution::Done(Err(e @ ShareError::Database(_))) => {
                exception(MessageKind::ExecuteNonQueryResponseError, e)
            }
            Execution::Done(Err(e)) => exception(MessageKind::ExecuteNonQueryException, e),
        }
    }

    async fn execute_reader(&self, frame: &WireFrame) -> WireFrame {
        let (request, text) = match self.command_request(frame) {
            Ok(found) => found,
            Err(e) => return exception(MessageKind::ExecuteReaderException, e),
        };

        let execution = self
            .run_blocking(&request, move |engine, ticket| engine.query(ticket, &text))
            .await;

        let sets = match execution {
            Execution::TimedOut => return WireFrame::empty(MessageKind::SendAndWaitTimeOut),
            Execution::Done(Ok(sets)) => sets,
            Execution::Done(Err(e)) => return exception(MessageKind::ExecuteReaderException, e),
        };

        let cursor = Cursor {
            sets,
            ..Cursor::default()
        };
        let meta = cursor.meta();

        match lock(&self.inner.commands).get_mut(&request.command_id) {
            Some(entry) => entry.cursor = Some(cursor),
            None => {
                return text_frame(MessageKind::ExecuteReaderException, "command was disposed")
            }
        }

        record_frame(MessageKind::ExecuteReaderResponse, &meta)
    }

    fn read(&self, frame: &WireFrame) -> WireFrame {
        match self.with_cursor(frame, Cursor::read) {
            Ok(has_row) => WireFrame::from_scalar(MessageKind::ExecuteRequestResponse, has_row),
            Err(e) => exception(MessageKind::ExecuteReaderException, e),
        }
    }

    fn next_result(&self, frame: &WireFrame) -> WireFrame {
        let moved = self.with_cursor(frame, |cursor| cursor.next_result().then(|| cursor.meta()));
        match moved {
            Ok(Some(meta)) => record_frame(MessageKind::ExecuteReaderResponse, &meta),
            Ok(None) => WireFrame::from_scalar(MessageKind::ExecuteRequestResponse, false),
            Err(e) => exception(MessageKind::ExecuteReaderException, e),
        }
    }

    fn get_row(&self, frame: &WireFrame) -> WireFrame {
        let row = self.with_cursor(frame, |cursor| cursor.row().cloned());
        match row {
            Ok(Some(row)) => record_frame(MessageKind::ExecuteReaderGetRowResponse, &row),
            Ok(None) => text_frame(MessageKind::ExecuteReaderException, "no current row"),
            Err(e) => exception(MessageKind::ExecuteReaderException, e),
        }
    }

    fn data_type_name(&self, frame: &WireFrame) -> WireFrame {
        let request: DataTypeNameRequest = match frame.record() {
            Ok(request) => request,
            Err(e) => return exception(MessageKind::ExecuteReaderException, e),
        };
        let ordinal = request.ordinal as usize;

        let commands = lock(&self.inner.commands);
        let cursor = commands
            .get(&request.command_id)
            .and_then(|entry| entry.cursor.as_ref());
        let Some(cursor) = cursor else {
            return text_frame(MessageKind::ExecuteReaderException, "reader is not open");
        };
        let Some(column) = cursor.current().and_then(|set| set.columns.get(ordinal)) else {
            return text_frame(
                MessageKind::ExecuteReaderException,
                &format!("ordinal {} out of range", ordinal),
            );
        };

        let sample = cursor.row().and_then(|row| row.get(ordinal));
        WireFrame::from_scalar(
            MessageKind::ExecuteRequestResponse,
            column.data_type_name(sample),
        )
    }

    /// Parse an execute request and look up the command text.
    fn command_request(&self, frame: &WireFrame) -> Result<(ExecuteRequest, String)> {
        let request: ExecuteRequest = frame.record()?;
        let text = lock(&self.inner.commands)
            .get(&request.command_id)
            .map(|entry| entry.text.clone())
            .ok_or_else(|| unknown_command(&request.command_id))?;
        Ok((request, text))
    }

    fn with_cursor<T>(&self, frame: &WireFrame, f: impl FnOnce(&mut Cursor) -> T) -> Result<T> {
        let id = frame
            .text()
            .ok_or_else(|| ShareError::Protocol("missing command id".into()))?;
        let mut commands = lock(&self.inner.commands);
        let entry = commands.get_mut(&id).ok_or_else(|| unknown_command(&id))?;
        let cursor = entry
            .cursor
            .as_mut()
            .ok_or_else(|| ShareError::InvalidState("reader is not open".into()))?;
        Ok(f(cursor))
    }

    fn engine(&self) -> Result<Arc<Engine>> {
        let mut slot = lock(&self.inner.engine);
        if let Some(engine) = slot.as_ref() {
            return Ok(engine.clone());
        }
        let engine = Arc::new(Engine::open(&self.inner.data_source)?);
        *slot = Some(engine.clone());
        Ok(engine)
    }

    fn current_engine(&self) -> Option<Arc<Engine>> {
        lock(&self.inner.engine).clone()
    }

    /// Run blocking engine work under the request's timeout.
    ///
    /// On timeout the work is abandoned: if it never reached the connection
    /// it never will, and if it was running it is interrupted. Only work
    /// that was stopped is reported as timed out; work that finished in the
    /// meantime reports its real result.
    async fn run_blocking<T, F>(&self, request: &ExecuteRequest, work: F) -> Execution<T>
    where
        T: Send + 'static,
        F: FnOnce(&Engine, &Ticket) -> Result<T> + Send + 'static,
    {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => return Execution::Done(Err(e)),
        };

        let ticket = Ticket::new(&request.command_id);
        if let Some(entry) = lock(&self.inner.commands).get_mut(&request.command_id) {
            entry.active = Some(ticket.clone());
        }

        let mut task = tokio::task::spawn_blocking({
            let engine = engine.clone();
            let ticket = ticket.clone();
            move || work(&engine, &ticket)
        });

        let mut timed_out = false;
        let joined = if request.timeout_ms == 0 {
            (&mut task).await
        } else {
            let timeout = Duration::from_millis(request.timeout_ms);
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(joined) => joined,
                Err(_) => {
                    tracing::warn!(command_id = %request.command_id, ?timeout, "command timed out");
                    timed_out = true;
                    match engine.abandon(&ticket) {
                        Abandoned::NotStarted => {
                            self.clear_active(&request.command_id, &ticket);
                            return Execution::TimedOut;
                        }
                        Abandoned::Interrupted | Abandoned::Finished => (&mut task).await,
                    }
                }
            }
        };
        self.clear_active(&request.command_id, &ticket);

        match joined {
            Ok(Err(e)) if is_interrupted(&e) && timed_out => Execution::TimedOut,
            Ok(Err(e)) if is_interrupted(&e) => {
                tracing::debug!(command_id = %request.command_id, "command cancelled");
                Execution::Done(Err(e))
            }
            Ok(result) => Execution::Done(result),
            Err(e) => Execution::Done(Err(ShareError::InvalidState(format!(
                "database task failed: {}",
                e
            )))),
        }
    }

    fn clear_active(&self, command_id: &str, ticket: &Ticket) {
        if let Some(entry) = lock(&self.inner.commands).get_mut(command_id) {
            if entry.active.as_ref().is_some_and(|active| active.same(ticket)) {
                entry.active = None;
            }
        }
    }
}

impl FrameHandler for DatabaseServer {
    fn on_received(&self, frame: WireFrame, responder: Responder) {
        if !is_request(frame.kind()) {
            return;
        }

        let owner = responder.peer().map_or(Owner::Local, Owner::Peer);
        let server = self.clone();
        tokio::spawn(async move {
            let kind = frame.kind();
            let work = server.process_for(owner, frame);
            let reply = if responder.is_correlated() {
                with_busy_signals(work, &responder, server.inner.busy_signal_interval).await
            } else {
                work.await
            };

            if let Some(reply) = reply {
                if let Err(e) = responder.respond(reply).await {
                    tracing::debug!(%kind, error = %e, "could not deliver response");
                }
            }
        });
    }
}

/// Drive `work`, sending a busy signal every `interval` until it finishes.
async fn with_busy_signals<F: Future>(work: F, responder: &Responder, interval: Duration) -> F::Output {
    tokio::pin!(work);
    let interval = interval.max(Duration::from_millis(1));
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);

    loop {
        tokio::select! {
            output = &mut work => return output,
            _ = ticker.tick() => {
                if let Err(e) = responder.busy().await {
                    tracing::debug!(error = %e, "busy signal not delivered");
                }
            }
        }
    }
}

fn is_request(kind: MessageKind) -> bool {
    matches!(
        kind,
        MessageKind::CreateCommandRequest
            | MessageKind::DisposeCommand
            | MessageKind::CancelCommandRequest
            | MessageKind::LockConnectionRequest
            | MessageKind::UnlockConnectionRequest
            | MessageKind::ExecuteNonQueryRequest
            | MessageKind::ExecuteReaderRequest
            | MessageKind::ExecuteReaderReadRequest
            | MessageKind::ExecuteReaderNextResultRequest
            | MessageKind::ExecuteReaderGetRowRequest
            | MessageKind::ExecuteReaderGetDataTypeNameRequest
    )
}

fn unknown_command(id: &str) -> ShareError {
    ShareError::InvalidState(format!("unknown command {}", id))
}

fn exception(kind: MessageKind, err: ShareError) -> WireFrame {
    tracing::debug!(%kind, error = %err, "request failed");
    text_frame(kind, &err.to_string())
}

fn text_frame(kind: MessageKind, text: &str) -> WireFrame {
    WireFrame::from_scalar(kind, text)
}

fn record_frame<T: serde::Serialize>(kind: MessageKind, record: &T) -> WireFrame {
    match WireFrame::from_record(kind, record) {
        Ok(frame) => frame,
        Err(e) => exception(MessageKind::ExecuteReaderException, e),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
