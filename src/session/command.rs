//! Commands executed through a [`ShareConnection`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{expect_kind, lock, ConnectionState, ShareConnection, ShareDataReader};
use crate::db::{CreateCommand, ExecuteRequest, FieldValue, ReaderMeta};
use crate::error::{Result, ShareError};
use crate::protocol::{MessageKind, WireFrame};

/// Server-side half of a command, shared by the command and its readers.
///
/// The server forgets the command once the last of them is dropped.
#[derive(Debug)]
pub(crate) struct RemoteCommand {
    connection: ShareConnection,
    epoch: u64,
    id: String,
    disposed: AtomicBool,
}

impl RemoteCommand {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    /// The dispose request, at most once, and only while the server that
    /// created the command is still the one we talk to.
    fn take_dispose(&self) -> Option<WireFrame> {
        if self.disposed.swap(true, Ordering::AcqRel) || self.connection.epoch() != self.epoch {
            return None;
        }
        Some(WireFrame::from_scalar(MessageKind::DisposeCommand, self.id.as_str()))
    }
}

impl Drop for RemoteCommand {
    fn drop(&mut self) {
        if self.connection.state() == ConnectionState::Closed {
            return;
        }
        let Some(request) = self.take_dispose() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let connection = self.connection.clone();
        let command_id = self.id.clone();
        runtime.spawn(async move {
            if let Err(e) = connection.notify(request).await {
                tracing::debug!(%command_id, error = %e, "dispose not delivered");
            }
        });
    }
}

/// SQL text plus the id of its server-side counterpart.
///
/// The server-side command is created on first execution and again after
/// every reconnect, since a new server knows nothing of the old one's
/// commands. Dropping the command (and every reader it opened) disposes it.
#[derive(Debug)]
pub struct ShareCommand {
    connection: ShareConnection,
    text: String,
    timeout: Duration,
    remote: Mutex<Option<Arc<RemoteCommand>>>,
}

impl ShareCommand {
    pub(crate) fn new(connection: ShareConnection, text: String, timeout: Duration) -> Self {
        Self {
            connection,
            text,
            timeout,
            remote: Mutex::new(None),
        }
    }

    /// SQL text of the command.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Command timeout; zero means no limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Replace the command timeout; zero means no limit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run the command; returns the number of rows changed.
    pub async fn execute_non_query(&self) -> Result<i64> {
        let remote = self.remote_command().await?;
        let request = self.execute_request(MessageKind::ExecuteNonQueryRequest, remote.id())?;
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::ExecuteNonQueryResponseSuccess)?;
        Ok(reply.get::<i64>()?)
    }

    /// Run the command and open a reader over its result sets.
    pub async fn execute_reader(&self) -> Result<ShareDataReader> {
        let remote = self.remote_command().await?;
        let request = self.execute_request(MessageKind::ExecuteReaderRequest, remote.id())?;
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::ExecuteReaderResponse)?;
        let meta: ReaderMeta = reply.record()?;

        Ok(ShareDataReader::new(
            self.connection.clone(),
            remote,
            self.timeout,
            meta.columns,
        ))
    }

    /// First column of the first row, `None` when there are no rows.
    pub async fn execute_scalar(&self) -> Result<Option<FieldValue>> {
        let mut reader = self.execute_reader().await?;
        if reader.field_count() == 0 || !reader.read().await? {
            return Ok(None);
        }
        Ok(Some(reader.get_value(0)?.clone()))
    }

    /// Stop the command if it is queued or executing on the server.
    /// Returns whether anything was stopped.
    pub async fn cancel(&self) -> Result<bool> {
        let Some(remote) = self.current_remote() else {
            return Ok(false);
        };
        let request = WireFrame::from_scalar(MessageKind::CancelCommandRequest, remote.id());
        let reply = self.connection.exchange(request, Duration::ZERO).await?;
        expect_kind(&reply, MessageKind::CancelCommandResponse)?;
        Ok(reply.get_with::<bool>(false)?)
    }

    /// Release the server-side command now, even while readers are open.
    /// Fire-and-forget.
    pub async fn dispose(self) -> Result<()> {
        let request = lock(&self.remote)
            .take()
            .and_then(|remote| remote.take_dispose());
        match request {
            Some(request) => self.connection.notify(request).await,
            None => Ok(()),
        }
    }

    fn execute_request(&self, kind: MessageKind, command_id: &str) -> Result<WireFrame> {
        let timeout_ms = u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX);
        WireFrame::from_record(
            kind,
            &ExecuteRequest {
                command_id: command_id.to_string(),
                timeout_ms,
            },
        )
    }

    /// Server-side command valid for the current epoch, if it exists.
    fn current_remote(&self) -> Option<Arc<RemoteCommand>> {
        let epoch = self.connection.epoch();
        lock(&self.remote)
            .as_ref()
            .filter(|remote| remote.epoch == epoch)
            .cloned()
    }

    /// Server-side command, creating it when needed.
    async fn remote_command(&self) -> Result<Arc<RemoteCommand>> {
        if let Some(remote) = self.current_remote() {
            return Ok(remote);
        }

        let epoch = self.connection.epoch();
        let request = WireFrame::from_record(
            MessageKind::CreateCommandRequest,
            &CreateCommand {
                text: self.text.clone(),
            },
        )?;
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::CreateCommandResponse)?;
        let id = reply
            .text()
            .ok_or_else(|| ShareError::Protocol("empty command id".into()))?;

        tracing::debug!(command_id = %id, epoch, "command created");
        let remote = Arc::new(RemoteCommand {
            connection: self.connection.clone(),
            epoch,
            id,
            disposed: AtomicBool::new(false),
        });
        *lock(&self.remote) = Some(remote.clone());
        Ok(remote)
    }
}
