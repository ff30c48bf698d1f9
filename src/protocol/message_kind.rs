//! Message kinds carried in every frame header.
//!
//! The numeric values are the protocol contract between clients and the
//! server. Never renumber an existing kind; append new ones at the end.

use std::fmt;

/// Wire message kind (`u32` little-endian in the frame header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum MessageKind {
    /// Unrecognised or unset kind.
    #[default]
    Unknown = 0,
    /// Outer frame carrying a correlated request envelope.
    SendAndWaitRequest = 1,
    /// Outer frame carrying a correlated response envelope.
    SendAndWaitResponse = 2,
    /// Inner kind of a response envelope meaning "still working".
    SendAndWaitBusy = 3,
    /// Inner kind of a response envelope meaning "gave up on the command".
    SendAndWaitTimeOut = 4,
    /// Create a server-side command from command text.
    CreateCommandRequest = 5,
    /// Command created; payload is the command id.
    CreateCommandResponse = 6,
    /// Command could not be created; payload is the error text.
    CreateCommandException = 7,
    /// Release a server-side command (fire-and-forget).
    DisposeCommand = 8,
    /// Interrupt a running command.
    CancelCommandRequest = 9,
    /// Cancel acknowledged; payload says whether anything was interrupted.
    CancelCommandResponse = 10,
    /// Take the advisory connection lock.
    LockConnectionRequest = 11,
    /// Release the advisory connection lock.
    UnlockConnectionRequest = 12,
    /// Lock or unlock succeeded.
    LockConnectionResponse = 13,
    /// Lock or unlock failed; payload is the error text.
    LockConnectionException = 14,
    /// Execute a command that returns no rows.
    ExecuteNonQueryRequest = 15,
    /// Non-query done; payload is the number of affected rows.
    ExecuteNonQueryResponseSuccess = 16,
    /// Request could not be processed (unknown command, bad payload).
    ExecuteNonQueryResponseError = 17,
    /// The engine failed; payload is the error text.
    ExecuteNonQueryException = 18,
    /// Execute a command and open a reader on its result sets.
    ExecuteReaderRequest = 19,
    /// Reader opened (or advanced to the next result); payload is reader metadata.
    ExecuteReaderResponse = 20,
    /// Reader request failed; payload is the error text.
    ExecuteReaderException = 21,
    /// Advance the reader to the next row.
    ExecuteReaderReadRequest = 22,
    /// Advance the reader to the next result set.
    ExecuteReaderNextResultRequest = 23,
    /// Fetch the current row.
    ExecuteReaderGetRowRequest = 24,
    /// Current row values.
    ExecuteReaderGetRowResponse = 25,
    /// Ask for the declared type name of a column.
    ExecuteReaderGetDataTypeNameRequest = 26,
    /// Generic scalar answer to a reader request.
    ExecuteRequestResponse = 27,
}

impl MessageKind {
    /// Every kind, in wire order.
    pub const ALL: [MessageKind; 28] = [
        MessageKind::Unknown,
        MessageKind::SendAndWaitRequest,
        MessageKind::SendAndWaitResponse,
        MessageKind::SendAndWaitBusy,
        MessageKind::SendAndWaitTimeOut,
        MessageKind::CreateCommandRequest,
        MessageKind::CreateCommandResponse,
        MessageKind::CreateCommandException,
        MessageKind::DisposeCommand,
        MessageKind::CancelCommandRequest,
        MessageKind::CancelCommandResponse,
        MessageKind::LockConnectionRequest,
        MessageKind::UnlockConnectionRequest,
        MessageKind::LockConnectionResponse,
        MessageKind::LockConnectionException,
        MessageKind::ExecuteNonQueryRequest,
        MessageKind::ExecuteNonQueryResponseSuccess,
        MessageKind::ExecuteNonQueryResponseError,
        MessageKind::ExecuteNonQueryException,
        MessageKind::ExecuteReaderRequest,
        MessageKind::ExecuteReaderResponse,
        MessageKind::ExecuteReaderException,
        MessageKind::ExecuteReaderReadRequest,
        MessageKind::ExecuteReaderNextResultRequest,
        MessageKind::ExecuteReaderGetRowRequest,
        MessageKind::ExecuteReaderGetRowResponse,
        MessageKind::ExecuteReaderGetDataTypeNameRequest,
        MessageKind::ExecuteRequestResponse,
    ];

    /// Wire discriminant value.
    #[inline]
    pub const fn to_u32(self) -> u32 {
        self as u32
    }

    /// Parse a wire discriminant; `None` for values this build does not know.
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    /// Parse a wire discriminant, mapping unknown values to [`MessageKind::Unknown`].
    pub fn from_u32_lossy(value: u32) -> Self {
        Self::from_u32(value).unwrap_or(MessageKind::Unknown)
    }

    /// Whether this kind carries an engine/peer failure text.
    pub fn is_exception(self) -> bool {
        matches!(
            self,
            MessageKind::CreateCommandException
                | MessageKind::LockConnectionException
                | MessageKind::ExecuteNonQueryException
                | MessageKind::ExecuteNonQueryResponseError
                | MessageKind::ExecuteReaderException
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.to_u32())
    }
}
