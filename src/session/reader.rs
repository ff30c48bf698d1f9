//! Forward-only reader over a command's result sets.
//!
//! The cursor lives on the server. `read` advances it and fetches the new
//! row, so the typed accessors work on the local copy without round trips.

use std::sync::Arc;
use std::time::Duration;

use super::command::RemoteCommand;
use super::{expect_kind, ShareConnection};
use crate::db::{ColumnInfo, DataTypeNameRequest, FieldType, FieldValue, ReaderMeta, Row};
use crate::error::{Result, ShareError};
use crate::protocol::{MessageKind, WireFrame};

#[derive(Debug)]
pub struct ShareDataReader {
    connection: ShareConnection,
    command: Arc<RemoteCommand>,
    timeout: Duration,
    columns: Vec<ColumnInfo>,
    row: Option<Row>,
    exhausted: bool,
}

impl ShareDataReader {
    pub(crate) fn new(
        connection: ShareConnection,
        command: Arc<RemoteCommand>,
        timeout: Duration,
        columns: Vec<ColumnInfo>,
    ) -> Self {
        Self {
            connection,
            command,
            timeout,
            columns,
            row: None,
            exhausted: false,
        }
    }

    /// Advance to the next row. Returns false once the current result set
    /// is exhausted.
    pub async fn read(&mut self) -> Result<bool> {
        if self.exhausted {
            return Ok(false);
        }

        let request = WireFrame::from_scalar(MessageKind::ExecuteReaderReadRequest, self.command.id());
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::ExecuteRequestResponse)?;

        if !reply.get::<bool>()? {
            self.row = None;
            self.exhausted = true;
            return Ok(false);
        }

        let request = WireFrame::from_scalar(MessageKind::ExecuteReaderGetRowRequest, self.command.id());
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::ExecuteReaderGetRowResponse)?;
        self.row = Some(reply.record()?);
        Ok(true)
    }

    /// Move to the next result set. Returns false when there is none.
    pub async fn next_result(&mut self) -> Result<bool> {
        let request =
            WireFrame::from_scalar(MessageKind::ExecuteReaderNextResultRequest, self.command.id());
        let reply = self.connection.exchange(request, self.timeout).await?;
        self.row = None;

        match reply.kind() {
            MessageKind::ExecuteReaderResponse => {
                let meta: ReaderMeta = reply.record()?;
                self.columns = meta.columns;
                self.exhausted = false;
                Ok(true)
            }
            _ => {
                expect_kind(&reply, MessageKind::ExecuteRequestResponse)?;
                self.columns.clear();
                self.exhausted = true;
                Ok(false)
            }
        }
    }

    /// Number of columns in the current result set.
    pub fn field_count(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn get_name(&self, ordinal: usize) -> Result<&str> {
        Ok(&self.column(ordinal)?.name)
    }

    /// Ordinal of the column called `name` (case-insensitive).
    pub fn get_ordinal(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ShareError::InvalidState(format!("no column named {}", name)))
    }

    pub fn get_value(&self, ordinal: usize) -> Result<&FieldValue> {
        self.column(ordinal)?;
        self.row
            .as_ref()
            .ok_or_else(|| ShareError::InvalidState("no current row".into()))?
            .get(ordinal)
            .ok_or_else(|| out_of_range(ordinal))
    }

    pub fn is_null(&self, ordinal: usize) -> Result<bool> {
        Ok(self.get_value(ordinal)?.is_null())
    }

    pub fn get_string(&self, ordinal: usize) -> Result<String> {
        Ok(self.get_value(ordinal)?.as_string()?)
    }

    pub fn get_int16(&self, ordinal: usize) -> Result<i16> {
        Ok(self.get_value(ordinal)?.as_i16()?)
    }

    pub fn get_int32(&self, ordinal: usize) -> Result<i32> {
        Ok(self.get_value(ordinal)?.as_i32()?)
    }

    pub fn get_int64(&self, ordinal: usize) -> Result<i64> {
        Ok(self.get_value(ordinal)?.as_i64()?)
    }

    pub fn get_double(&self, ordinal: usize) -> Result<f64> {
        Ok(self.get_value(ordinal)?.as_f64()?)
    }

    pub fn get_bytes(&self, ordinal: usize) -> Result<Vec<u8>> {
        Ok(self.get_value(ordinal)?.as_bytes()?)
    }

    /// Storage class of the current value, or the declared affinity when
    /// there is no row or the value is NULL.
    pub fn get_field_type(&self, ordinal: usize) -> Result<FieldType> {
        let column = self.column(ordinal)?;
        let current = self
            .row
            .as_ref()
            .and_then(|row| row.get(ordinal))
            .map(FieldValue::field_type)
            .filter(|t| *t != FieldType::Null);

        Ok(current.unwrap_or_else(|| match &column.decl_type {
            Some(decl) => FieldType::from_decl_type(decl),
            None => FieldType::Null,
        }))
    }

    /// Declared type name as reported by the server.
    pub async fn get_data_type_name(&self, ordinal: usize) -> Result<String> {
        self.column(ordinal)?;
        let request = WireFrame::from_record(
            MessageKind::ExecuteReaderGetDataTypeNameRequest,
            &DataTypeNameRequest {
                command_id: self.command.id().to_string(),
                ordinal: u32::try_from(ordinal).map_err(|_| out_of_range(ordinal))?,
            },
        )?;
        let reply = self.connection.exchange(request, self.timeout).await?;
        expect_kind(&reply, MessageKind::ExecuteRequestResponse)?;
        Ok(reply.text().unwrap_or_default())
    }

    /// Source table of the column, when known.
    pub fn get_table_name(&self, ordinal: usize) -> Result<Option<&str>> {
        Ok(self.column(ordinal)?.table_name.as_deref())
    }

    fn column(&self, ordinal: usize) -> Result<&ColumnInfo> {
        self.columns.get(ordinal).ok_or_else(|| out_of_range(ordinal))
    }
}

fn out_of_range(ordinal: usize) -> ShareError {
    ShareError::InvalidState(format!("ordinal {} out of range", ordinal))
}
