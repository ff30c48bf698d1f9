//! Thin wrapper over the embedded SQLite connection owned by the server.
//!
//! All calls block; the server runs them on the blocking pool. One
//! connection serializes every command. Each call carries a [`Ticket`] so a
//! timeout or cancel can stop it whether it is still queued for the
//! connection or already executing.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::{Batch, Connection, ErrorCode, InterruptHandle};

use super::fields::{ColumnInfo, FieldValue, ResultSet};
use crate::error::{Result, ShareError};

const PENDING: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const ABANDONED: u8 = 3;

/// Lifecycle flag of one engine call, shared by the caller and the blocking
/// task running it.
#[derive(Debug, Clone)]
pub struct Ticket {
    command_id: Arc<str>,
    state: Arc<AtomicU8>,
}

impl Ticket {
    /// Fresh, not yet started ticket for `command_id`.
    pub fn new(command_id: &str) -> Self {
        Self {
            command_id: Arc::from(command_id),
            state: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    /// Whether the call was abandoned before or while it ran.
    pub fn is_abandoned(&self) -> bool {
        self.state.load(Ordering::Acquire) == ABANDONED
    }

    fn start(&self) -> bool {
        self.state
            .compare_exchange(PENDING, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Statements of a batch after an abandon must not start.
    fn check(&self) -> Result<()> {
        if self.is_abandoned() {
            Err(interrupted())
        } else {
            Ok(())
        }
    }

    pub(crate) fn same(&self, other: &Ticket) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

/// What [`Engine::abandon`] did to a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandoned {
    /// The call had not reached the connection and never will.
    NotStarted,
    /// The call was executing and has been interrupted.
    Interrupted,
    /// The call had already finished; its effects stand.
    Finished,
}

pub struct Engine {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    running: Mutex<Option<Ticket>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("running", &self.running_command())
            .finish()
    }
}

impl Engine {
    /// Open (creating if needed) the database file.
    pub fn open(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");
        Ok(Self::from_connection(Connection::open(path)?))
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_connection(Connection::open_in_memory()?))
    }

    fn from_connection(conn: Connection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        Self {
            conn: Mutex::new(conn),
            interrupt,
            running: Mutex::new(None),
        }
    }

    /// Run every statement of `sql`; returns the number of rows changed.
    pub fn execute_non_query(&self, ticket: &Ticket, sql: &str) -> Result<i64> {
        self.with_connection(ticket, |conn| {
            let before = total_changes(conn)?;

            let mut batch = Batch::new(conn, sql);
            while let Some(mut stmt) = batch.next()? {
                ticket.check()?;
                let mut rows = stmt.raw_query();
                while rows.next()?.is_some() {}
            }

            Ok(total_changes(conn)? - before)
        })
    }

    /// Run every statement of `sql` and materialize the result sets of
    /// those that return columns.
    pub fn query(&self, ticket: &Ticket, sql: &str) -> Result<Vec<ResultSet>> {
        self.with_connection(ticket, |conn| {
            let mut sets = Vec::new();

            let mut batch = Batch::new(conn, sql);
            while let Some(mut stmt) = batch.next()? {
                ticket.check()?;
                let columns: Vec<ColumnInfo> = stmt
                    .columns()
                    .into_iter()
                    .map(|column| ColumnInfo {
                        name: column.name().to_string(),
                        decl_type: column.decl_type().map(str::to_string),
                        table_name: None,
                    })
                    .collect();
                let width = columns.len();

                let mut rows = Vec::new();
                let mut cursor = stmt.raw_query();
                while let Some(row) = cursor.next()? {
                    let mut values = Vec::with_capacity(width);
                    for i in 0..width {
                        values.push(FieldValue::from(row.get_ref(i)?));
                    }
                    rows.push(values);
                }

                if width > 0 {
                    sets.push(ResultSet { columns, rows });
                }
            }

            Ok(sets)
        })
    }

    /// Stop the call behind `ticket`.
    ///
    /// The `running` slot is held across the check and the interrupt, so the
    /// interrupt can only land on the call it was meant for.
    pub fn abandon(&self, ticket: &Ticket) -> Abandoned {
        let running = lock(&self.running);

        if ticket
            .state
            .compare_exchange(PENDING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            tracing::debug!(command_id = ticket.command_id(), "abandoned before start");
            return Abandoned::NotStarted;
        }

        match running.as_ref() {
            Some(current) if current.same(ticket) => {
                ticket.state.store(ABANDONED, Ordering::Release);
                tracing::debug!(command_id = ticket.command_id(), "interrupting command");
                self.interrupt.interrupt();
                Abandoned::Interrupted
            }
            _ => Abandoned::Finished,
        }
    }

    /// Id of the command holding the connection.
    pub fn running_command(&self) -> Option<String> {
        lock(&self.running).as_ref().map(|t| t.command_id().to_string())
    }

    fn with_connection<T>(&self, ticket: &Ticket, work: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = lock(&self.conn);

        {
            let mut running = lock(&self.running);
            if !ticket.start() {
                return Err(interrupted());
            }
            *running = Some(ticket.clone());
        }

        let result = work(&conn);

        let mut running = lock(&self.running);
        *running = None;
        // An abandon that raced the last statement keeps its ABANDONED mark.
        let _ = ticket
            .state
            .compare_exchange(RUNNING, DONE, Ordering::AcqRel, Ordering::Acquire);
        result
    }
}

/// True when `err` is the engine reporting an interrupted statement.
pub fn is_interrupted(err: &ShareError) -> bool {
    matches!(
        err,
        ShareError::Database(rusqlite::Error::SqliteFailure(e, _))
            if e.code == ErrorCode::OperationInterrupted
    )
}

fn interrupted() -> ShareError {
    ShareError::Database(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_INTERRUPT),
        Some("interrupted".into()),
    ))
}

fn total_changes(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?)
}

/// A panic inside a command must not wedge the connection for everyone else.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const ENDLESS: &str =
        "with recursive c(x) as (select 1 union all select x + 1 from c) select count(*) from c";

    #[test]
    fn test_non_query_counts_changes() {
        let engine = Engine::open_in_memory().unwrap();

        let created = engine
            .execute_non_query(&Ticket::new("c1"), "create table t (name varchar, value integer)")
            .unwrap();
        assert_eq!(created, 0);

        let inserted = engine
            .execute_non_query(
                &Ticket::new("c1"),
                "insert into t values ('a', 10); insert into t values ('b', 20)",
            )
            .unwrap();
        assert_eq!(inserted, 2);
        assert_eq!(engine.running_command(), None);
    }

    #[test]
    fn test_query_materializes_each_result_set() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .execute_non_query(
                &Ticket::new("c1"),
                "create table t (name varchar, value integer); insert into t values ('a', 10)",
            )
            .unwrap();

        let sets = engine
            .query(
                &Ticket::new("c2"),
                "select name, value from t; update t set value = 11; select count(*) from t",
            )
            .unwrap();

        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].columns[0].name, "name");
        assert_eq!(sets[0].columns[1].decl_type.as_deref(), Some("integer"));
        assert_eq!(
            sets[0].rows,
            vec![vec![FieldValue::Text("a".into()), FieldValue::Integer(10)]]
        );
        assert_eq!(sets[1].columns[0].decl_type, None);
        assert_eq!(sets[1].rows, vec![vec![FieldValue::Integer(1)]]);
    }

    #[test]
    fn test_syntax_error_is_database_error() {
        let engine = Engine::open_in_memory().unwrap();
        let err = engine.execute_non_query(&Ticket::new("c1"), "selec 1").unwrap_err();
        assert!(matches!(err, ShareError::Database(_)));
        assert!(!is_interrupted(&err));
    }

    #[test]
    fn test_abandoned_ticket_never_runs() {
        let engine = Engine::open_in_memory().unwrap();
        engine
            .execute_non_query(&Ticket::new("c1"), "create table t (value integer)")
            .unwrap();

        let ticket = Ticket::new("c2");
        assert_eq!(engine.abandon(&ticket), Abandoned::NotStarted);

        let err = engine
            .execute_non_query(&ticket, "insert into t values (1)")
            .unwrap_err();
        assert!(is_interrupted(&err));

        let sets = engine.query(&Ticket::new("c3"), "select count(*) from t").unwrap();
        assert_eq!(sets[0].rows, vec![vec![FieldValue::Integer(0)]]);
    }

    #[test]
    fn test_finished_ticket_is_not_interrupted() {
        let engine = Engine::open_in_memory().unwrap();
        let ticket = Ticket::new("c1");
        engine.query(&ticket, "select 1").unwrap();

        assert_eq!(engine.abandon(&ticket), Abandoned::Finished);
        assert!(!ticket.is_abandoned());

        // The next call is unaffected.
        let sets = engine.query(&Ticket::new("c2"), "select 2").unwrap();
        assert_eq!(sets[0].rows, vec![vec![FieldValue::Integer(2)]]);
    }

    #[test]
    fn test_abandon_interrupts_running_call() {
        let engine = Arc::new(Engine::open_in_memory().unwrap());
        let ticket = Ticket::new("slow");

        let worker = {
            let engine = engine.clone();
            let ticket = ticket.clone();
            std::thread::spawn(move || engine.query(&ticket, ENDLESS))
        };

        while engine.running_command().is_none() {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.abandon(&ticket), Abandoned::Interrupted);

        let err = worker.join().unwrap().unwrap_err();
        assert!(is_interrupted(&err));
        assert_eq!(engine.running_command(), None);
    }
}
