//! Database side: the embedded engine, row/record types and the request
//! handler run by whichever process wins the server role.

mod engine;
mod fields;
mod server;

pub use engine::{Abandoned, Engine, Ticket};
pub use fields::{
    ColumnInfo, CreateCommand, DataTypeNameRequest, ExecuteRequest, FieldType, FieldValue,
    ReaderMeta, ResultSet, Row,
};
pub use server::{DatabaseServer, Owner};
