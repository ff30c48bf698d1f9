//! # sqlite-share
//!
//! Share one embedded SQLite database between cooperating local processes.
//!
//! Every process opens a [`ShareConnection`] against the same TCP endpoint.
//! The first to bind it becomes the server and owns the database file; the
//! others connect to it and have their commands executed there. If the
//! server goes away, the remaining processes re-run the election.
//!
//! ## Layers
//!
//! - **Protocol**: length-prefixed [`WireFrame`]s (`[i32 LE length][u32 LE kind][payload]`),
//!   reassembled from the byte stream by a [`FrameAssembler`]
//! - **Coordinator**: role election, per-socket reader/writer tasks, heartbeat
//! - **Correlator**: send-and-wait with busy keepalives over the shared socket
//! - **Façade**: [`ShareConnection`], [`ShareCommand`], [`ShareDataReader`]
//!
//! ## Example
//!
//! ```ignore
//! use sqlite_share::{ShareConfig, ShareConnection};
//!
//! #[tokio::main]
//! async fn main() -> sqlite_share::Result<()> {
//!     let connection = ShareConnection::open(ShareConfig::new("shared.db")).await?;
//!
//!     connection
//!         .create_command("insert into log (line) values ('hello')")
//!         .execute_non_query()
//!         .await?;
//!
//!     connection.close().await
//! }
//! ```

pub mod codec;
pub mod config;
pub mod coordinator;
pub mod correlator;
pub mod db;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::ShareConfig;
pub use coordinator::{ConnectionCoordinator, ConnectionEvent, PeerId, Role};
pub use correlator::RequestCorrelator;
pub use db::{DatabaseServer, FieldType, FieldValue};
pub use error::{Result, ShareError};
pub use handler::{FrameHandler, Responder};
pub use protocol::{CorrelatedEnvelope, FrameAssembler, MessageKind, WireFrame};
pub use session::{ConnectionState, ShareCommand, ShareConnection, ShareDataReader};
