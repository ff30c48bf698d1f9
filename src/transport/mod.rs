//! Transport module - TCP role election and per-socket links.
//!
//! Provides:
//! - [`negotiate`] - the bind-or-connect race that decides Server vs Client
//! - [`PeerLink`] - one connected socket (writer handle + reader liveness)
//! - [`is_connected`] - liveness check used by the heartbeat

mod link;
mod tcp;

pub use link::{is_connected, PeerLink};
pub use tcp::{negotiate, Negotiated};
