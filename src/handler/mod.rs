//! Handler module - what the coordinator does with each received frame.
//!
//! Provides:
//! - [`FrameHandler`] - the `on_received` observer
//! - [`Responder`] - reply handle bound to the socket the frame came from
//!
//! # Example
//!
//! ```ignore
//! use sqlite_share::handler::{FrameHandler, Responder};
//! use sqlite_share::protocol::{MessageKind, WireFrame};
//!
//! struct Echo;
//!
//! impl FrameHandler for Echo {
//!     fn on_received(&self, frame: WireFrame, responder: Responder) {
//!         tokio::spawn(async move {
//!             let _ = responder.respond(frame).await;
//!         });
//!     }
//! }
//! ```

mod responder;

pub use responder::Responder;

use crate::protocol::WireFrame;

/// Observer invoked for every frame a socket delivers, in arrival order.
///
/// Runs on the socket's reader task, so implementations must return
/// quickly and move real work onto their own tasks. For `SendAndWaitRequest`
/// frames the handler sees the inner request and a correlated responder.
pub trait FrameHandler: Send + Sync + 'static {
    fn on_received(&self, frame: WireFrame, responder: Responder);
}
