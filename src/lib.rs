//! # multiwiki
//!
//! A multi-tenant wiki server built around an embedded HTTP engine. The
//! engine accepts HTTP/1.1 and HTTP/2 connections (cleartext or TLS),
//! normalises every request into a [`state::RequestState`], routes it
//! through a hierarchical route tree with typed validation, and answers
//! through streaming senders with content-encoding negotiation, file
//! serving, Server-Sent Events and multipart ingestion.
//!
//! ## Modules
//!
//! - [`bus`] - Process-wide named events and request-phase hooks.
//! - [`config`] - Listener and engine configuration.
//! - [`encoding`] - `Accept-Encoding` negotiation and stream encoders.
//! - [`error`] - The structured [`error::SendError`] type.
//! - [`router`] - The route tree, dispatch, and typed-route validation.
//! - [`server`] - The listener set and the serve/shutdown lifecycle.
//! - [`state`] - The per-request façade combining inputs and writers.
//! - [`static_files`] - The file sender behind `send_file`.

pub mod bus;
pub mod config;
pub mod encoding;
pub mod error;
pub mod router;
pub mod server;
pub mod state;
pub mod static_files;

#[cfg(test)]
mod tests;

pub use bus::{EventBus, RequestPhase};
pub use config::{EngineConfig, ListenerConfig};
pub use error::{ErrorReason, SendError};
pub use router::{ListenerOptions, RouteNode, Router};
pub use server::Server;
pub use state::{BodyFormat, Flow, RequestState, StreamEnded};
