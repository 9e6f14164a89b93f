//! Duplex transport to the ingest backend.
//!
//! One long-lived WebSocket session carries JSON envelopes in both
//! directions. [`BackendConnection`] owns the session lifecycle:
//! registration and asynchronous authentication, a bounded send queue
//! drained by a dedicated sender thread, periodic heartbeats while
//! authenticated, exponential-backoff reconnection, and inbound command
//! dispatch.
//!
//! The wire is abstracted behind [`Dialer`]/[`WireSocket`] so the
//! controller can be exercised against the deterministic in-memory
//! [`MockBackend`]; [`WsDialer`] is the production implementation.

mod connection;
mod mock;
mod protocol;
mod socket;
mod timer;
mod ws;

use std::io;

use thiserror::Error;

pub use connection::{reconnect_delay, BackendConnection, CommandHandler, TransportTuning};
pub use mock::{MockBackend, MockSession};
pub use protocol::{
    envelope, ErrorPayload, RemoveBreakpointPayload, ServerCommand, SetBreakpointPayload,
    AGENT_VERSION, RUNTIME,
};
pub use socket::{Dialer, SocketEvent, WireSocket};
pub use ws::WsDialer;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Dial { url: String, reason: String },
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}
