//! Wire abstraction: a dialer producing duplex text-frame sockets.

use std::sync::Arc;
use std::time::Duration;

use crate::TransportError;

/// Outcome of one bounded poll on a socket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketEvent {
    /// A complete inbound text frame.
    Frame(String),
    /// Nothing arrived within the poll bound.
    Idle,
    /// The connection is gone. `remote` distinguishes peer-initiated
    /// closure from local shutdown.
    Closed { remote: bool },
}

/// One live duplex connection. Implementations must be safe to drive from
/// a reader thread while other threads send.
pub trait WireSocket: Send + Sync {
    fn send_text(&self, frame: &str) -> Result<(), TransportError>;

    /// Waits up to roughly `timeout` for the next inbound event.
    fn poll_frame(&self, timeout: Duration) -> Result<SocketEvent, TransportError>;

    /// Initiates local closure. Idempotent.
    fn close(&self);
}

/// Connection factory, one `dial` per connection attempt.
pub trait Dialer: Send + Sync {
    fn dial(&self, url: &str) -> Result<Arc<dyn WireSocket>, TransportError>;
}
