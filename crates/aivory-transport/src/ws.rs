//! WebSocket wire implementation over `tungstenite`.
//!
//! The socket is synchronous; the reader thread polls with a short stream
//! read timeout so the write half (behind the same lock) is never starved
//! for long.

use std::io::ErrorKind;
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::socket::{Dialer, SocketEvent, WireSocket};
use crate::TransportError;

/// Read timeout on the underlying stream; bounds how long the socket lock
/// is held per poll.
const READ_POLL: Duration = Duration::from_millis(100);

pub struct WsDialer;

impl Dialer for WsDialer {
    fn dial(&self, url: &str) -> Result<Arc<dyn WireSocket>, TransportError> {
        let (socket, _response) = tungstenite::connect(url).map_err(|err| TransportError::Dial {
            url: url.to_string(),
            reason: err.to_string(),
        })?;

        match socket.get_ref() {
            MaybeTlsStream::Plain(stream) => {
                stream.set_read_timeout(Some(READ_POLL))?;
            }
            MaybeTlsStream::NativeTls(stream) => {
                stream.get_ref().set_read_timeout(Some(READ_POLL))?;
            }
            _ => {}
        }

        Ok(Arc::new(WsSocket {
            socket: Mutex::new(socket),
        }))
    }
}

struct WsSocket {
    socket: Mutex<WebSocket<MaybeTlsStream<TcpStream>>>,
}

impl WireSocket for WsSocket {
    fn send_text(&self, frame: &str) -> Result<(), TransportError> {
        let mut socket = self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        socket
            .send(Message::Text(frame.to_string()))
            .map_err(|err| TransportError::WebSocket(err.to_string()))
    }

    fn poll_frame(&self, _timeout: Duration) -> Result<SocketEvent, TransportError> {
        // The poll bound is enforced by the stream read timeout set at dial
        // time, not by the argument.
        let mut socket = self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match socket.read() {
            Ok(Message::Text(text)) => Ok(SocketEvent::Frame(text)),
            Ok(Message::Close(_)) => Ok(SocketEvent::Closed { remote: true }),
            Ok(_) => Ok(SocketEvent::Idle),
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                Ok(SocketEvent::Idle)
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                Ok(SocketEvent::Closed { remote: true })
            }
            Err(err) => Err(TransportError::WebSocket(err.to_string())),
        }
    }

    fn close(&self) {
        let mut socket = self.socket.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _ = socket.close(None);
    }
}
