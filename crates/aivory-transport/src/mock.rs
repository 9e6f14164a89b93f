//! Deterministic, in-memory backend test double.
//!
//! Each successful `dial` opens a fresh [`MockSession`] that records every
//! frame the agent writes and replays frames scripted by the test. Dial
//! failures and remote closes are scriptable, which is enough to drive the
//! whole reconnect state machine without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::socket::{Dialer, SocketEvent, WireSocket};
use crate::TransportError;

#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

#[derive(Default)]
struct MockState {
    dial_failures: Mutex<u32>,
    dial_times: Mutex<Vec<Instant>>,
    sessions: Mutex<Vec<Arc<MockSession>>>,
    auto_register: AtomicBool,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replies `registered` to every `register` frame automatically.
    pub fn auto_register(self) -> Self {
        self.state.auto_register.store(true, Ordering::SeqCst);
        self
    }

    /// Makes the next `count` dial attempts fail.
    pub fn fail_next_dials(&self, count: u32) {
        *self.state.dial_failures.lock().unwrap() = count;
    }

    pub fn dial_count(&self) -> usize {
        self.state.dial_times.lock().unwrap().len()
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.state.dial_times.lock().unwrap().clone()
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.state.sessions.lock().unwrap().clone()
    }

    pub fn last_session(&self) -> Option<Arc<MockSession>> {
        self.state.sessions.lock().unwrap().last().cloned()
    }
}

impl Dialer for MockBackend {
    fn dial(&self, url: &str) -> Result<Arc<dyn WireSocket>, TransportError> {
        self.state.dial_times.lock().unwrap().push(Instant::now());

        {
            let mut failures = self.state.dial_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(TransportError::Dial {
                    url: url.to_string(),
                    reason: "scripted dial failure".to_string(),
                });
            }
        }

        let session = Arc::new(MockSession {
            sent: Mutex::new(Vec::new()),
            inbound: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            remote_close: AtomicBool::new(false),
            auto_register: self.state.auto_register.load(Ordering::SeqCst),
        });
        self.state.sessions.lock().unwrap().push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct MockSession {
    sent: Mutex<Vec<String>>,
    inbound: Mutex<VecDeque<String>>,
    closed: AtomicBool,
    remote_close: AtomicBool,
    auto_register: bool,
}

impl MockSession {
    /// Frames the agent wrote on this session, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Envelope types the agent wrote on this session, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(frame).ok())
            .filter_map(|value| value["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Parsed envelopes of the given type.
    pub fn sent_of_type(&self, kind: &str) -> Vec<serde_json::Value> {
        self.sent_frames()
            .iter()
            .filter_map(|frame| serde_json::from_str::<serde_json::Value>(frame).ok())
            .filter(|value| value["type"] == kind)
            .collect()
    }

    /// Queues a frame for the agent's reader.
    pub fn push_inbound(&self, frame: impl Into<String>) {
        self.inbound.lock().unwrap().push_back(frame.into());
    }

    /// Simulates the backend dropping the connection.
    pub fn close_remote(&self) {
        self.remote_close.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl WireSocket for MockSession {
    fn send_text(&self, frame: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(frame.to_string());

        if self.auto_register {
            let is_register = serde_json::from_str::<serde_json::Value>(frame)
                .map(|value| value["type"] == "register")
                .unwrap_or(false);
            if is_register {
                self.push_inbound(r#"{"type":"registered"}"#);
            }
        }
        Ok(())
    }

    fn poll_frame(&self, timeout: Duration) -> Result<SocketEvent, TransportError> {
        if let Some(frame) = self.inbound.lock().unwrap().pop_front() {
            return Ok(SocketEvent::Frame(frame));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Ok(SocketEvent::Closed {
                remote: self.remote_close.load(Ordering::SeqCst),
            });
        }
        thread::sleep(timeout.min(Duration::from_millis(5)));
        Ok(SocketEvent::Idle)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
