//! Backend session lifecycle: registration, bounded send queue, sender
//! thread, heartbeats, reconnection, inbound dispatch.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::Duration;

use aivory_capture::{BreakpointCapture, ExceptionCapture};
use aivory_config::AgentConfig;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    envelope, ServerCommand, SetBreakpointPayload, AGENT_VERSION, RUNTIME,
};
use crate::socket::{Dialer, SocketEvent, WireSocket};
use crate::timer::{self, TimerHandle};

/// Bounded capacity of the outbound envelope queue.
pub const MESSAGE_QUEUE_SIZE: usize = 1000;

/// Poll bound for reader threads.
const READ_POLL: Duration = Duration::from_millis(100);

/// Pause before retrying an envelope held while the session is down.
const SEND_RETRY_PAUSE: Duration = Duration::from_millis(50);

/// Receiver of server-issued breakpoint commands.
pub trait CommandHandler: Send + Sync {
    fn set_breakpoint(&self, payload: SetBreakpointPayload);
    fn remove_breakpoint(&self, id: &str);
}

/// Timing knobs with production defaults; tests shrink them.
#[derive(Clone, Debug)]
pub struct TransportTuning {
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub send_poll_timeout: Duration,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            reconnect_base_delay: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(60_000),
            max_reconnect_attempts: 10,
            send_poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Backoff for the n-th reconnect attempt (1-based):
/// `min(base * 2^(n-1), max)`.
pub fn reconnect_delay(tuning: &TransportTuning, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(31);
    let base = tuning.reconnect_base_delay.as_millis() as u64;
    let millis = base.saturating_mul(1u64 << shift);
    Duration::from_millis(millis.min(tuning.max_reconnect_delay.as_millis() as u64))
}

/// Duplex connection to the ingest backend.
pub struct BackendConnection {
    inner: Arc<Inner>,
}

struct Inner {
    config: Arc<AgentConfig>,
    dialer: Box<dyn Dialer>,
    handler: Box<dyn CommandHandler>,
    tuning: TransportTuning,

    queue_tx: SyncSender<String>,
    queue_rx: Mutex<Option<Receiver<String>>>,
    enqueued: AtomicU64,
    dropped: AtomicU64,

    socket: RwLock<Option<Arc<dyn WireSocket>>>,
    /// Bumped whenever the live socket changes; stale reader threads
    /// notice and exit.
    socket_generation: AtomicU64,

    connected: AtomicBool,
    authenticated: AtomicBool,
    should_reconnect: AtomicBool,
    shutting_down: AtomicBool,
    reconnect_attempts: AtomicU32,

    heartbeat: Mutex<Option<TimerHandle>>,
    reconnect_task: Mutex<Option<TimerHandle>>,
    sender: Mutex<Option<thread::JoinHandle<()>>>,
}

impl BackendConnection {
    pub fn new(
        config: Arc<AgentConfig>,
        dialer: Box<dyn Dialer>,
        handler: Box<dyn CommandHandler>,
    ) -> Self {
        Self::with_tuning(config, dialer, handler, TransportTuning::default())
    }

    pub fn with_tuning(
        config: Arc<AgentConfig>,
        dialer: Box<dyn Dialer>,
        handler: Box<dyn CommandHandler>,
        tuning: TransportTuning,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::sync_channel(MESSAGE_QUEUE_SIZE);
        Self {
            inner: Arc::new(Inner {
                config,
                dialer,
                handler,
                tuning,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                enqueued: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                socket: RwLock::new(None),
                socket_generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                authenticated: AtomicBool::new(false),
                should_reconnect: AtomicBool::new(true),
                shutting_down: AtomicBool::new(false),
                reconnect_attempts: AtomicU32::new(0),
                heartbeat: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                sender: Mutex::new(None),
            }),
        }
    }

    /// Initiates a connection attempt. Returns immediately; the dial runs
    /// on a worker thread.
    pub fn connect(&self) {
        if self.inner.connected.load(Ordering::SeqCst) {
            debug!("already connected");
            return;
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(&self.inner);
        let _ = thread::Builder::new()
            .name("aivory-connect".to_string())
            .spawn(move || Inner::dial_and_run(worker));
    }

    /// Terminal shutdown: stops reconnection, timers, and the sender;
    /// closes the socket; drops queued envelopes.
    pub fn disconnect(&self) {
        self.inner.should_reconnect.store(false, Ordering::SeqCst);
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.teardown_session();
    }

    /// Connected and authenticated.
    pub fn is_connected(&self) -> bool {
        self.inner.authenticated.load(Ordering::SeqCst)
    }

    pub fn will_reconnect(&self) -> bool {
        self.inner.should_reconnect.load(Ordering::SeqCst)
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Envelopes accepted onto the queue since startup.
    pub fn enqueued_count(&self) -> u64 {
        self.inner.enqueued.load(Ordering::SeqCst)
    }

    /// Envelopes dropped because the queue was full or stopped.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    /// Queues an exception capture, flattened to the wire schema.
    pub fn send_exception(&self, capture: &ExceptionCapture) {
        if !self.inner.authenticated.load(Ordering::SeqCst) {
            debug!("not authenticated, queuing exception");
        }

        let config = &self.inner.config;
        let mut payload = json!({
            "exception_type": capture.exception_type,
            "message": capture.message,
            "fingerprint": capture.fingerprint,
            "stack_trace": capture.stack_trace,
            "local_variables": capture.local_variables,
            "method_arguments": capture.method_arguments,
            "captured_at": capture.captured_at,
            "agent_id": config.agent_id,
            "environment": config.environment,
            "runtime": RUNTIME,
            "runtime_version": config.runtime_version,
        });

        if let Some(frame) = capture.stack_trace.first() {
            payload["file_path"] = json!(frame.file_path);
            payload["file_name"] = json!(frame.file_name);
            payload["line_number"] = json!(frame.line_number);
            payload["method_name"] = json!(frame.method_name);
            payload["class_name"] = json!(frame.class_name);
        }
        if let Some(context) = &config.git_context {
            payload["git_context"] = json!(context);
        }

        self.inner.enqueue("exception", payload);
    }

    /// Queues a breakpoint-hit notification.
    pub fn send_breakpoint_hit(&self, capture: &BreakpointCapture) {
        let payload = json!({
            "breakpoint_id": capture.breakpoint_id,
            "agent_id": self.inner.config.agent_id,
            "captured_at": capture.captured_at,
            "local_variables": capture.local_variables,
            "stack_trace": capture.stack_trace,
        });
        self.inner.enqueue("breakpoint_hit", payload);
    }

    /// Queues a pre-formed payload (native subagent path).
    pub fn send_raw(&self, kind: &str, payload: serde_json::Value) {
        self.inner.enqueue(kind, payload);
    }
}

impl Inner {
    fn dial_and_run(self: Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) || self.connected.load(Ordering::SeqCst) {
            return;
        }
        self.start_sender();

        info!("connecting to backend: {}", self.config.backend_url);
        match self.dialer.dial(&self.config.backend_url) {
            Ok(socket) => {
                let generation = self.socket_generation.fetch_add(1, Ordering::SeqCst) + 1;
                *self.socket.write().unwrap() = Some(Arc::clone(&socket));

                // Register before opening the queue to the sender so no
                // queued envelope can precede it on this session.
                self.register();
                self.connected.store(true, Ordering::SeqCst);

                let reader = Arc::clone(&self);
                let _ = thread::Builder::new()
                    .name("aivory-reader".to_string())
                    .spawn(move || reader.read_loop(socket, generation));
            }
            Err(err) => {
                error!("failed to connect to backend: {err}");
                self.schedule_reconnect();
            }
        }
    }

    fn register(&self) {
        let config = &self.config;
        let mut payload = json!({
            "api_key": config.api_key.clone().unwrap_or_default(),
            "agent_id": config.agent_id,
            "hostname": config.hostname,
            "runtime": RUNTIME,
            "runtime_version": config.runtime_version,
            "agent_version": AGENT_VERSION,
            "environment": config.environment,
        });
        if let Some(context) = &config.git_context {
            payload["git_context"] = json!(context);
        }

        let frame = envelope("register", payload);
        if let Some(socket) = self.socket.read().unwrap().clone() {
            if let Err(err) = socket.send_text(&frame) {
                warn!("failed to send register: {err}");
            }
        }
    }

    fn read_loop(self: Arc<Self>, socket: Arc<dyn WireSocket>, generation: u64) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst)
                || self.socket_generation.load(Ordering::SeqCst) != generation
            {
                return;
            }
            match socket.poll_frame(READ_POLL) {
                Ok(SocketEvent::Frame(text)) => self.handle_frame(&text),
                Ok(SocketEvent::Idle) => {}
                Ok(SocketEvent::Closed { remote }) => {
                    self.on_close(remote, generation);
                    return;
                }
                Err(err) => {
                    warn!("socket read failed: {err}");
                    self.on_close(true, generation);
                    return;
                }
            }
        }
    }

    fn handle_frame(self: &Arc<Self>, text: &str) {
        let command = match serde_json::from_str::<ServerCommand>(text) {
            Ok(command) => command,
            Err(err) => {
                warn!("dropping malformed backend message: {err}");
                return;
            }
        };

        match command {
            ServerCommand::Registered => {
                self.authenticated.store(true, Ordering::SeqCst);
                self.reconnect_attempts.store(0, Ordering::SeqCst);
                self.start_heartbeat();
                info!("agent registered successfully");
            }
            ServerCommand::Error { payload } => {
                error!("backend error: {} - {}", payload.code, payload.message);
                if payload.is_auth_failure() {
                    error!("authentication failed, agent will not reconnect");
                    self.should_reconnect.store(false, Ordering::SeqCst);
                    self.teardown_session();
                }
            }
            ServerCommand::SetBreakpoint { payload } => {
                info!(
                    "breakpoint set: {} at {}:{}",
                    payload.id, payload.class_name, payload.line_number
                );
                self.handler.set_breakpoint(payload);
            }
            ServerCommand::RemoveBreakpoint { payload } => {
                info!("breakpoint removed: {}", payload.id);
                self.handler.remove_breakpoint(&payload.id);
            }
            ServerCommand::Configure => {
                debug!("configuration update received");
            }
            ServerCommand::Unknown => {
                debug!("unhandled message type");
            }
        }
    }

    fn on_close(self: &Arc<Self>, remote: bool, generation: u64) {
        if self.socket_generation.load(Ordering::SeqCst) != generation {
            return;
        }
        info!("backend connection closed (remote: {remote})");
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
        self.stop_heartbeat();
        *self.socket.write().unwrap() = None;

        if remote && self.should_reconnect.load(Ordering::SeqCst) {
            self.schedule_reconnect();
        }
    }

    /// Stops heartbeat and reconnect timers and closes the live socket.
    fn teardown_session(&self) {
        self.stop_heartbeat();
        if let Some(task) = self.reconnect_task.lock().unwrap().take() {
            task.cancel();
        }
        self.socket_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(socket) = self.socket.write().unwrap().take() {
            socket.close();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.authenticated.store(false, Ordering::SeqCst);
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if !self.should_reconnect.load(Ordering::SeqCst) {
            return;
        }

        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.tuning.max_reconnect_attempts {
            error!("max reconnect attempts reached, giving up");
            return;
        }

        let delay = reconnect_delay(&self.tuning, attempt);
        info!("scheduling reconnect attempt {attempt} in {}ms", delay.as_millis());

        let weak = Arc::downgrade(self);
        let handle = timer::once("aivory-reconnect", delay, move || {
            if let Some(inner) = weak.upgrade() {
                Inner::dial_and_run(inner);
            }
        });
        if let Some(previous) = self.reconnect_task.lock().unwrap().replace(handle) {
            previous.cancel();
        }
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handle = timer::periodic("aivory-heartbeat", self.tuning.heartbeat_interval, move || {
            let Some(inner) = weak.upgrade() else { return };
            if inner.authenticated.load(Ordering::SeqCst) {
                inner.enqueue(
                    "heartbeat",
                    json!({
                        "timestamp": Utc::now().timestamp_millis(),
                        "agent_id": inner.config.agent_id,
                    }),
                );
            }
        });
        if let Some(previous) = self.heartbeat.lock().unwrap().replace(handle) {
            previous.cancel();
        }
    }

    fn stop_heartbeat(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.cancel();
        }
    }

    fn start_sender(self: &Arc<Self>) {
        let mut slot = self.sender.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let Some(receiver) = self.queue_rx.lock().unwrap().take() else {
            return;
        };
        let weak = Arc::downgrade(self);
        let poll = self.tuning.send_poll_timeout;
        *slot = thread::Builder::new()
            .name("aivory-sender".to_string())
            .spawn(move || run_sender(weak, receiver, poll))
            .ok();
    }

    /// Non-blocking enqueue; a full queue drops the envelope.
    fn enqueue(&self, kind: &str, payload: serde_json::Value) {
        let frame = envelope(kind, payload);
        match self.queue_tx.try_send(frame) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("message queue full, dropping message of type: {kind}");
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::SeqCst);
                warn!("sender stopped, dropping message of type: {kind}");
            }
        }
    }
}

fn run_sender(inner: Weak<Inner>, receiver: Receiver<String>, poll: Duration) {
    let mut held: Option<String> = None;
    loop {
        let frame = match held.take() {
            Some(frame) => frame,
            None => match receiver.recv_timeout(poll) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => match inner.upgrade() {
                    Some(strong) if !strong.shutting_down.load(Ordering::SeqCst) => continue,
                    _ => return,
                },
                Err(RecvTimeoutError::Disconnected) => return,
            },
        };

        let Some(strong) = inner.upgrade() else { return };
        if strong.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let socket = strong.socket.read().unwrap().clone();
        match socket {
            Some(socket) if strong.connected.load(Ordering::SeqCst) => {
                if let Err(err) = socket.send_text(&frame) {
                    warn!("error sending message: {err}");
                }
            }
            _ => {
                // Session down: hold the envelope until it is restored.
                held = Some(frame);
                drop(strong);
                thread::sleep(SEND_RETRY_PAUSE);
            }
        }
    }
}
