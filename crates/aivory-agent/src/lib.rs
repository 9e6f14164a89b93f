//! Agent context and advice-site entry points.
//!
//! The bytecode-instrumentation collaborator injects calls into covered
//! methods; those advice sites resolve the process-wide [`Agent`] through
//! one [`installed`] lookup and hand it raw program state. Everything
//! downstream of an advice site swallows its own failures: the host must
//! observe exactly the behavior it would without the agent attached.

mod breakpoint;
mod filter;
mod interceptor;
mod native;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};

use aivory_capture::{
    HeapSnapshot, MethodDescriptor, ObjectRef, RawFrame, RuntimeValue, ThrowableSnapshot,
};
use aivory_config::AgentConfig;
use aivory_transport::{
    BackendConnection, CommandHandler, Dialer, SetBreakpointPayload, TransportTuning, WsDialer,
};
use tracing::{error, info, warn};

pub use breakpoint::{BreakpointRecord, BreakpointRegistry, NoRetransform, Retransform};
pub use filter::should_instrument;

/// One method-exit observation delivered by the instrumentation layer.
pub struct MethodExitEvent<'a> {
    pub heap: &'a HeapSnapshot,
    pub receiver: Option<&'a ObjectRef>,
    pub method: &'a MethodDescriptor,
    pub args: &'a [RuntimeValue],
    /// The propagating throwable; `None` on normal exit.
    pub thrown: Option<&'a ThrowableSnapshot>,
}

/// Immutable agent context: config, transport, breakpoint registry.
pub struct Agent {
    config: Arc<AgentConfig>,
    connection: BackendConnection,
    breakpoints: Arc<BreakpointRegistry>,
    native_dedup: native::DedupWindow,
}

impl Agent {
    pub fn new(
        config: Arc<AgentConfig>,
        dialer: Box<dyn Dialer>,
        retransform: Arc<dyn Retransform>,
    ) -> Agent {
        Self::with_tuning(config, dialer, retransform, TransportTuning::default())
    }

    pub fn with_tuning(
        config: Arc<AgentConfig>,
        dialer: Box<dyn Dialer>,
        retransform: Arc<dyn Retransform>,
        tuning: TransportTuning,
    ) -> Agent {
        let breakpoints = Arc::new(BreakpointRegistry::new(retransform));
        let handler = RegistryCommandHandler {
            registry: Arc::clone(&breakpoints),
        };
        let connection =
            BackendConnection::with_tuning(Arc::clone(&config), dialer, Box::new(handler), tuning);
        Agent {
            config,
            connection,
            breakpoints,
            native_dedup: native::DedupWindow::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn connection(&self) -> &BackendConnection {
        &self.connection
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    pub(crate) fn native_dedup(&self) -> &native::DedupWindow {
        &self.native_dedup
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn shutdown(&self) {
        info!("agent shutting down");
        self.connection.disconnect();
    }

    /// Advice entry: a method is exiting with `thrown` propagating.
    pub fn on_method_exit(&self, event: MethodExitEvent<'_>) {
        interceptor::handle_method_exit(self, event);
    }

    /// Advice entry: a probe location was reached.
    pub fn on_breakpoint_hit(
        &self,
        heap: &HeapSnapshot,
        class_name: &str,
        line_number: u32,
        current_stack: &[RawFrame],
        receiver: Option<&ObjectRef>,
        args: &[RuntimeValue],
    ) {
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.breakpoints.on_hit(
                &self.config,
                &self.connection,
                heap,
                class_name,
                line_number,
                current_stack,
                receiver,
                args,
            );
        }));
        if result.is_err() {
            warn!("breakpoint hit handling failed");
        }
    }

    /// Native subagent entry: an exception with externally captured
    /// locals.
    pub fn on_native_exception(
        &self,
        location: &str,
        variables_json: &str,
        exception: &ThrowableSnapshot,
    ) {
        native::handle_native_exception(self, location, variables_json, exception);
    }
}

struct RegistryCommandHandler {
    registry: Arc<BreakpointRegistry>,
}

impl CommandHandler for RegistryCommandHandler {
    fn set_breakpoint(&self, payload: SetBreakpointPayload) {
        self.registry.set(
            payload.id,
            payload.class_name,
            payload.line_number,
            payload.condition,
        );
    }

    fn remove_breakpoint(&self, id: &str) {
        self.registry.remove(id);
    }
}

static AGENT: OnceLock<Agent> = OnceLock::new();

/// Initializes the process-wide agent and connects to the backend.
/// Returns `false` (leaving the agent uninstalled) when the API key is
/// missing or the agent was already installed.
pub fn install(agent_args: Option<&str>, retransform: Arc<dyn Retransform>) -> bool {
    if AGENT.get().is_some() {
        warn!("agent already initialized, skipping");
        return false;
    }

    let config = Arc::new(AgentConfig::parse(agent_args));
    info!("configuration loaded");
    info!("  backend url: {}", config.backend_url);
    info!("  environment: {}", config.environment);
    info!("  include patterns: {:?}", config.include_patterns);
    info!("  exclude patterns: {:?}", config.exclude_patterns);
    info!("  debug enabled: {}", config.debug);

    if config.api_key.as_deref().unwrap_or("").is_empty() {
        error!("API key not set; set AIVORY_API_KEY or aivory.api.key");
        return false;
    }

    let agent = Agent::new(config, Box::new(WsDialer), retransform);
    agent.connect();

    if AGENT.set(agent).is_err() {
        warn!("agent already initialized, skipping");
        return false;
    }
    info!("agent initialized successfully");
    true
}

/// The installed agent, if [`install`] succeeded.
pub fn installed() -> Option<&'static Agent> {
    AGENT.get()
}

/// Process-exit hook body: tears the transport down and drops queued
/// envelopes. In-flight captures on application threads are not awaited.
pub fn shutdown() {
    if let Some(agent) = AGENT.get() {
        agent.shutdown();
    }
}

/// Advice-site free functions resolving through the global context.
pub mod advice {
    use super::*;

    pub fn on_method_exit(event: MethodExitEvent<'_>) {
        if let Some(agent) = installed() {
            agent.on_method_exit(event);
        }
    }

    pub fn on_breakpoint_hit(
        heap: &HeapSnapshot,
        class_name: &str,
        line_number: u32,
        current_stack: &[RawFrame],
        receiver: Option<&ObjectRef>,
        args: &[RuntimeValue],
    ) {
        if let Some(agent) = installed() {
            agent.on_breakpoint_hit(heap, class_name, line_number, current_stack, receiver, args);
        }
    }

    pub fn on_native_exception(
        location: &str,
        variables_json: &str,
        exception: &ThrowableSnapshot,
    ) {
        if let Some(agent) = installed() {
            agent.on_native_exception(location, variables_json, exception);
        }
    }
}
