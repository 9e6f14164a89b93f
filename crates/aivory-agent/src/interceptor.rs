//! Interception controller: decides whether a propagating exception
//! produces a capture.
//!
//! Gate order: recursion guard, per-instance dedup, sampling. The guard
//! state is per-thread; a single throwable unwinding through any number of
//! instrumented frames on one thread yields at most one capture.

use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};

use aivory_capture::capture_exception;
use tracing::warn;

use crate::{Agent, MethodExitEvent};

thread_local! {
    /// Set while the capture pipeline runs on this thread; any interception
    /// entered underneath it returns immediately.
    static INTERCEPTING: Cell<bool> = const { Cell::new(false) };

    /// Identity of the last throwable captured on this thread.
    static LAST_EXCEPTION_IDENTITY: Cell<u64> = const { Cell::new(0) };
}

struct InterceptGuard;

impl Drop for InterceptGuard {
    fn drop(&mut self) {
        INTERCEPTING.with(|flag| flag.set(false));
    }
}

pub(crate) fn handle_method_exit(agent: &Agent, event: MethodExitEvent<'_>) {
    let Some(thrown) = event.thrown else {
        return;
    };

    if INTERCEPTING.with(Cell::get) {
        return;
    }
    if LAST_EXCEPTION_IDENTITY.with(Cell::get) == thrown.identity {
        // Already captured at an inner frame while this instance unwinds.
        return;
    }

    INTERCEPTING.with(|flag| flag.set(true));
    LAST_EXCEPTION_IDENTITY.with(|last| last.set(thrown.identity));
    let _guard = InterceptGuard;

    let result = catch_unwind(AssertUnwindSafe(|| {
        if !agent.config().should_sample() {
            return;
        }
        let capture = capture_exception(
            agent.config(),
            event.heap,
            thrown,
            event.receiver,
            event.method,
            event.args,
        );
        agent.connection().send_exception(&capture);
    }));

    if result.is_err() && agent.config().debug {
        warn!("exception during interception");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aivory_capture::{HeapSnapshot, MethodDescriptor, RawFrame, ThrowableSnapshot};
    use aivory_config::AgentConfig;
    use aivory_transport::MockBackend;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn test_agent(backend: &MockBackend, sampling_rate: f64) -> Agent {
        let config = Arc::new(AgentConfig {
            api_key: Some("k".to_string()),
            sampling_rate,
            ..AgentConfig::default()
        });
        Agent::new(config, Box::new(backend.clone()), Arc::new(crate::NoRetransform))
    }

    fn thrown(identity: u64) -> ThrowableSnapshot {
        ThrowableSnapshot {
            identity,
            exception_type: "java.lang.RuntimeException".to_string(),
            message: None,
            frames: vec![RawFrame::new("com.example.App", "run").at("App.java", 5)],
        }
    }

    fn fire(agent: &Agent, heap: &HeapSnapshot, throwable: &ThrowableSnapshot) {
        let method = MethodDescriptor::new("com.example.App", "run");
        agent.on_method_exit(MethodExitEvent {
            heap,
            receiver: None,
            method: &method,
            args: &[],
            thrown: Some(throwable),
        });
    }

    #[test]
    fn normal_exit_produces_nothing() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 1.0);
        let heap = HeapSnapshot::new();
        let method = MethodDescriptor::new("com.example.App", "run");
        agent.on_method_exit(MethodExitEvent {
            heap: &heap,
            receiver: None,
            method: &method,
            args: &[],
            thrown: None,
        });
        assert_eq!(agent.connection().enqueued_count(), 0);
    }

    // One instance unwinding through many frames yields one capture.
    #[test]
    fn same_instance_captured_once_per_thread() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 1.0);
        let heap = HeapSnapshot::new();
        let throwable = thrown(0x77);

        for _ in 0..5 {
            fire(&agent, &heap, &throwable);
        }
        assert_eq!(agent.connection().enqueued_count(), 1);
    }

    #[test]
    fn distinct_instances_each_captured() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 1.0);
        let heap = HeapSnapshot::new();

        fire(&agent, &heap, &thrown(0x01));
        fire(&agent, &heap, &thrown(0x02));
        // Dedup only remembers the most recent instance.
        fire(&agent, &heap, &thrown(0x01));

        assert_eq!(agent.connection().enqueued_count(), 3);
    }

    // Interception entered under the guard is a no-op.
    #[test]
    fn recursion_guard_blocks_reentry() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 1.0);
        let heap = HeapSnapshot::new();

        INTERCEPTING.with(|flag| flag.set(true));
        fire(&agent, &heap, &thrown(0x90));
        INTERCEPTING.with(|flag| flag.set(false));

        assert_eq!(agent.connection().enqueued_count(), 0);

        // The guard is transient: the next unwind captures normally.
        fire(&agent, &heap, &thrown(0x91));
        assert_eq!(agent.connection().enqueued_count(), 1);
    }

    #[test]
    fn dedup_state_is_per_thread() {
        let backend = MockBackend::new();
        let agent = Arc::new(test_agent(&backend, 1.0));

        let worker = {
            let agent = Arc::clone(&agent);
            std::thread::spawn(move || {
                let heap = HeapSnapshot::new();
                fire(&agent, &heap, &thrown(0x55));
            })
        };
        worker.join().unwrap();

        let heap = HeapSnapshot::new();
        fire(&agent, &heap, &thrown(0x55));

        // Each thread captured the instance once.
        assert_eq!(agent.connection().enqueued_count(), 2);
    }

    // sampling_rate = 0 emits nothing.
    #[test]
    fn zero_sampling_emits_nothing() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 0.0);
        let heap = HeapSnapshot::new();

        for identity in 1..=1000u64 {
            fire(&agent, &heap, &thrown(identity));
        }
        assert_eq!(agent.connection().enqueued_count(), 0);
    }

    #[test]
    fn sampled_out_instance_not_reconsidered_at_outer_frames() {
        let backend = MockBackend::new();
        let agent = test_agent(&backend, 0.0);
        let heap = HeapSnapshot::new();
        let throwable = thrown(0x42);

        // The identity is recorded before the sampling gate, so the outer
        // frames of the same unwind short-circuit early.
        fire(&agent, &heap, &throwable);
        fire(&agent, &heap, &throwable);
        assert_eq!(agent.connection().enqueued_count(), 0);
    }
}
