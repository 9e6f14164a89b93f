//! End-to-end agent scenarios against the mock backend: exception
//! capture with receiver state, argument capture, sampling gate, and the
//! breakpoint set/hit/remove cycle.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use aivory_agent::{Agent, MethodExitEvent, NoRetransform};
use aivory_capture::{
    HeapSnapshot, MethodDescriptor, ObjectField, ObjectRef, ObjectShape, RawFrame, RuntimeValue,
    ThrowableSnapshot,
};
use aivory_config::AgentConfig;
use aivory_transport::{MockBackend, TransportTuning};

fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn fast_tuning() -> TransportTuning {
    TransportTuning {
        heartbeat_interval: Duration::from_millis(40),
        reconnect_base_delay: Duration::from_millis(20),
        max_reconnect_delay: Duration::from_millis(500),
        max_reconnect_attempts: 10,
        send_poll_timeout: Duration::from_millis(20),
    }
}

fn connected_agent(backend: &MockBackend, sampling_rate: f64) -> Agent {
    let config = Arc::new(AgentConfig {
        api_key: Some("key-123".to_string()),
        sampling_rate,
        ..AgentConfig::default()
    });
    let agent = Agent::with_tuning(
        config,
        Box::new(backend.clone()),
        Arc::new(NoRetransform),
        fast_tuning(),
    );
    agent.connect();
    assert!(wait_until(Duration::from_secs(2), || agent
        .connection()
        .is_connected()));
    agent
}

/// Receiver with a name, a counter, and a three-string list.
fn s1_heap() -> (HeapSnapshot, ObjectRef) {
    let mut heap = HeapSnapshot::new();
    let name = heap.insert_string(2, "TestAppInstance");
    let one = heap.insert_string(10, "field1");
    let two = heap.insert_string(11, "field2");
    let three = heap.insert_string(12, "field3");
    heap.insert(
        3,
        ObjectShape::Sequence {
            elements: vec![one.into(), two.into(), three.into()],
        },
    );
    heap.insert(
        1,
        ObjectShape::Fields(vec![
            ObjectField::new("instanceName", name.into()),
            ObjectField::new("instanceCounter", RuntimeValue::Int(42)),
            ObjectField::new("instanceList", ObjectRef::new(3, "java.util.ArrayList").into()),
        ]),
    );
    (heap, ObjectRef::new(1, "com.example.TestApp"))
}

// Null dereference at a depth-10 call chain with receiver state.
#[test]
fn null_dereference_capture() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);

    let (heap, receiver) = s1_heap();
    let frames: Vec<RawFrame> = (0..10)
        .map(|depth| {
            RawFrame::new("com.example.TestApp", format!("level{depth}"))
                .at("TestApp.java", 100 + depth)
        })
        .collect();
    let thrown = ThrowableSnapshot {
        identity: 0xbeef,
        exception_type: "java.lang.NullPointerException".to_string(),
        message: Some("Cannot invoke method on null".to_string()),
        frames,
    };
    let method = MethodDescriptor::new("com.example.TestApp", "level0");

    agent.on_method_exit(MethodExitEvent {
        heap: &heap,
        receiver: Some(&receiver),
        method: &method,
        args: &[],
        thrown: Some(&thrown),
    });

    let session = backend.last_session().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !session.sent_of_type("exception").is_empty()
    }));
    let envelopes = session.sent_of_type("exception");
    assert_eq!(envelopes.len(), 1);
    let payload = &envelopes[0]["payload"];

    assert_eq!(payload["exception_type"], "java.lang.NullPointerException");
    assert_eq!(payload["stack_trace"].as_array().unwrap().len(), 10);

    let vars = &payload["local_variables"];
    assert_eq!(vars["this.instanceName"]["value"], "TestAppInstance");
    assert_eq!(vars["this.instanceCounter"]["value"], "42");
    assert_eq!(vars["this.instanceList"]["array_length"], 3);
    assert_eq!(vars["this.instanceList"]["array_elements"][0]["value"], "field1");

    let fingerprint = payload["fingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.len(), 16);
    assert!(fingerprint
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    // First-frame flattening for server-side display.
    assert_eq!(payload["class_name"], "com.example.TestApp");
    assert_eq!(payload["line_number"], 100);

    agent.shutdown();
}

// Argument capture alongside the exception message.
#[test]
fn argument_capture() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);

    let heap = HeapSnapshot::new();
    let thrown = ThrowableSnapshot {
        identity: 0x2,
        exception_type: "java.lang.IllegalArgumentException".to_string(),
        message: Some("Invalid argument: testVar=test-value-1".to_string()),
        frames: vec![RawFrame::new("com.example.TestApp", "validate").at("TestApp.java", 58)],
    };
    let method =
        MethodDescriptor::new("com.example.TestApp", "validate").with_params(vec![None]);

    agent.on_method_exit(MethodExitEvent {
        heap: &heap,
        receiver: None,
        method: &method,
        args: &[RuntimeValue::Int(1)],
        thrown: Some(&thrown),
    });

    let session = backend.last_session().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !session.sent_of_type("exception").is_empty()
    }));
    let payload = &session.sent_of_type("exception")[0]["payload"];

    assert!(payload["exception_type"]
        .as_str()
        .unwrap()
        .ends_with("IllegalArgumentException"));
    assert_eq!(payload["message"], "Invalid argument: testVar=test-value-1");
    assert_eq!(payload["method_arguments"]["arg0"]["value"], "1");
    assert_eq!(payload["method_arguments"]["arg0"]["type"], "java.lang.Integer");

    agent.shutdown();
}

// Zero sampling emits no exceptions while heartbeats continue.
#[test]
fn zero_sampling_keeps_heartbeats_only() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 0.0);

    let heap = HeapSnapshot::new();
    let method = MethodDescriptor::new("com.example.App", "run");
    for identity in 1..=1000u64 {
        let thrown = ThrowableSnapshot {
            identity,
            exception_type: "java.lang.RuntimeException".to_string(),
            message: None,
            frames: vec![],
        };
        agent.on_method_exit(MethodExitEvent {
            heap: &heap,
            receiver: None,
            method: &method,
            args: &[],
            thrown: Some(&thrown),
        });
    }

    let session = backend.last_session().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        session.sent_of_type("heartbeat").len() >= 2
    }));
    assert!(session.sent_of_type("exception").is_empty());

    agent.shutdown();
}

// Full cycle: set, hit, remove, hit again.
#[test]
fn breakpoint_set_hit_remove_cycle() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);
    let session = backend.last_session().unwrap();

    session.push_inbound(
        r#"{"type":"set_breakpoint","payload":{"id":"bp1","class_name":"x.Y","line_number":42}}"#,
    );
    assert!(wait_until(Duration::from_secs(2), || {
        agent.breakpoints().get("bp1").is_some()
    }));

    let mut heap = HeapSnapshot::new();
    let two = heap.insert_string(5, "two");
    heap.insert(
        4,
        ObjectShape::Fields(vec![
            ObjectField::new("a", RuntimeValue::Int(1)),
            ObjectField::new("b", two.into()),
        ]),
    );
    let receiver = ObjectRef::new(4, "x.Y");
    let stack = vec![RawFrame::new("x.Y", "work").at("Y.java", 42)];

    agent.on_breakpoint_hit(&heap, "x.Y", 42, &stack, Some(&receiver), &[]);

    assert!(wait_until(Duration::from_secs(2), || {
        !session.sent_of_type("breakpoint_hit").is_empty()
    }));
    let payload = &session.sent_of_type("breakpoint_hit")[0]["payload"];
    assert_eq!(payload["breakpoint_id"], "bp1");
    assert_eq!(payload["local_variables"]["this.a"]["value"], "1");
    assert_eq!(payload["local_variables"]["this.b"]["value"], "two");
    assert!(payload["stack_trace"].as_array().is_some());

    session.push_inbound(r#"{"type":"remove_breakpoint","payload":{"id":"bp1"}}"#);
    assert!(wait_until(Duration::from_secs(2), || {
        agent.breakpoints().get("bp1").is_none()
    }));

    agent.on_breakpoint_hit(&heap, "x.Y", 42, &stack, Some(&receiver), &[]);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(session.sent_of_type("breakpoint_hit").len(), 1);

    agent.shutdown();
}

#[test]
fn unregistered_location_hit_is_ignored() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);

    let heap = HeapSnapshot::new();
    agent.on_breakpoint_hit(&heap, "x.Y", 99, &[], None, &[]);
    thread::sleep(Duration::from_millis(100));

    let session = backend.last_session().unwrap();
    assert!(session.sent_of_type("breakpoint_hit").is_empty());

    agent.shutdown();
}

#[test]
fn native_exception_path_lifts_frame_locals() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);

    let exception = ThrowableSnapshot {
        identity: 0x9a,
        exception_type: "java.lang.NullPointerException".to_string(),
        message: Some("npe".to_string()),
        frames: vec![
            RawFrame::new("com.example.App", "run").at("App.java", 17),
            RawFrame::new("com.example.Main", "main").at("Main.java", 4),
        ],
    };
    let variables = r#"{
        "globalState": {"name": "ready"},
        "frame_0_com.example.App.run": {"x": {"type": "int", "value": "1"}}
    }"#;

    agent.on_native_exception("com.example.App.run", variables, &exception);

    let session = backend.last_session().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !session.sent_of_type("exception").is_empty()
    }));
    let payload = &session.sent_of_type("exception")[0]["payload"];

    assert_eq!(payload["jvmti_capture"], true);
    assert_eq!(payload["exception_type"], "java.lang.NullPointerException");
    let frames = payload["stack_trace"].as_array().unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["locals"]["x"]["value"], "1");
    assert!(frames[1].get("locals").is_none());
    assert!(payload["local_variables"]["globalState"]["name"] == "ready");
    assert_eq!(payload["fingerprint"].as_str().unwrap().len(), 16);
    assert_eq!(payload["class_name"], "com.example.App");

    // Same instance again within the dedup window: dropped.
    agent.on_native_exception("com.example.App.run", variables, &exception);
    thread::sleep(Duration::from_millis(150));
    assert_eq!(session.sent_of_type("exception").len(), 1);

    agent.shutdown();
}

#[test]
fn malformed_native_variables_still_capture() {
    let backend = MockBackend::new().auto_register();
    let agent = connected_agent(&backend, 1.0);

    let exception = ThrowableSnapshot {
        identity: 0x9b,
        exception_type: "java.lang.IllegalStateException".to_string(),
        message: None,
        frames: vec![RawFrame::new("com.example.App", "run").at("App.java", 3)],
    };
    agent.on_native_exception("com.example.App.run", "definitely not json", &exception);

    let session = backend.last_session().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !session.sent_of_type("exception").is_empty()
    }));
    let payload = &session.sent_of_type("exception")[0]["payload"];
    assert_eq!(payload["local_variables"], serde_json::json!({}));

    agent.shutdown();
}
