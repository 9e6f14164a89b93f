//! Registry of server-installed non-breaking breakpoints.
//!
//! Each record is held by two mappings, one keyed by the server-assigned
//! id and one by the `<class>:<line>` location, both pointing at the same
//! record. The key spaces are separate: ids are opaque server strings and
//! may collide textually with a location key. The agent never removes a
//! record on its own; only `remove_breakpoint` commands or session
//! teardown do.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use aivory_capture::{capture_breakpoint, HeapSnapshot, ObjectRef, RawFrame, RuntimeValue};
use aivory_config::AgentConfig;
use aivory_transport::BackendConnection;
use tracing::{debug, info};

/// Requests re-instrumentation of a class so a newly probed location takes
/// effect. Implemented by the bytecode-instrumentation collaborator.
pub trait Retransform: Send + Sync {
    fn request_retransform(&self, class_name: &str);
}

/// No-op retransformer for tests and detached operation.
pub struct NoRetransform;

impl Retransform for NoRetransform {
    fn request_retransform(&self, _class_name: &str) {}
}

pub struct BreakpointRecord {
    pub id: String,
    pub class_name: String,
    pub line_number: u32,
    /// Accepted and stored, never evaluated.
    pub condition: Option<String>,
    pub hit_count: AtomicU64,
}

pub struct BreakpointRegistry {
    by_id: RwLock<HashMap<String, Arc<BreakpointRecord>>>,
    by_location: RwLock<HashMap<String, Arc<BreakpointRecord>>>,
    retransform: Arc<dyn Retransform>,
}

impl BreakpointRegistry {
    pub fn new(retransform: Arc<dyn Retransform>) -> Self {
        Self {
            by_id: RwLock::new(HashMap::new()),
            by_location: RwLock::new(HashMap::new()),
            retransform,
        }
    }

    // Lock order is by_id then by_location wherever both are taken.
    pub fn set(&self, id: String, class_name: String, line_number: u32, condition: Option<String>) {
        let record = Arc::new(BreakpointRecord {
            id: id.clone(),
            class_name: class_name.clone(),
            line_number,
            condition,
            hit_count: AtomicU64::new(0),
        });

        {
            let mut by_id = self.by_id.write().unwrap();
            let mut by_location = self.by_location.write().unwrap();
            if let Some(previous) = by_id.insert(id.clone(), Arc::clone(&record)) {
                remove_location_entry(&mut by_location, &previous);
            }
            by_location.insert(location_key(&class_name, line_number), record);
        }

        self.retransform.request_retransform(&class_name);
        info!("breakpoint set: {id} at {class_name}:{line_number}");
    }

    pub fn remove(&self, id: &str) {
        let mut by_id = self.by_id.write().unwrap();
        let mut by_location = self.by_location.write().unwrap();
        if let Some(record) = by_id.remove(id) {
            remove_location_entry(&mut by_location, &record);
            info!("breakpoint removed: {id}");
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<BreakpointRecord>> {
        self.by_id.read().unwrap().get(id).cloned()
    }

    pub fn lookup(&self, class_name: &str, line_number: u32) -> Option<Arc<BreakpointRecord>> {
        self.by_location
            .read()
            .unwrap()
            .get(&location_key(class_name, line_number))
            .cloned()
    }

    /// Weakly consistent: used to decide whether a class still needs its
    /// probe instrumentation. Tolerates staleness.
    pub fn has_breakpoints_for_class(&self, class_name: &str) -> bool {
        self.by_id
            .read()
            .unwrap()
            .values()
            .any(|record| record.class_name == class_name)
    }

    /// Probe advice entry: captures and ships context if a record is
    /// registered for this location.
    #[allow(clippy::too_many_arguments)]
    pub fn on_hit(
        &self,
        config: &AgentConfig,
        connection: &BackendConnection,
        heap: &HeapSnapshot,
        class_name: &str,
        line_number: u32,
        current_stack: &[RawFrame],
        receiver: Option<&ObjectRef>,
        args: &[RuntimeValue],
    ) {
        let Some(record) = self.lookup(class_name, line_number) else {
            return;
        };
        record.hit_count.fetch_add(1, Ordering::Relaxed);

        let capture = capture_breakpoint(
            config,
            heap,
            &record.id,
            class_name,
            line_number,
            current_stack,
            receiver,
            args,
        );
        connection.send_breakpoint_hit(&capture);
        debug!("breakpoint hit: {} at {class_name}:{line_number}", record.id);
    }
}

fn location_key(class_name: &str, line_number: u32) -> String {
    format!("{class_name}:{line_number}")
}

/// Drops `record`'s location entry, leaving the slot alone if another
/// record has since claimed the same location.
fn remove_location_entry(
    by_location: &mut HashMap<String, Arc<BreakpointRecord>>,
    record: &Arc<BreakpointRecord>,
) {
    let key = location_key(&record.class_name, record.line_number);
    if by_location
        .get(&key)
        .is_some_and(|occupant| Arc::ptr_eq(occupant, record))
    {
        by_location.remove(&key);
    }
}
