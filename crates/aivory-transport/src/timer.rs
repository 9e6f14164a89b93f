//! Small cancellable timers built on `Condvar` waits. Cancellation is
//! idempotent and wakes the waiting thread immediately.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

pub(crate) struct TimerHandle {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        let (cancelled, signal) = &*self.state;
        *cancelled.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        signal.notify_all();
    }
}

/// Runs `task` once after `delay`, unless cancelled first.
pub(crate) fn once(
    name: &str,
    delay: Duration,
    task: impl FnOnce() + Send + 'static,
) -> TimerHandle {
    let state = Arc::new((Mutex::new(false), Condvar::new()));
    let shared = Arc::clone(&state);

    let _ = thread::Builder::new().name(name.to_string()).spawn(move || {
        let (cancelled, signal) = &*shared;
        let guard = cancelled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = signal
            .wait_timeout_while(guard, delay, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let fire = !*guard;
        drop(guard);
        if fire {
            task();
        }
    });

    TimerHandle { state }
}

/// Runs `task` every `period` (first run after one full period) until
/// cancelled.
pub(crate) fn periodic(
    name: &str,
    period: Duration,
    task: impl Fn() + Send + 'static,
) -> TimerHandle {
    let state = Arc::new((Mutex::new(false), Condvar::new()));
    let shared = Arc::clone(&state);

    let _ = thread::Builder::new().name(name.to_string()).spawn(move || loop {
        let (cancelled, signal) = &*shared;
        let guard = cancelled.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (guard, _) = signal
            .wait_timeout_while(guard, period, |cancelled| !*cancelled)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if *guard {
            return;
        }
        drop(guard);
        task();
    });

    TimerHandle { state }
}
