use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Named recurring timers.
pub trait Timer: Send + Sync {
    /// Fire `on_fire` every `period`, first one full period from now.
    /// Scheduling a name that is already scheduled replaces it.
    fn schedule(&self, name: &str, period: Duration, on_fire: TimerCallback);
    fn cancel(&self, name: &str);
}

/// One tokio interval task per timer name.  Must be used from inside a runtime.
#[derive(Default)]
pub struct TokioTimer {
    tasks: Mutex<HashMap<String, AbortHandle>>,
}

impl TokioTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Timer for TokioTimer {
    fn schedule(&self, name: &str, period: Duration, on_fire: TimerCallback) {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                on_fire();
            }
        })
        .abort_handle();

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = tasks.insert(name.to_string(), handle) {
            old.abort();
        }
        debug!("timer: scheduled {:?} every {:?}", name, period);
    }

    fn cancel(&self, name: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = tasks.remove(name) {
            handle.abort();
            debug!("timer: cancelled {:?}", name);
        }
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}
