//! Named cancellable timer registry.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::machine::TimerName;

/// One-shot and guard timers keyed by name. Registering a name aborts any
/// prior task under the same name, so arming is atomic replacement.
///
/// A fire that slips past an abort is harmless: timer events carry a session
/// stamp and the state machine's stale filter drops leftovers.
#[derive(Default)]
pub struct TimerRegistry {
    tasks: Mutex<HashMap<TimerName, JoinHandle<()>>>,
}

impl TimerRegistry {
    pub fn register(&self, name: TimerName, task: JoinHandle<()>) {
        if let Some(prior) = self.tasks.lock().insert(name, task) {
            prior.abort();
        }
    }

    pub fn cancel(&self, name: TimerName) {
        if let Some(task) = self.tasks.lock().remove(&name) {
            task.abort();
        }
    }

    pub fn cancel_all(&self) {
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn rearming_replaces_the_prior_timer() {
        let registry = TimerRegistry::default();
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = Arc::clone(&fired);
            registry.register(
                TimerName::FlushTimeout,
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1, "only the last arm fires");
    }

    #[tokio::test]
    async fn cancel_stops_the_timer() {
        let registry = TimerRegistry::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&fired);
        registry.register(
            TimerName::ArmingTimeout,
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                flag.fetch_add(1, Ordering::SeqCst);
            }),
        );
        registry.cancel(TimerName::ArmingTimeout);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
