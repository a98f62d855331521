//! Registry of periodic background tasks.
//!
//! Every recurring task (the reaper, the stats sampler) registers its
//! handle here so shutdown can stop all of them in one place instead of
//! leaving tasks holding browser or pool references.

use std::sync::Mutex;

use log::debug;
use tokio::task::JoinHandle;

/// Named handle to a spawned periodic task.
struct NamedTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Process-wide collection of periodic task handles.
///
/// `clear` is idempotent; dropping the registry also aborts anything
/// still registered.
#[derive(Default)]
pub struct TimerRegistry {
    tasks: Mutex<Vec<NamedTask>>,
}

impl TimerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned periodic task under a stable name.
    pub fn register(&self, name: &'static str, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            debug!("registered periodic task '{name}'");
            tasks.push(NamedTask { name, handle });
        }
    }

    /// Abort every registered task. Called once at shutdown.
    pub fn clear(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                debug!("stopping periodic task '{}'", task.name);
                task.handle.abort();
            }
        }
    }

    /// Number of currently registered tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn clear_aborts_registered_tasks() {
        let registry = TimerRegistry::new();
        let handle = tokio::spawn(async {
            loop {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        });
        registry.register("ticker", handle);
        assert_eq!(registry.len(), 1);

        registry.clear();
        assert!(registry.is_empty());
        // Give the abort a moment to land.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn clear_twice_is_harmless() {
        let registry = TimerRegistry::new();
        registry.register("noop", tokio::spawn(async {}));
        registry.clear();
        registry.clear();
        assert!(registry.is_empty());
    }
}
