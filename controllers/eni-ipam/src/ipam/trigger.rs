//! Coalescing trigger.
//!
//! Calls to [`Trigger::trigger`] while a run is pending or in flight collapse
//! into a single follow-up run. Two runs start at least `min_interval` apart.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

/// Background task running a function on demand
#[derive(Debug)]
pub struct Trigger {
    name: String,
    notify: Arc<Notify>,
    folded: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl Trigger {
    /// Spawn the trigger task. `run` returns `false` to stop the task.
    pub fn new<F, Fut>(name: impl Into<String>, min_interval: Duration, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let name = name.into();
        let notify = Arc::new(Notify::new());
        let folded = Arc::new(AtomicU64::new(0));

        let task = {
            let notify = Arc::clone(&notify);
            let folded = Arc::clone(&folded);
            let name = name.clone();
            tokio::spawn(async move {
                loop {
                    notify.notified().await;
                    let coalesced = folded.swap(0, Ordering::SeqCst);
                    debug!("Trigger {} firing, {} requests folded", name, coalesced);
                    if !run().await {
                        debug!("Trigger {} stopped", name);
                        return;
                    }
                    if !min_interval.is_zero() {
                        tokio::time::sleep(min_interval).await;
                    }
                }
            })
        };

        Self {
            name,
            notify,
            folded,
            task,
        }
    }

    /// Request a run
    pub fn trigger(&self) {
        self.folded.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Trigger {
    fn drop(&mut self) {
        self.task.abort();
    }
}
