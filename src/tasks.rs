//! Supervised background work.
//!
//! Every periodic task listens on one shutdown signal owned by the [`Supervisor`], so
//! shutdown can wait for them to finish their current tick instead of dropping them.

use crate::kv::MemoryStore;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval_at, timeout_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

const MIN_PERIOD: Duration = Duration::from_secs(1);

pub struct Supervisor {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    #[must_use]
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            tasks: Vec::new(),
        }
    }

    /// A receiver that flips to `true` once shutdown starts.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `tick` every `period` (at least one second) until shutdown. The first tick
    /// happens one period after spawning.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(MIN_PERIOD);
        let mut shutdown = self.subscribe();
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    _ = shutdown.changed() => break,
                }
            }
            debug!(task = name, "periodic task stopped");
        });
        self.tasks.push((name, handle));
    }

    /// Signal shutdown and wait up to `grace` for every task. Tasks still running after
    /// that are aborted; returns how many.
    pub async fn shutdown(self, grace: Duration) -> usize {
        // Ignored: no receivers left means every task already exited.
        let _ = self.shutdown.send(true);
        let deadline = Instant::now() + grace;
        let mut aborted = 0;
        for (name, mut handle) in self.tasks {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!(task = name, "task did not stop within the grace period, aborting");
                handle.abort();
                aborted += 1;
            }
        }
        info!(aborted, "background tasks stopped");
        aborted
    }
}

/// Periodically purge expired entries from process-local fallback maps.
pub fn spawn_sweeper(supervisor: &mut Supervisor, stores: Vec<Arc<MemoryStore>>, period: Duration) {
    let stores = Arc::new(stores);
    supervisor.spawn_periodic("fallback-sweeper", period, move || {
        let stores = Arc::clone(&stores);
        async move {
            let purged: usize = stores.iter().map(|store| store.purge_expired()).sum();
            if purged > 0 {
                debug!(purged, "expired fallback entries removed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{KvError, KvStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_once_per_period() {
        let mut supervisor = Supervisor::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        supervisor.spawn_periodic("counter", Duration::from_secs(1), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_tasks_that_overrun_the_grace_period() {
        let mut supervisor = Supervisor::new();
        supervisor.spawn_periodic("slow", Duration::from_secs(1), || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        supervisor.spawn_periodic("fast", Duration::from_secs(1), || async {});
        assert_eq!(supervisor.len(), 2);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(supervisor.shutdown(Duration::from_secs(1)).await, 1);
    }

    #[tokio::test]
    async fn subscribers_see_the_shutdown_signal() {
        let supervisor = Supervisor::new();
        let mut rx = supervisor.subscribe();
        assert!(!*rx.borrow());
        assert_eq!(supervisor.shutdown(Duration::from_millis(10)).await, 0);
        assert!(rx.changed().await.is_ok());
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_fallback_entries() -> Result<(), KvError> {
        let store = Arc::new(MemoryStore::new());
        store
            .set("verify:email:a", b"1", Some(Duration::from_secs(5)))
            .await?;
        store.set("keep", b"1", None).await?;

        let mut supervisor = Supervisor::new();
        spawn_sweeper(&mut supervisor, vec![Arc::clone(&store)], Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(store.len(), 1);
        supervisor.shutdown(Duration::from_secs(1)).await;
        Ok(())
    }
}
