use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::MissedTickBehavior,
};

use crate::ratelimit::in_memory::InMemoryCounterBackend;

/// Periodically evicts expired local counters so the fallback map stays
/// bounded. Never runs on a request path.
pub fn spawn_cleanup(
    counters: Arc<InMemoryCounterBackend>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let evicted = counters.purge_expired();
            if evicted > 0 {
                tracing::debug!(
                    evicted,
                    remaining = counters.len(),
                    "evicted expired rate limit counters"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sweeps_expired_entries_in_the_background() {
        let counters = Arc::new(InMemoryCounterBackend::new());
        counters.hit_now("stale", Duration::from_millis(500));
        counters.hit_now("fresh", Duration::from_secs(600));

        let handle = spawn_cleanup(counters.clone(), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        assert_eq!(counters.len(), 1);
        assert_eq!(counters.get_now("fresh"), Some(1));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_task_stops_sweeping() {
        let counters = Arc::new(InMemoryCounterBackend::new());
        let handle = spawn_cleanup(counters.clone(), Duration::from_secs(1));
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        counters.hit_now("stale", Duration::from_millis(10));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(counters.len(), 1);
    }
}
