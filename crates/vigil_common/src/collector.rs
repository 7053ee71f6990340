//! Telemetry Collector - background sampling loop.
//!
//! Samples the [`MetricSource`] on its own tokio task and pushes each
//! snapshot into a bounded broadcast channel. When the channel is full the
//! oldest queued snapshot is overwritten: monitoring favours freshness over
//! completeness. The collector never touches history or consumer state.

use crate::error::{Result, VigilError};
use crate::source::MetricSource;
use crate::types::MetricSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Create the bounded collector -> dispatcher channel
pub fn snapshot_channel(
    capacity: usize,
) -> (broadcast::Sender<MetricSnapshot>, broadcast::Receiver<MetricSnapshot>) {
    broadcast::channel(capacity.max(1))
}

/// Counters for observing the loop from outside
#[derive(Debug, Default)]
pub struct CollectorStats {
    samples: AtomicU64,
    failures: AtomicU64,
}

impl CollectorStats {
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Handle to a running collector loop
pub struct Collector {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<CollectorStats>,
}

impl Collector {
    /// Spawn the sampling loop. The first sample is taken immediately.
    pub fn start(
        source: Arc<dyn MetricSource>,
        sender: broadcast::Sender<MetricSnapshot>,
        sample_interval: Duration,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(CollectorStats::default());

        info!("Starting collector (interval={:?})", sample_interval);
        let handle = tokio::spawn(collect_loop(
            source,
            sender,
            sample_interval,
            shutdown_rx,
            Arc::clone(&stats),
        ));

        Self {
            shutdown,
            handle: Some(handle),
            stats,
        }
    }

    pub fn stats(&self) -> Arc<CollectorStats> {
        Arc::clone(&self.stats)
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Request shutdown and wait for the loop to exit.
    ///
    /// An in-flight sample is allowed to finish; no new sample starts. If the
    /// loop has not exited within `grace` it is aborted, the failure is logged
    /// and `ShutdownTimedOut` is returned. There is no retry.
    pub async fn stop(&mut self, grace: Duration) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        // Receiver gone means the loop already exited
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!("Collector task ended abnormally: {}", e);
                }
                info!(
                    "Collector stopped ({} samples, {} failures)",
                    self.stats.samples(),
                    self.stats.failures()
                );
                Ok(())
            }
            Err(_) => {
                error!("Collector did not stop within {:?}, abandoning it", grace);
                handle.abort();
                Err(VigilError::ShutdownTimedOut(grace))
            }
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown.send(true);
            handle.abort();
        }
    }
}

async fn collect_loop(
    source: Arc<dyn MetricSource>,
    sender: broadcast::Sender<MetricSnapshot>,
    sample_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<CollectorStats>,
) {
    let mut ticker = interval(sample_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            _ = ticker.tick() => {}
        }

        // Sampling may block for a while; keep it off the async workers.
        // The sample runs to completion even if shutdown arrives meanwhile.
        let source = Arc::clone(&source);
        let sampled = tokio::task::spawn_blocking(move || source.sample()).await;

        match sampled {
            Ok(Ok(snapshot)) => {
                stats.samples.fetch_add(1, Ordering::Relaxed);
                // Err only means nobody is listening right now
                if sender.send(snapshot).is_err() {
                    debug!("No dispatcher subscribed, snapshot discarded");
                }
            }
            Ok(Err(e)) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Sample failed, skipping tick: {}", e);
            }
            Err(e) => {
                stats.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Sampling task panicked, skipping tick: {}", e);
            }
        }

        if *shutdown.borrow() {
            break;
        }
    }

    debug!("Collector loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;
    use crate::source::fake::FakeSource;

    #[tokio::test(start_paused = true)]
    async fn test_failed_sample_is_skipped_not_replayed() {
        let source = Arc::new(FakeSource::default());
        source.push_sample(11.0, 20.0);
        source
            .samples
            .lock()
            .unwrap()
            .push_back(Err(AdapterError::Unavailable("busy".into())));
        source.push_sample(33.0, 40.0);

        let (tx, mut rx) = snapshot_channel(16);
        let mut collector = Collector::start(source, tx, Duration::from_secs(1));

        // Ticks at t=0, 1, 2
        tokio::time::sleep(Duration::from_millis(2500)).await;
        collector.stop(Duration::from_secs(1)).await.unwrap();

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.cpu_percent(), 11.0);
        assert_eq!(second.cpu_percent(), 33.0);
        assert_eq!(collector.stats().failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_channel_drops_oldest() {
        let source = Arc::new(FakeSource::default());
        for i in 0..5 {
            source.push_sample(i as f64, 0.0);
        }

        let (tx, mut rx) = snapshot_channel(2);
        let mut collector = Collector::start(source, tx, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(4500)).await;
        collector.stop(Duration::from_secs(1)).await.unwrap();

        // Three oldest were overwritten
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(rx.try_recv().unwrap().cpu_percent(), 3.0);
        assert_eq!(rx.try_recv().unwrap().cpu_percent(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let source = Arc::new(FakeSource::default());
        let (tx, _rx) = snapshot_channel(4);
        let mut collector = Collector::start(source, tx, Duration::from_secs(1));
        assert!(collector.is_running());

        collector.stop(Duration::from_secs(1)).await.unwrap();
        assert!(!collector.is_running());
        collector.stop(Duration::from_secs(1)).await.unwrap();
    }
}
