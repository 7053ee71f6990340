//! Throttled Dispatcher - decouples sampling rate from consume rate.
//!
//! On a fixed cadence (independent of the sampling interval) the dispatcher
//! drains a bounded batch of queued snapshots, folds them into the per-metric
//! [`HistoryBuffer`]s and emits one consolidated [`TelemetryUpdate`]. Ticks
//! with nothing queued emit nothing. Slow ticks cause the next tick to be
//! skipped rather than queued, so subscribers never see more than one update
//! per cadence period.

use crate::history::{HistoryBuffer, Metric};
use crate::types::MetricSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the update fan-out channel. Slow subscribers lag and skip
/// updates instead of blocking the dispatcher.
const UPDATE_CHANNEL_CAPACITY: usize = 16;

/// One consolidated update, built after every history buffer has been folded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryUpdate {
    /// Most recent snapshot folded in this tick
    pub latest: MetricSnapshot,
    /// Per-metric history, oldest first
    pub history: HashMap<Metric, Vec<f64>>,
    /// Snapshots folded in this tick
    pub folded: usize,
    /// Snapshots the collector overwrote before they could be drained
    pub dropped: u64,
    /// Monotonic tick sequence number
    pub sequence: u64,
}

pub struct Dispatcher {
    receiver: broadcast::Receiver<MetricSnapshot>,
    histories: HashMap<Metric, HistoryBuffer>,
    /// Previous counters for converting cumulative I/O into per-interval deltas
    last_io: Option<(u64, u64)>,
    drain_batch: usize,
    pending_dropped: u64,
    sequence: u64,
    updates: broadcast::Sender<TelemetryUpdate>,
}

impl Dispatcher {
    pub fn new(
        receiver: broadcast::Receiver<MetricSnapshot>,
        history_len: usize,
        drain_batch: usize,
    ) -> Self {
        let histories = Metric::ALL
            .iter()
            .map(|m| (*m, HistoryBuffer::new(history_len)))
            .collect();
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        Self {
            receiver,
            histories,
            last_io: None,
            drain_batch: drain_batch.max(1),
            pending_dropped: 0,
            sequence: 0,
            updates,
        }
    }

    /// Register a consumer of consolidated updates
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.updates.subscribe()
    }

    /// Sender side, for handing out subscriptions after the dispatcher has
    /// been moved into its task
    pub fn update_sender(&self) -> broadcast::Sender<TelemetryUpdate> {
        self.updates.clone()
    }

    pub fn history(&self, metric: Metric) -> Option<&HistoryBuffer> {
        self.histories.get(&metric)
    }

    /// One dispatcher cycle: drain, fold, build the update.
    ///
    /// Returns `None` when nothing was queued. Does not send; see [`Self::tick`].
    pub fn drain_and_fold(&mut self) -> Option<TelemetryUpdate> {
        let mut latest: Option<MetricSnapshot> = None;
        let mut folded = 0usize;

        while folded < self.drain_batch {
            match self.receiver.try_recv() {
                Ok(snapshot) => {
                    self.fold(&snapshot);
                    latest = Some(snapshot);
                    folded += 1;
                }
                Err(TryRecvError::Lagged(n)) => {
                    debug!("Collector overwrote {} queued snapshots", n);
                    self.pending_dropped += n;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        let latest = latest?;
        self.sequence += 1;

        let history = self
            .histories
            .iter()
            .map(|(metric, buf)| (*metric, buf.to_vec()))
            .collect();

        Some(TelemetryUpdate {
            latest,
            history,
            folded,
            dropped: std::mem::take(&mut self.pending_dropped),
            sequence: self.sequence,
        })
    }

    /// Drain, fold and publish. Returns whether an update was emitted.
    pub fn tick(&mut self) -> bool {
        match self.drain_and_fold() {
            Some(update) => {
                // Err only means there are no subscribers
                let _ = self.updates.send(update);
                true
            }
            None => false,
        }
    }

    fn fold(&mut self, snapshot: &MetricSnapshot) {
        let disk = snapshot.disk_io().total();
        let net = snapshot.net_io().total();
        let (disk_delta, net_delta) = match self.last_io {
            Some((prev_disk, prev_net)) => (
                disk.saturating_sub(prev_disk) as f64,
                net.saturating_sub(prev_net) as f64,
            ),
            None => (0.0, 0.0),
        };
        self.last_io = Some((disk, net));

        for (metric, buf) in self.histories.iter_mut() {
            let value = match metric {
                Metric::Cpu => snapshot.cpu_percent(),
                Metric::Memory => snapshot.memory_percent(),
                Metric::DiskIo => disk_delta,
                Metric::NetIo => net_delta,
            };
            buf.push(value);
        }
    }

    /// Run the dispatcher on its own task until `shutdown` flips to true
    /// or the collector side of the channel closes.
    pub fn spawn(mut self, cadence: Duration) -> DispatcherHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let updates = self.update_sender();

        let handle = tokio::spawn(async move {
            // First update one full cadence after start, not immediately
            let mut ticker = interval_at(Instant::now() + cadence, cadence);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!("Dispatcher running (cadence={:?})", cadence);

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }
            debug!("Dispatcher loop exited after {} updates", self.sequence);
        });

        DispatcherHandle {
            shutdown,
            handle: Some(handle),
            updates,
        }
    }
}

/// Handle to a dispatcher running on its own task
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
    updates: broadcast::Sender<TelemetryUpdate>,
}

impl DispatcherHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryUpdate> {
        self.updates.subscribe()
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown.send(true);
            if let Err(e) = handle.await {
                warn!("Dispatcher task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::snapshot_channel;
    use crate::types::{DiskIoCounters, NetIoCounters};
    use chrono::Utc;

    fn snap(cpu: f64, disk: u64) -> MetricSnapshot {
        MetricSnapshot::new(
            Utc::now(),
            cpu,
            cpu / 2.0,
            DiskIoCounters {
                read_bytes: disk,
                written_bytes: 0,
            },
            NetIoCounters::default(),
        )
    }

    #[test]
    fn test_empty_tick_emits_nothing() {
        let (_tx, rx) = snapshot_channel(8);
        let mut dispatcher = Dispatcher::new(rx, 60, 8);
        assert!(dispatcher.drain_and_fold().is_none());
        assert!(!dispatcher.tick());
    }

    #[test]
    fn test_drain_is_bounded_per_tick() {
        let (tx, rx) = snapshot_channel(32);
        let mut dispatcher = Dispatcher::new(rx, 60, 4);
        for i in 0..10 {
            tx.send(snap(i as f64, 0)).unwrap();
        }

        let first = dispatcher.drain_and_fold().unwrap();
        assert_eq!(first.folded, 4);
        assert_eq!(first.latest.cpu_percent(), 3.0);

        let second = dispatcher.drain_and_fold().unwrap();
        assert_eq!(second.folded, 4);
        let third = dispatcher.drain_and_fold().unwrap();
        assert_eq!(third.folded, 2);
        assert!(dispatcher.drain_and_fold().is_none());
        assert_eq!(third.sequence, 3);
    }

    #[test]
    fn test_all_metrics_folded_together() {
        let (tx, rx) = snapshot_channel(8);
        let mut dispatcher = Dispatcher::new(rx, 60, 8);
        tx.send(snap(10.0, 1000)).unwrap();
        tx.send(snap(20.0, 1500)).unwrap();

        let update = dispatcher.drain_and_fold().unwrap();
        assert_eq!(update.history[&Metric::Cpu], vec![10.0, 20.0]);
        assert_eq!(update.history[&Metric::Memory], vec![5.0, 10.0]);
        assert_eq!(update.history[&Metric::DiskIo], vec![0.0, 500.0]);
        for metric in Metric::ALL {
            assert_eq!(update.history[&metric].len(), 2);
        }
    }

    #[test]
    fn test_history_capped_under_burst() {
        let (tx, rx) = snapshot_channel(256);
        let mut dispatcher = Dispatcher::new(rx, 5, 64);
        for i in 0..200 {
            tx.send(snap((i % 100) as f64, 0)).unwrap();
        }
        while dispatcher.tick() {}
        for metric in Metric::ALL {
            assert!(dispatcher.history(metric).unwrap().len() <= 5);
        }
    }

    #[test]
    fn test_dropped_count_reported() {
        let (tx, rx) = snapshot_channel(2);
        let mut dispatcher = Dispatcher::new(rx, 60, 8);
        for i in 0..5 {
            tx.send(snap(i as f64, 0)).unwrap();
        }
        let update = dispatcher.drain_and_fold().unwrap();
        assert_eq!(update.dropped, 3);
        assert_eq!(update.folded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_count_bounded_by_cadence() {
        let (tx, rx) = snapshot_channel(100);
        let dispatcher = Dispatcher::new(rx, 60, 4);
        let mut updates = dispatcher.subscribe();
        let cadence = Duration::from_millis(500);
        let start = tokio::time::Instant::now();
        let mut handle = dispatcher.spawn(cadence);

        // Producer far faster than the cadence
        for i in 0..400u32 {
            let _ = tx.send(snap((i % 100) as f64, 0));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let elapsed = start.elapsed();
        handle.stop().await;

        let mut received = 0u128;
        while updates.try_recv().is_ok() {
            received += 1;
        }
        let bound = elapsed.as_millis().div_ceil(cadence.as_millis());
        assert!(received > 0);
        assert!(received <= bound, "{} updates in {:?}", received, elapsed);
    }
}
