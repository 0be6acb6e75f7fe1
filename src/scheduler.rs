use crate::collectors::MetricCollector;
use crate::metrics::Metrics;
use crate::state::{Snapshot, SnapshotStore};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

pub const HEAVY_INTERVAL: Duration = Duration::from_millis(20_000);

/// Receives the full snapshot after every light cycle.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn publish(&self, snapshot: &Snapshot);
}

/// One cadence worth of collectors, run sequentially.
pub struct Cycle {
    cadence: &'static str,
    collectors: Vec<(Box<dyn MetricCollector>, &'static str)>,
    metrics: Arc<Metrics>,
}

impl Cycle {
    pub fn new(
        cadence: &'static str,
        collectors: Vec<Box<dyn MetricCollector>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let collectors = collectors
            .into_iter()
            .map(|c| {
                let strategy = c.strategy();
                (c, strategy)
            })
            .collect();
        Self {
            cadence,
            collectors,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.collectors.len()
    }

    /// Every collector runs to completion; a failure leaves that collector's
    /// fields as they were.
    pub async fn run_once(&mut self) {
        for (collector, last_strategy) in &mut self.collectors {
            if let Err(err) = collector.collect().await {
                self.metrics.inc_collect_error(collector.name());
                debug!(
                    collector = collector.name(),
                    cadence = self.cadence,
                    error = %err,
                    "сбор метрики не удался, сохранено прежнее значение"
                );
            }

            let strategy = collector.strategy();
            if strategy != *last_strategy {
                self.metrics.inc_strategy_fallback(collector.name());
                *last_strategy = strategy;
            }
        }
        self.metrics.inc_cycle(self.cadence);
    }
}

/// Light cadence: sample, then publish the whole snapshot. The first tick
/// fires immediately.
pub async fn run_light(
    mut cycle: Cycle,
    period: Duration,
    store: Arc<SnapshotStore>,
    sink: Arc<dyn SnapshotSink>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки быстрого цикла");
                break;
            }
            _ = ticker.tick() => {
                cycle.run_once().await;
                let snapshot = store.read().await;
                cycle.metrics.update_from_snapshot(&snapshot);
                sink.publish(&snapshot).await;
            }
        }
    }
}

/// Heavy cadence: sample only, the light cadence carries the values out.
pub async fn run_heavy(mut cycle: Cycle, period: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("получен сигнал остановки медленного цикла");
                break;
            }
            _ = ticker.tick() => {
                cycle.run_once().await;
            }
        }
    }
}
