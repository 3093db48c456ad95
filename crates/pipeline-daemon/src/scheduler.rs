//! Periodic refresh of the stored pipeline aggregate

use pipeline_engine::PipelineEngine;
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Background task that keeps the dashboard aggregate fresh.
pub struct AggregateRefresher {
    engine: Arc<PipelineEngine>,
    period: Duration,
    running: Arc<RwLock<bool>>,
    shutdown: Notify,
}

impl AggregateRefresher {
    pub fn new(engine: Arc<PipelineEngine>, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            engine,
            period,
            running: Arc::new(RwLock::new(false)),
            shutdown: Notify::new(),
        })
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    /// Refresh on every tick until [`stop`](Self::stop) is called. The first
    /// tick fires immediately.
    pub async fn start(self: Arc<Self>) {
        {
            let mut running = self.running.write().await;
            *running = true;
        }
        tracing::info!(period_secs = self.period.as_secs_f64(), "Aggregate refresher started");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.engine.aggregates().refresh().await {
                        tracing::error!(error = %e, "Aggregate refresh failed");
                    }
                }
                _ = self.shutdown.notified() => break,
            }

            if !*self.running.read().await {
                break;
            }
        }

        *self.running.write().await = false;
        tracing::info!("Aggregate refresher stopped");
    }

    pub async fn stop(&self) {
        {
            let mut running = self.running.write().await;
            *running = false;
        }
        self.shutdown.notify_one();
    }
}
