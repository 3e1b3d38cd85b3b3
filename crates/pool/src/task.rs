// This file is part of Quay.
//
// Quay is free software: you can redistribute it and/or modify it under the
// terms of the GNU Lesser General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later version.
//
// Quay is distributed in the hope that it will be useful, but WITHOUT ANY WARRANTY;
// without even the implied warranty of MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.
// See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with Quay.
// If not, see https://www.gnu.org/licenses/.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use metrics::Histogram;
use metrics_derive::Metrics;
use quay_types::Timestamp;
use quay_utils::{guard_timer::HistogramTimer, log::LogOnError};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::mempool::OpPool;

/// Schedule of the pool's background maintenance
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct MaintenanceConfig {
    /// Time between expiry sweeps
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sweep_interval: Duration,
    /// Time between reputation decay passes
    #[serde_as(as = "DurationSeconds<u64>")]
    pub decay_interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(60),
            decay_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Sweeps expired entries and decays reputation until shut down
pub struct MaintenanceTask {
    pool: Arc<OpPool>,
    config: MaintenanceConfig,
    metrics: MaintenanceMetrics,
}

impl std::fmt::Debug for MaintenanceTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaintenanceTask")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl MaintenanceTask {
    /// Create a task over `pool`
    pub fn new(pool: Arc<OpPool>, config: MaintenanceConfig) -> Self {
        Self {
            pool,
            config,
            metrics: MaintenanceMetrics::default(),
        }
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// A failed pass is logged and retried on the next tick.
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut sweep = time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut decay = time::interval_at(
            Instant::now() + self.config.decay_interval,
            self.config.decay_interval,
        );
        decay.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Starting pool maintenance, sweeping every {:?} and decaying every {:?}",
            self.config.sweep_interval, self.config.decay_interval
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down pool maintenance");
                    return Ok(());
                }
                _ = sweep.tick() => {
                    let _ = self.sweep().await.log_on_error("Failed to sweep expired operations");
                }
                _ = decay.tick() => {
                    let _ = self.decay().await.log_on_error("Failed to decay reputation");
                }
            }
        }
    }

    async fn sweep(&self) -> anyhow::Result<usize> {
        let _timer = HistogramTimer::new(self.metrics.sweep_duration.clone());
        let pool = self.pool.clone();
        let removed = tokio::task::spawn_blocking(move || pool.sweep_expired(Timestamp::now()))
            .await
            .context("sweep task panicked")??;
        debug!("Sweep removed {removed} operations");
        Ok(removed)
    }

    async fn decay(&self) -> anyhow::Result<()> {
        let _timer = HistogramTimer::new(self.metrics.decay_duration.clone());
        let pool = self.pool.clone();
        let interval = self.config.decay_interval;
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let reputation = pool.reputation();
            let now = Timestamp::now();
            // a restart shortly after a pass must not decay twice
            if let Some(last) = reputation.last_decay()? {
                if now.saturating_duration_since(last) < interval {
                    debug!("Skipping reputation decay, last pass at {last}");
                    return Ok(());
                }
            }
            reputation.decay(now)?;
            Ok(())
        })
        .await
        .context("decay task panicked")?
    }
}

#[derive(Metrics)]
#[metrics(scope = "op_pool_maintenance")]
struct MaintenanceMetrics {
    #[metric(describe = "time to sweep expired operations in ms.")]
    sweep_duration: Histogram,
    #[metric(describe = "time to decay reputation in ms.")]
    decay_duration: Histogram,
}
