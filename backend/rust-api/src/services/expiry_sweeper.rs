use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::SweeperSettings;
use crate::metrics::{ATTEMPTS_EXPIRED_TOTAL, SWEEPER_TICKS_TOTAL};

use super::attempt_store::AttemptStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub overdue: u64,
    pub stale_untimed: u64,
}

/// Periodically force-expires in-progress attempts nobody came back to.
pub struct ExpirySweeper {
    attempts: Arc<dyn AttemptStore>,
    interval: Duration,
    stale_after: chrono::Duration,
}

impl ExpirySweeper {
    pub fn new(attempts: Arc<dyn AttemptStore>, settings: &SweeperSettings) -> Self {
        Self {
            attempts,
            interval: Duration::from_secs(settings.interval_secs.max(1)),
            stale_after: chrono::Duration::hours(settings.stale_untimed_hours as i64),
        }
    }

    pub async fn run(&self) -> Result<()> {
        info!(
            "Starting expiry sweeper loop (interval {}s)",
            self.interval.as_secs()
        );

        loop {
            match self.run_once(Utc::now()).await {
                Ok(report) => {
                    SWEEPER_TICKS_TOTAL.with_label_values(&["success"]).inc();
                    if report.overdue + report.stale_untimed > 0 {
                        info!(
                            overdue = report.overdue,
                            stale_untimed = report.stale_untimed,
                            "Expiry sweep transitioned attempts"
                        );
                    }
                }
                Err(err) => {
                    SWEEPER_TICKS_TOTAL.with_label_values(&["error"]).inc();
                    warn!(error = %err, "Expiry sweep failed");
                }
            }

            sleep(self.interval).await;
        }
    }

    /// Both sweeps are batch updates; matching nothing is a normal outcome.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let overdue = self.attempts.expire_overdue(now).await?;
        let stale_untimed = self
            .attempts
            .expire_stale_untimed(now - self.stale_after, now)
            .await?;

        ATTEMPTS_EXPIRED_TOTAL
            .with_label_values(&["sweeper"])
            .inc_by(overdue + stale_untimed);

        Ok(SweepReport {
            overdue,
            stale_untimed,
        })
    }
}
