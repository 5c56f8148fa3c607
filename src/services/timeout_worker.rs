use anyhow::Result;
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::Config;
use crate::metrics::SWEEP_TICKS_TOTAL;
use crate::services::feedback_store::FeedbackStore;

/// Background sweep that catches feedback records stuck in
/// pending/generating past their time budget (crashed workers, lost tasks)
/// and transitions them to timeout so students get a retryable state.
pub struct TimeoutSweepWorker {
    store: FeedbackStore,
    config: Config,
}

impl TimeoutSweepWorker {
    pub fn new(store: FeedbackStore, config: Config) -> Self {
        Self { store, config }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.feedback.sweep_interval_secs);
        info!(
            "Starting feedback timeout sweep loop (interval {}s)",
            interval.as_secs()
        );

        loop {
            match self.run_once().await {
                Ok(swept) => {
                    SWEEP_TICKS_TOTAL.with_label_values(&["success"]).inc();
                    if swept > 0 {
                        info!(swept, "Timeout sweep transitioned stuck records");
                    }
                }
                Err(err) => {
                    SWEEP_TICKS_TOTAL.with_label_values(&["error"]).inc();
                    warn!(error = %err, "Timeout sweep tick failed");
                }
            }

            sleep(interval).await;
        }
    }

    async fn run_once(&self) -> Result<u64> {
        Ok(self.store.sweep_stuck(Utc::now()).await?)
    }
}
