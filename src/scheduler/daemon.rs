use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::{task::JoinHandle, time::sleep};
use tracing::{error, info, warn};

use crate::config::ScheduleSettings;
use crate::pipeline::{PipelineDriver, PipelineError};
use crate::scheduler::cadence::DailyCadence;

/// 日次のエンリッチメントを起動するデーモンを生成する。
///
/// # Errors
/// 設定された時刻やオフセットが不正な場合。
pub fn spawn_batch_daemon(
    driver: Arc<PipelineDriver>,
    schedule: ScheduleSettings,
) -> Result<JoinHandle<()>> {
    let cadence =
        DailyCadence::with_utc_offset(schedule.utc_offset_hours, schedule.hour, schedule.minute)?;
    Ok(BatchDaemon {
        driver,
        cadence,
        retry_failed: schedule.auto_retry_failed,
    }
    .spawn())
}

struct BatchDaemon {
    driver: Arc<PipelineDriver>,
    cadence: DailyCadence,
    retry_failed: bool,
}

impl BatchDaemon {
    fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(self) {
        loop {
            let now = Utc::now();
            let next = self.cadence.next_run_from(now);
            let wait = duration_until(next, now);
            info!(
                next_run_utc = %next.to_rfc3339(),
                next_run_local = %next.with_timezone(&self.cadence.tz()).to_rfc3339(),
                wait_seconds = wait.as_secs(),
                "scheduled daily enrichment run"
            );
            sleep(wait).await;
            self.run_cycle().await;
            // 同じ分のうちに再起動しないようにする
            sleep(Duration::from_secs(60)).await;
        }
    }

    async fn run_cycle(&self) {
        match self.driver.run_scheduled(self.retry_failed).await {
            Ok(summary) => {
                let totals = summary.totals();
                info!(
                    run_id = %summary.run_id,
                    status = ?summary.status,
                    normalized = totals.normalized,
                    failed = totals.failed,
                    "daily enrichment run completed"
                );
            }
            Err(PipelineError::Busy) => {
                warn!("skipping daily enrichment: another run is in progress");
            }
            Err(PipelineError::ProvidersExhausted { summary }) => warn!(
                run_id = %summary.run_id,
                providers = ?summary.exhausted_providers,
                "daily enrichment stopped: providers exhausted"
            ),
            Err(err) => error!(error = %err, "daily enrichment run failed"),
        }
    }
}

fn duration_until(next: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) -> Duration {
    (next - now).to_std().unwrap_or(Duration::ZERO)
}
