use chrono::{NaiveDate, Timelike, Utc};
use tokio::time::{self, Duration};
use tracing::warn;

use crate::config;
use crate::queue::{QueueClient, Task};

/// key: beat-scheduler -> periodic task production
///
/// Two loops: a polling sweep on a fixed interval and a daily retention
/// cleanup fired once when the configured hour comes around.
pub fn spawn(queue: QueueClient) {
    spawn_polling(queue.clone());
    spawn_retention(queue);
}

fn spawn_polling(queue: QueueClient) {
    let interval = Duration::from_secs(*config::POLL_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(err) = queue.enqueue(Task::PollMarketplaces).await {
                warn!(?err, "failed to enqueue polling sweep");
            }
        }
    });
}

fn spawn_retention(queue: QueueClient) {
    let run_hour = *config::RETENTION_RUN_HOUR;
    let retention_days = *config::RETENTION_DAYS;
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(60));
        let mut last_run: Option<NaiveDate> = None;
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if now.hour() != run_hour || last_run == Some(now.date_naive()) {
                continue;
            }
            match queue.enqueue(Task::RetentionCleanup { retention_days }).await {
                Ok(()) => last_run = Some(now.date_naive()),
                Err(err) => warn!(?err, "failed to enqueue retention cleanup"),
            }
        }
    });
}
