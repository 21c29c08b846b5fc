use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config;
use crate::marketplace::RawEvent;
use crate::pipeline::{Pipeline, PipelineError};

/// Ceiling on a single backoff delay.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// One unit of pipeline work. Payloads are ids and plain JSON so tasks can
/// cross a process boundary unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum Task {
    PollMarketplaces,
    IngestEvents {
        cabinet_id: i64,
        payloads: Vec<RawEvent>,
    },
    GenerateReply {
        event_id: i64,
        owner_id: i64,
    },
    AutoSend {
        event_id: i64,
    },
    RetentionCleanup {
        retention_days: i64,
    },
}

/// Per-stage queues kept separate so a slow or failing stage does not
/// starve the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Polling,
    Ingest,
    Llm,
    Autosend,
    Maintenance,
}

impl QueueName {
    pub const ALL: [QueueName; 5] = [
        QueueName::Polling,
        QueueName::Ingest,
        QueueName::Llm,
        QueueName::Autosend,
        QueueName::Maintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Polling => "polling",
            QueueName::Ingest => "ingest",
            QueueName::Llm => "llm",
            QueueName::Autosend => "autosend",
            QueueName::Maintenance => "maintenance",
        }
    }
}

/// Retry schedule one task kind declares for itself.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Exponential backoff for the given (1-based) attempt, with optional
    /// jitter of up to half the computed delay.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base_ms = self.base_delay.as_millis() as u64;
        let mut delay_ms = base_ms.saturating_mul(1u64 << exponent);
        delay_ms = delay_ms.min(MAX_BACKOFF.as_millis() as u64);
        if self.jitter && delay_ms > 0 {
            delay_ms += rand::thread_rng().gen_range(0..=delay_ms / 2);
        }
        Duration::from_millis(delay_ms.min(MAX_BACKOFF.as_millis() as u64))
    }
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::PollMarketplaces => "poll_marketplaces",
            Task::IngestEvents { .. } => "ingest_events",
            Task::GenerateReply { .. } => "generate_llm_response",
            Task::AutoSend { .. } => "auto_send_response",
            Task::RetentionCleanup { .. } => "retention_cleanup",
        }
    }

    pub fn queue(&self) -> QueueName {
        match self {
            Task::PollMarketplaces => QueueName::Polling,
            Task::IngestEvents { .. } => QueueName::Ingest,
            Task::GenerateReply { .. } => QueueName::Llm,
            Task::AutoSend { .. } => QueueName::Autosend,
            Task::RetentionCleanup { .. } => QueueName::Maintenance,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay = Duration::from_millis(*config::TASK_RETRY_BASE_MS);
        match self {
            // The scheduler will fire again shortly; no point in a long tail.
            Task::PollMarketplaces => RetryPolicy {
                max_attempts: 3,
                base_delay,
                jitter: true,
            },
            Task::RetentionCleanup { .. } => RetryPolicy {
                max_attempts: 2,
                base_delay,
                jitter: false,
            },
            _ => RetryPolicy {
                max_attempts: *config::TASK_MAX_ATTEMPTS,
                base_delay,
                jitter: true,
            },
        }
    }
}

/// key: task-queue-client -> routed enqueue interface
///
/// Explicitly constructed and handed to whoever needs to enqueue; tests
/// keep the receivers and drive tasks by hand instead of spawning workers.
#[derive(Clone)]
pub struct QueueClient {
    senders: HashMap<QueueName, Sender<Task>>,
}

pub struct QueueReceivers {
    receivers: HashMap<QueueName, Receiver<Task>>,
}

impl QueueReceivers {
    /// Detaches one queue's receiver; used by tests to pull tasks directly.
    pub fn take(&mut self, queue: QueueName) -> Option<Receiver<Task>> {
        self.receivers.remove(&queue)
    }
}

impl QueueClient {
    pub fn new(capacity: usize) -> (Self, QueueReceivers) {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for queue in QueueName::ALL {
            let (tx, rx) = channel(capacity);
            senders.insert(queue, tx);
            receivers.insert(queue, rx);
        }
        (Self { senders }, QueueReceivers { receivers })
    }

    pub async fn enqueue(&self, task: Task) -> anyhow::Result<()> {
        let queue = task.queue();
        let sender = self
            .senders
            .get(&queue)
            .ok_or_else(|| anyhow!("queue {} has no sender", queue.as_str()))?;
        sender
            .send(task)
            .await
            .map_err(|err| anyhow!("failed to enqueue onto {}: {err}", queue.as_str()))
    }
}

/// Spawns `workers_per_queue` workers for every queue. Workers share the
/// queue's receiver; each pulled task runs through its own retry schedule.
pub fn spawn_workers(pipeline: Arc<Pipeline>, receivers: QueueReceivers, workers_per_queue: usize) {
    for (queue, receiver) in receivers.receivers {
        let receiver = Arc::new(Mutex::new(receiver));
        for worker in 0..workers_per_queue {
            let receiver = receiver.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                run_worker(queue, worker, receiver, pipeline).await;
            });
        }
    }
}

async fn run_worker(
    queue: QueueName,
    worker: usize,
    receiver: Arc<Mutex<Receiver<Task>>>,
    pipeline: Arc<Pipeline>,
) {
    info!(queue = queue.as_str(), worker, "queue worker started");
    loop {
        let task = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        let Some(task) = task else {
            info!(queue = queue.as_str(), worker, "queue closed, worker exiting");
            return;
        };
        let _ = execute_with_retry(&pipeline, task).await;
    }
}

/// Runs one task under the retry policy it declares.
pub async fn execute_with_retry(pipeline: &Pipeline, task: Task) -> Result<(), PipelineError> {
    let policy = task.retry_policy();
    execute_with_policy(pipeline, task, policy).await
}

/// Transient failures back off and retry up to the attempt ceiling; fatal
/// failures and exhausted retries are recorded against the task's event.
pub async fn execute_with_policy(
    pipeline: &Pipeline,
    task: Task,
    policy: RetryPolicy,
) -> Result<(), PipelineError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match pipeline.execute(&task).await {
            Ok(()) => {
                if attempt > 1 {
                    info!(task = task.name(), attempt, "task succeeded after retry");
                }
                return Ok(());
            }
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    task = task.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "task failed, retrying"
                );
                sleep(delay).await;
            }
            Err(err) => {
                error!(
                    task = task.name(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "task failed terminally"
                );
                pipeline.record_failure(&task, &err).await;
                return Err(err);
            }
        }
    }
}
