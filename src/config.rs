use once_cell::sync::Lazy;

/// Seconds between marketplace polling sweeps.
pub static POLL_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("POLL_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(60)
});

/// Age in days after which audit/log rows are purged by the maintenance task.
pub static RETENTION_DAYS: Lazy<i64> = Lazy::new(|| {
    std::env::var("RETENTION_DAYS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(90)
});

/// Hour of day (UTC) at which the daily retention cleanup runs.
pub static RETENTION_RUN_HOUR: Lazy<u32> = Lazy::new(|| {
    std::env::var("RETENTION_RUN_HOUR")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value < 24)
        .unwrap_or(3)
});

/// Minimum draft confidence (0-100) required before a reply is sent without
/// manual approval.
pub static AUTOSEND_MIN_CONFIDENCE: Lazy<i32> = Lazy::new(|| {
    std::env::var("AUTOSEND_MIN_CONFIDENCE")
        .ok()
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|value| (0..=100).contains(value))
        .unwrap_or(50)
});

/// key: billing-config -> tokens debited per generated reply
pub static GENERATION_COST_TOKENS: Lazy<i64> = Lazy::new(|| {
    std::env::var("GENERATION_COST_TOKENS")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(1)
});

/// Maximum delivery attempts per task before it is abandoned.
pub static TASK_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("TASK_MAX_ATTEMPTS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5)
});

/// Base delay in milliseconds for exponential task retry backoff.
pub static TASK_RETRY_BASE_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TASK_RETRY_BASE_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5_000)
});

/// Number of workers spawned per task queue.
pub static WORKERS_PER_QUEUE: Lazy<usize> = Lazy::new(|| {
    std::env::var("WORKERS_PER_QUEUE")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(2)
});

/// Capacity of each in-process queue channel.
pub static QUEUE_CAPACITY: Lazy<usize> = Lazy::new(|| {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(64)
});

/// Endpoint of the reply-generation service consumed by `HttpLlmAdapter`.
pub static LLM_ENDPOINT: Lazy<String> = Lazy::new(|| {
    read_optional_env("LLM_ENDPOINT")
        .unwrap_or_else(|| "http://127.0.0.1:8089/generate".to_string())
});

/// Base URL for the Wildberries seller API.
pub static WB_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("WB_API_BASE")
        .unwrap_or_else(|| "https://feedbacks-api.wildberries.ru".to_string())
});

/// Base URL for the Ozon seller API.
pub static OZON_API_BASE: Lazy<String> = Lazy::new(|| {
    read_optional_env("OZON_API_BASE")
        .unwrap_or_else(|| "https://api-seller.ozon.ru".to_string())
});

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
