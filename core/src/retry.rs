use std::time::Duration;

use verdict_protocol::config::RetrySettings;

/// Error-message markers that identify a transient failure when the caller
/// has not supplied an allow-list. Matched case-insensitively.
const DEFAULT_RETRYABLE_MARKERS: [&str; 7] = [
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "rate limit",
    "429",
    "503",
    "timeout",
];

/// Decides whether a failed row may be retried. `attempt` is the number of
/// retries already consumed, so the total attempt sequence is one initial
/// attempt plus `max_retries` retries.
pub(crate) fn is_retryable(settings: &RetrySettings, message: &str, attempt: u32) -> bool {
    if attempt >= settings.max_retries {
        return false;
    }
    if !settings.retry_on_errors.is_empty() {
        return settings
            .retry_on_errors
            .iter()
            .any(|marker| message.contains(marker.as_str()));
    }
    let lowered = message.to_lowercase();
    DEFAULT_RETRYABLE_MARKERS
        .iter()
        .any(|marker| lowered.contains(&marker.to_lowercase()))
}

/// Delay before retry number `attempt` (1-based). No jitter is applied: a
/// row's retry schedule is deterministic given its settings.
pub(crate) fn backoff_delay(settings: &RetrySettings, attempt: u32) -> Duration {
    let base = settings.retry_delay_ms;
    let delay_ms = if settings.exponential_backoff {
        let exp = attempt.saturating_sub(1).min(20);
        base.saturating_mul(1_u64 << exp)
    } else {
        base
    };
    Duration::from_millis(delay_ms)
}
