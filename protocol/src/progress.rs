use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProgressEventKind {
    Started,
    Progress,
    Completed,
    Error,
    Retry,
    Paused,
    Resumed,
}

/// A snapshot of batch progress. Counters are always consistent with each
/// other (read under one critical section); the estimate fields are
/// best-effort and may be absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: ProgressEventKind,
    pub timestamp: DateTime<Utc>,
    pub total_rows: usize,
    pub processed_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_index: Option<usize>,
    pub percent_complete: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_row_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_tokens_remaining: Option<i64>,
}
