use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::config::InputConfig;
use crate::items::RowResult;
use crate::progress::ProgressEvent;

/// A durable image of batch progress, sufficient to resume a partial run.
///
/// A saved snapshot never references a row whose external side effects were
/// not acknowledged: the recorder is updated only after the commit sequence
/// for that row has completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchState {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub input: InputConfig,
    /// Evaluator names in declaration order.
    pub evaluators: Vec<String>,
    pub total_rows: usize,
    pub processed_rows: BTreeSet<usize>,
    pub results: Vec<RowResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressEvent>,
}
