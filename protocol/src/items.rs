//! Core data model for batch evaluation: input rows, per-evaluator outcomes,
//! committed row results, and the final batch summary.
//!
//! Everything here serializes with camelCase keys because the engine's file
//! artifacts (snapshots, streamed exports) are consumed by non-Rust tooling.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// One input row. `candidate_text` is the only required field; any column the
/// caller supplies beyond the named ones lands in `extra` verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationInput {
    pub candidate_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl EvaluationInput {
    /// Merges `defaults` under `row`. Row fields win; absent row fields fall
    /// through to the defaults, and the extra maps are merged key-by-key with
    /// the row winning on collisions.
    pub fn merged(defaults: &EvaluationInput, row: &EvaluationInput) -> EvaluationInput {
        let mut extra = defaults.extra.clone();
        for (key, value) in &row.extra {
            extra.insert(key.clone(), value.clone());
        }
        EvaluationInput {
            candidate_text: if row.candidate_text.is_empty() {
                defaults.candidate_text.clone()
            } else {
                row.candidate_text.clone()
            },
            reference_text: row
                .reference_text
                .clone()
                .or_else(|| defaults.reference_text.clone()),
            source_text: row
                .source_text
                .clone()
                .or_else(|| defaults.source_text.clone()),
            prompt: row.prompt.clone().or_else(|| defaults.prompt.clone()),
            content_type: row
                .content_type
                .clone()
                .or_else(|| defaults.content_type.clone()),
            language: row.language.clone().or_else(|| defaults.language.clone()),
            id: row.id.clone().or_else(|| defaults.id.clone()),
            extra,
        }
    }

    /// Returns the row's stable identifier, synthesizing `row-<index>` when
    /// the caller did not supply one.
    pub fn effective_id(&self, index: usize) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("row-{index}"))
    }
}

/// An evaluator's verdict: either a bounded number or a label from the
/// evaluator's own category set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Score {
    Numeric(f64),
    Category(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenCounts {
    pub input: i64,
    pub output: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenCounts>,
}

/// One evaluator's output for one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluatorOutcome {
    pub evaluator: String,
    pub score: Score,
    pub feedback: String,
    pub stats: ProcessingStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A combined score is numeric on success and the literal string `"N/A"` on
/// terminal row failure, never a number in the failure case.
#[derive(Debug, Clone, PartialEq)]
pub enum CombinedScore {
    Numeric(f64),
    NotAvailable,
}

const NOT_AVAILABLE: &str = "N/A";

impl Serialize for CombinedScore {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            CombinedScore::Numeric(value) => serializer.serialize_f64(*value),
            CombinedScore::NotAvailable => serializer.serialize_str(NOT_AVAILABLE),
        }
    }
}

impl<'de> Deserialize<'de> for CombinedScore {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Number(number) => number
                .as_f64()
                .map(CombinedScore::Numeric)
                .ok_or_else(|| serde::de::Error::custom("combined score is not an f64")),
            Value::String(text) if text == NOT_AVAILABLE => Ok(CombinedScore::NotAvailable),
            other => Err(serde::de::Error::custom(format!(
                "invalid combined score: {other}"
            ))),
        }
    }
}

/// The committed record for one row.
///
/// On success `input` echoes the effective input (defaults merged under the
/// row) and `outcomes` holds one entry per configured evaluator in
/// declaration order. On terminal failure `input` is the raw row as the user
/// supplied it, `outcomes` is empty, and `error` carries the last message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowResult {
    pub id: String,
    pub index: usize,
    pub input: EvaluationInput,
    pub outcomes: Vec<EvaluatorOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_score: Option<CombinedScore>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RowResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Total tokens across all outcomes; missing per-outcome counts are zero.
    pub fn total_tokens(&self) -> i64 {
        self.outcomes
            .iter()
            .filter_map(|outcome| outcome.stats.tokens.as_ref())
            .map(|tokens| tokens.total)
            .sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub average_row_time_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens_used: Option<i64>,
    pub error_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub total_rows: usize,
    pub successful_rows: usize,
    pub failed_rows: usize,
    pub results: Vec<RowResult>,
    pub summary: BatchSummary,
}
