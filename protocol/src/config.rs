//! Serializable configuration shared between the engine and its callers.
//!
//! Anything that carries user functions (callbacks, combiners, filters) lives
//! in `verdict-core`; this module is only the data that can round-trip through
//! a state snapshot.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

use crate::items::EvaluationInput;

/// How evaluators are dispatched within a single row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

/// Input format selector. `Auto` resolves by file extension and is only valid
/// on the input side; export formats are a separate enum without it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InputFormat {
    #[default]
    Auto,
    Csv,
    Json,
}

/// Semantic field names a delimited-text column can be mapped to. Columns
/// mapped to anything else (or not mapped at all) become extra fields.
pub const SEMANTIC_FIELDS: [&str; 7] = [
    "candidateText",
    "referenceText",
    "sourceText",
    "prompt",
    "contentType",
    "language",
    "id",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub quote: char,
    pub has_headers: bool,
    pub skip_empty_lines: bool,
    /// Maps a column header to a semantic field name from
    /// [`SEMANTIC_FIELDS`]. Headerless files expose columns as `column<i>`.
    pub field_map: HashMap<String, String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            quote: '"',
            has_headers: true,
            skip_empty_lines: true,
            field_map: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JsonOptions {
    /// Dotted path to the record array, e.g. `data.rows`. Absent means the
    /// document root must itself be an array.
    pub records_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInput {
    pub path: PathBuf,
    #[serde(default)]
    pub format: InputFormat,
    #[serde(default)]
    pub csv: CsvOptions,
    #[serde(default)]
    pub json: JsonOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputSource {
    Inline(Vec<EvaluationInput>),
    File(FileInput),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputConfig {
    pub source: InputSource,
    /// Rows before this index are treated as already processed: they are not
    /// evaluated, not exported, and the processed set is pre-populated with
    /// their indices.
    #[serde(default)]
    pub start_index: usize,
}

impl InputConfig {
    pub fn inline(rows: Vec<EvaluationInput>) -> Self {
        Self {
            source: InputSource::Inline(rows),
            start_index: 0,
        }
    }

    pub fn file(file: FileInput) -> Self {
        Self {
            source: InputSource::File(file),
            start_index: 0,
        }
    }
}

/// Export destination kind. Deliberately has no `auto` variant: the sentinel
/// is input-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
    Webhook,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WebhookMethod {
    #[default]
    Post,
    Put,
}

pub const DEFAULT_WEBHOOK_TIMEOUT_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSettings {
    pub url: String,
    #[serde(default)]
    pub method: WebhookMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    DEFAULT_WEBHOOK_TIMEOUT_MS
}

impl WebhookSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: WebhookMethod::default(),
            headers: HashMap::new(),
            timeout_ms: DEFAULT_WEBHOOK_TIMEOUT_MS,
        }
    }
}

pub const DEFAULT_WEBHOOK_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportSettings {
    pub format: ExportFormat,
    /// Destination file. Required for csv and json.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Delimited text only: append to an existing file instead of truncating,
    /// skipping the header when the file already has content.
    #[serde(default)]
    pub append_to_existing: bool,
    /// Delimited text only: flatten outcomes into columns (true, default) or
    /// store them as one escaped JSON string under a `results` column.
    #[serde(default = "default_flatten_results")]
    pub flatten_results: bool,
    /// Top-level keys of the serialized row to keep. Applied before
    /// `exclude_fields`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSettings>,
    /// Bulk webhook export only: rows per request.
    #[serde(default = "default_webhook_batch_size")]
    pub batch_size: usize,
}

fn default_flatten_results() -> bool {
    true
}

fn default_webhook_batch_size() -> usize {
    DEFAULT_WEBHOOK_BATCH_SIZE
}

impl ExportSettings {
    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self::for_path(ExportFormat::Csv, path)
    }

    pub fn json(path: impl Into<PathBuf>) -> Self {
        Self::for_path(ExportFormat::Json, path)
    }

    pub fn webhook(settings: WebhookSettings) -> Self {
        Self {
            format: ExportFormat::Webhook,
            path: None,
            append_to_existing: false,
            flatten_results: true,
            include_fields: None,
            exclude_fields: None,
            webhook: Some(settings),
            batch_size: DEFAULT_WEBHOOK_BATCH_SIZE,
        }
    }

    fn for_path(format: ExportFormat, path: impl Into<PathBuf>) -> Self {
        Self {
            format,
            path: Some(path.into()),
            append_to_existing: false,
            flatten_results: true,
            include_fields: None,
            exclude_fields: None,
            webhook: None,
            batch_size: DEFAULT_WEBHOOK_BATCH_SIZE,
        }
    }
}

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrySettings {
    /// Retry budget per row; the permitted attempt sequence is one initial
    /// attempt plus this many retries.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub exponential_backoff: bool,
    /// Case-sensitive substring allow-list. Non-empty replaces the default
    /// transient-error classifier entirely.
    pub retry_on_errors: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            exponential_backoff: true,
            retry_on_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub max_requests_per_minute: Option<u32>,
    pub max_requests_per_hour: Option<u32>,
}

/// Fixed assumptions behind the best-effort cost and remaining-token
/// estimates in progress events. These never feed control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostSettings {
    pub tokens_per_row: u64,
    pub price_per_million_tokens: f64,
}
