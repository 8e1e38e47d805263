use std::path::PathBuf;

use thiserror::Error;
use verdict_protocol::config::ExportFormat;

pub type Result<T> = std::result::Result<T, VerdictErr>;

/// Engine-level errors. Transient and permanent evaluator failures are not
/// represented here: they are contained per row and surface as
/// `RowResult.error`. The only per-row escape is [`VerdictErr::RowFailed`],
/// raised when `stop_on_error` is set.
#[derive(Debug, Error)]
pub enum VerdictErr {
    #[error("could not detect an input format for `{path}`; expected a .csv or .json extension")]
    UnknownInputFormat { path: PathBuf },

    #[error("row {row} is missing required field `candidateText`")]
    MissingCandidate { row: usize },

    #[error("records path `{path}` does not resolve to an array")]
    RecordsPathNotArray { path: String },

    #[error("record {index} is not a valid row: {detail}")]
    InvalidRecord { index: usize, detail: String },

    #[error("failed to parse `{path}`: {detail}")]
    Parse { path: PathBuf, detail: String },

    #[error("io error while {action}: {source}")]
    Io {
        action: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{format} export requires a file path")]
    MissingExportPath { format: ExportFormat },

    #[error("webhook export requires webhook settings")]
    MissingWebhookSettings,

    #[error("webhook request to {url} failed: {detail}")]
    Webhook { url: String, detail: String },

    #[error("state save hook failed: {detail}")]
    StateHook { detail: String },

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error("row {id} failed after {retries} retries: {message}")]
    RowFailed {
        id: String,
        retries: u32,
        message: String,
    },

    #[error("no batch result is available to export; run evaluate first")]
    NothingToExport,
}

impl VerdictErr {
    pub(crate) fn io(action: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            action: action.into(),
            source,
        }
    }
}
