//! Engine options that cannot live in `verdict-protocol` because they carry
//! user functions. The serde-able halves (retry, rate limit, export shape)
//! come from the protocol crate and are embedded here by value.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use verdict_protocol::config::CostSettings;
use verdict_protocol::config::ExecutionMode;
use verdict_protocol::config::ExportSettings;
use verdict_protocol::config::RateLimitSettings;
use verdict_protocol::config::RetrySettings;
use verdict_protocol::items::EvaluationInput;
use verdict_protocol::items::EvaluatorOutcome;
use verdict_protocol::items::RowResult;
use verdict_protocol::progress::ProgressEvent;
use verdict_protocol::state::BatchState;

/// Receives progress events. May suspend; the engine awaits the call before
/// advancing, so a slow listener backpressures emission, not evaluation.
#[async_trait]
pub trait ProgressListener: Send + Sync {
    async fn on_progress(&self, event: &ProgressEvent);
}

/// Runs after a row's streamed export and before the row is committed to the
/// in-memory result list. A failure here is a commit-side error: the whole
/// row goes back through the retry classifier.
#[async_trait]
pub trait ResultHook: Send + Sync {
    async fn on_result(&self, result: &RowResult) -> anyhow::Result<()>;
}

/// Invoked on every state save with the snapshot about to be (or just)
/// persisted.
#[async_trait]
pub trait StateSaveHook: Send + Sync {
    async fn on_state_save(&self, state: &BatchState) -> anyhow::Result<()>;
}

/// Combines the per-evaluator outcomes of a successful row into one number.
pub trait ScoreCombiner: Send + Sync {
    fn combine(&self, outcomes: &[EvaluatorOutcome]) -> f64;
}

impl<F> ScoreCombiner for F
where
    F: Fn(&[EvaluatorOutcome]) -> f64 + Send + Sync,
{
    fn combine(&self, outcomes: &[EvaluatorOutcome]) -> f64 {
        self(outcomes)
    }
}

/// Decides whether a committed row is written to an export destination.
/// Rows that are filtered out are still acknowledged as exported.
pub trait RowFilter: Send + Sync {
    fn include(&self, result: &RowResult) -> bool;
}

impl<F> RowFilter for F
where
    F: Fn(&RowResult) -> bool + Send + Sync,
{
    fn include(&self, result: &RowResult) -> bool {
        self(result)
    }
}

/// An export destination plus the optional user predicate that gates which
/// rows reach it. Used both for streaming (`stream_export`) and for post-hoc
/// bulk export.
#[derive(Clone)]
pub struct ExportOptions {
    pub settings: ExportSettings,
    pub filter: Option<Arc<dyn RowFilter>>,
}

impl std::fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOptions")
            .field("settings", &self.settings)
            .field("filter", &self.filter.as_ref().map(|_| "<filter>"))
            .finish()
    }
}

impl ExportOptions {
    pub fn new(settings: ExportSettings) -> Self {
        Self {
            settings,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: Arc<dyn RowFilter>) -> Self {
        self.filter = Some(filter);
        self
    }
}

impl From<ExportSettings> for ExportOptions {
    fn from(settings: ExportSettings) -> Self {
        Self::new(settings)
    }
}

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 1_000;

/// Everything a batch run can be configured with. `Default` matches the
/// documented defaults: concurrency 5, parallel evaluators, three retries
/// with exponential backoff, one progress event per second.
#[derive(Clone)]
pub struct EvaluationOptions {
    pub concurrency: usize,
    pub execution_mode: ExecutionMode,
    pub rate_limit: RateLimitSettings,
    pub retry: RetrySettings,
    pub progress_interval_ms: u64,
    pub on_progress: Option<Arc<dyn ProgressListener>>,
    pub on_result: Option<Arc<dyn ResultHook>>,
    pub stream_export: Option<ExportOptions>,
    pub resume_from: Option<BatchState>,
    pub state_path: Option<PathBuf>,
    pub save_state_interval_ms: Option<u64>,
    pub on_state_save: Option<Arc<dyn StateSaveHook>>,
    pub stop_on_error: bool,
    /// Per-evaluator wall-time budget. The timeout error names the evaluator
    /// and the budget, and goes through the regular retry classifier.
    pub evaluator_timeout_ms: Option<u64>,
    pub combine_scores: Option<Arc<dyn ScoreCombiner>>,
    /// Field defaults merged under every row; row fields win.
    pub default_input: Option<EvaluationInput>,
    pub cost: Option<CostSettings>,
}

impl Default for EvaluationOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            execution_mode: ExecutionMode::default(),
            rate_limit: RateLimitSettings::default(),
            retry: RetrySettings::default(),
            progress_interval_ms: DEFAULT_PROGRESS_INTERVAL_MS,
            on_progress: None,
            on_result: None,
            stream_export: None,
            resume_from: None,
            state_path: None,
            save_state_interval_ms: None,
            on_state_save: None,
            stop_on_error: false,
            evaluator_timeout_ms: None,
            combine_scores: None,
            default_input: None,
            cost: None,
        }
    }
}

impl EvaluationOptions {
    /// State tracking is active when anything would observe it: a resume
    /// snapshot, a state file, a save interval, or a save hook.
    pub fn state_tracking_enabled(&self) -> bool {
        self.resume_from.is_some()
            || self.state_path.is_some()
            || self.save_state_interval_ms.is_some()
            || self.on_state_save.is_some()
    }
}
