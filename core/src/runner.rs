//! The batch orchestrator: drives the row pipeline end to end, one gate
//! admission per row, with per-row retry and a strictly ordered commit
//! sequence (sink, result hook, in-memory append, tracker, state).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;
use uuid::Uuid;
use verdict_protocol::config::ExecutionMode;
use verdict_protocol::config::ExportFormat;
use verdict_protocol::config::InputConfig;
use verdict_protocol::items::BatchResult;
use verdict_protocol::items::BatchSummary;
use verdict_protocol::items::CombinedScore;
use verdict_protocol::items::EvaluationInput;
use verdict_protocol::items::EvaluatorOutcome;
use verdict_protocol::items::RowResult;
use verdict_protocol::state::BatchState;

use crate::config::EvaluationOptions;
use crate::config::ExportOptions;
use crate::error::Result;
use crate::error::VerdictErr;
use crate::evaluator::Evaluator;
use crate::export;
use crate::gate::ConcurrencyGate;
use crate::input;
use crate::progress::ProgressTracker;
use crate::retry;
use crate::state::StateRecorder;
use crate::state::StateRecorderParams;
use crate::streaming::StreamingSink;

#[derive(Default)]
struct BatchBook {
    results: Vec<RowResult>,
    processed: BTreeSet<usize>,
}

struct RunContext<'a> {
    tracker: &'a ProgressTracker,
    sink: Option<&'a Mutex<StreamingSink>>,
    recorder: Option<&'a StateRecorder>,
}

/// Applies a fixed evaluator set to every row of an input source with
/// bounded parallelism, rate limiting, per-row retry, live progress, and
/// optional streaming export and resumable state.
pub struct BatchRunner {
    evaluators: Vec<Arc<dyn Evaluator>>,
    options: EvaluationOptions,
    gate: ConcurrencyGate,
    book: Mutex<BatchBook>,
    recorder: Mutex<Option<StateRecorder>>,
    last_state: Mutex<Option<BatchState>>,
    last_batch: Mutex<Option<BatchResult>>,
    aborted: AtomicBool,
}

impl BatchRunner {
    pub fn new(evaluators: Vec<Arc<dyn Evaluator>>, options: EvaluationOptions) -> Self {
        let gate = ConcurrencyGate::new(options.concurrency, &options.rate_limit);
        Self {
            evaluators,
            options,
            gate,
            book: Mutex::new(BatchBook::default()),
            recorder: Mutex::new(None),
            last_state: Mutex::new(None),
            last_batch: Mutex::new(None),
            aborted: AtomicBool::new(false),
        }
    }

    /// Runs the batch to completion and returns the assembled result.
    ///
    /// Individual row failures are contained (they produce a `RowResult`
    /// with an error and never abort peers); the only error escape per row
    /// is `stop_on_error`, which raises [`VerdictErr::RowFailed`] after the
    /// failing row has been committed. Rows still queued at the gate are
    /// then not admitted; rows already in flight run to their natural end.
    pub async fn evaluate(&self, input_config: InputConfig) -> Result<BatchResult> {
        let rows = input::resolve_rows(&input_config).await?;
        let total_rows = rows.len();
        let run_started = Instant::now();
        self.aborted.store(false, Ordering::SeqCst);

        let mut batch_id = Uuid::new_v4().to_string();
        let mut started_at = Utc::now();
        {
            let mut book = self.book.lock().await;
            book.results.clear();
            book.processed.clear();
            for index in 0..input_config.start_index.min(total_rows) {
                book.processed.insert(index);
            }
            if let Some(snapshot) = &self.options.resume_from {
                batch_id = snapshot.batch_id.clone();
                started_at = snapshot.started_at;
                book.processed = snapshot.processed_rows.clone();
                book.results = snapshot.results.clone();
            }
        }

        let sink = match &self.options.stream_export {
            Some(stream_export) => {
                let mut sink = StreamingSink::from_options(stream_export)?;
                sink.initialize().await?;
                Some(Mutex::new(sink))
            }
            None => None,
        };

        let tracker = ProgressTracker::new(
            total_rows,
            Duration::from_millis(self.options.progress_interval_ms),
            self.options.on_progress.clone(),
            self.options.cost,
        );
        tracker.start().await;
        let already_processed = {
            let book = self.book.lock().await;
            book.processed.len()
        };
        if already_processed > 0 {
            tracker.skip_rows(already_processed).await;
        }

        let recorder = if self.options.state_tracking_enabled() {
            let initial = {
                let book = self.book.lock().await;
                BatchState {
                    batch_id: batch_id.clone(),
                    started_at,
                    last_update: Utc::now(),
                    input: input_config.clone(),
                    evaluators: self
                        .evaluators
                        .iter()
                        .map(|evaluator| evaluator.name().to_string())
                        .collect(),
                    total_rows,
                    processed_rows: book.processed.clone(),
                    results: book.results.clone(),
                    progress: None,
                }
            };
            Some(StateRecorder::new(StateRecorderParams {
                initial,
                path: self.options.state_path.clone(),
                save_interval: self.options.save_state_interval_ms.map(Duration::from_millis),
                hook: self.options.on_state_save.clone(),
            }))
        } else {
            None
        };
        *self.recorder.lock().await = recorder.clone();

        info!(
            batch_id = %batch_id,
            total_rows, already_processed, "starting batch evaluation"
        );

        let ctx = RunContext {
            tracker: &tracker,
            sink: sink.as_ref(),
            recorder: recorder.as_ref(),
        };

        let chunk_size = self.options.concurrency.max(1) * 2;
        let indexed: Vec<(usize, &EvaluationInput)> = rows.iter().enumerate().collect();
        let mut abort_error: Option<VerdictErr> = None;
        for chunk in indexed.chunks(chunk_size) {
            if self.aborted.load(Ordering::SeqCst) {
                break;
            }
            let tasks = chunk
                .iter()
                .map(|(index, row)| self.process_row(*index, *row, &ctx));
            for outcome in futures::future::join_all(tasks).await {
                if let Err(err) = outcome
                    && abort_error.is_none()
                {
                    abort_error = Some(err);
                }
            }
            if abort_error.is_some() {
                break;
            }
        }

        tracker.complete().await;
        if let Some(sink) = &sink {
            sink.lock().await.finalize().await?;
        }
        if let Some(recorder) = &recorder {
            let final_state = recorder.snapshot().await;
            recorder.shutdown().await;
            *self.last_state.lock().await = final_state;
            *self.recorder.lock().await = None;
        }

        if let Some(err) = abort_error {
            warn!("batch aborted: {err}");
            return Err(err);
        }

        let results = {
            let book = self.book.lock().await;
            book.results.clone()
        };
        let finished_at = Utc::now();
        let successful_rows = results.iter().filter(|row| row.is_success()).count();
        let failed_rows = results.len() - successful_rows;
        let average_row_time_ms = if results.is_empty() {
            0.0
        } else {
            results.iter().map(|row| row.duration_ms).sum::<u64>() as f64 / results.len() as f64
        };
        let total_tokens: i64 = results.iter().map(RowResult::total_tokens).sum();
        let error_rate = if results.is_empty() {
            0.0
        } else {
            failed_rows as f64 / results.len() as f64
        };

        let batch = BatchResult {
            batch_id,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            total_rows: results.len(),
            successful_rows,
            failed_rows,
            results,
            summary: BatchSummary {
                average_row_time_ms,
                total_tokens_used: (total_tokens > 0).then_some(total_tokens),
                error_rate,
            },
        };
        info!(
            batch_id = %batch.batch_id,
            successful = successful_rows,
            failed = failed_rows,
            elapsed_ms = run_started.elapsed().as_millis() as u64,
            "batch evaluation finished"
        );
        *self.last_batch.lock().await = Some(batch.clone());
        Ok(batch)
    }

    /// Post-hoc bulk export of the accumulated results.
    pub async fn export(&self, options: &ExportOptions) -> Result<()> {
        let results = self.results().await;
        match options.settings.format {
            ExportFormat::Csv => export::export_rows_csv(&results, options).await,
            ExportFormat::Json => {
                let batch = {
                    let last_batch = self.last_batch.lock().await;
                    last_batch.clone().ok_or(VerdictErr::NothingToExport)?
                };
                export::export_batch_json(&batch, options).await
            }
            ExportFormat::Webhook => export::export_rows_webhook(&results, options).await,
        }
    }

    /// Defensive copy of the results committed so far.
    pub async fn results(&self) -> Vec<RowResult> {
        let book = self.book.lock().await;
        book.results.clone()
    }

    /// Live snapshot while a batch with state tracking runs; the final
    /// snapshot afterwards.
    pub async fn state(&self) -> Option<BatchState> {
        let recorder = { self.recorder.lock().await.clone() };
        if let Some(recorder) = recorder
            && let Some(snapshot) = recorder.snapshot().await
        {
            return Some(snapshot);
        }
        self.last_state.lock().await.clone()
    }

    async fn process_row(
        &self,
        index: usize,
        row: &EvaluationInput,
        ctx: &RunContext<'_>,
    ) -> Result<()> {
        {
            let book = self.book.lock().await;
            if book.processed.contains(&index) {
                return Ok(());
            }
        }
        self.gate.run(self.run_row(index, row, ctx)).await
    }

    async fn run_row(
        &self,
        index: usize,
        row: &EvaluationInput,
        ctx: &RunContext<'_>,
    ) -> Result<()> {
        if self.aborted.load(Ordering::SeqCst) {
            return Ok(());
        }
        let row_started = Instant::now();
        let effective = match &self.options.default_input {
            Some(defaults) => EvaluationInput::merged(defaults, row),
            None => row.clone(),
        };
        let id = effective.effective_id(index);

        let mut retry_count: u32 = 0;
        loop {
            let error_message = match self.attempt_row(&effective).await {
                Ok(outcomes) => {
                    match self
                        .commit_success(
                            index,
                            &id,
                            &effective,
                            outcomes,
                            row_started,
                            retry_count,
                            ctx,
                        )
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(message) => message,
                    }
                }
                Err(message) => message,
            };

            if retry::is_retryable(&self.options.retry, &error_message, retry_count) {
                let attempt = retry_count + 1;
                debug!(row = %id, attempt, "retrying row: {error_message}");
                ctx.tracker.record_retry(&error_message, attempt).await;
                sleep(retry::backoff_delay(&self.options.retry, attempt)).await;
                retry_count = attempt;
                continue;
            }

            warn!(row = %id, retry_count, "row failed: {error_message}");
            self.commit_failure(index, &id, row, &error_message, row_started, retry_count, ctx)
                .await;
            if self.options.stop_on_error {
                self.aborted.store(true, Ordering::SeqCst);
                return Err(VerdictErr::RowFailed {
                    id,
                    retries: retry_count,
                    message: error_message,
                });
            }
            return Ok(());
        }
    }

    /// Runs the evaluator set once. The error value is the rendered message
    /// handed to the retry classifier.
    async fn attempt_row(
        &self,
        input: &EvaluationInput,
    ) -> std::result::Result<Vec<EvaluatorOutcome>, String> {
        match self.options.execution_mode {
            ExecutionMode::Parallel => {
                let calls = self
                    .evaluators
                    .iter()
                    .map(|evaluator| self.run_evaluator(evaluator.as_ref(), input));
                futures::future::try_join_all(calls).await
            }
            ExecutionMode::Sequential => {
                let mut outcomes = Vec::with_capacity(self.evaluators.len());
                for evaluator in &self.evaluators {
                    outcomes.push(self.run_evaluator(evaluator.as_ref(), input).await?);
                }
                Ok(outcomes)
            }
        }
    }

    async fn run_evaluator(
        &self,
        evaluator: &dyn Evaluator,
        input: &EvaluationInput,
    ) -> std::result::Result<EvaluatorOutcome, String> {
        match self.options.evaluator_timeout_ms {
            Some(budget_ms) => {
                match timeout(Duration::from_millis(budget_ms), evaluator.evaluate(input)).await {
                    Ok(outcome) => outcome.map_err(|err| err.to_string()),
                    // Worded so the default retry classifier treats the fuse
                    // as transient.
                    Err(_) => Err(format!(
                        "evaluator {} timeout after {budget_ms} ms",
                        evaluator.name()
                    )),
                }
            }
            None => evaluator.evaluate(input).await.map_err(|err| err.to_string()),
        }
    }

    /// The five-step commit. Any failure before the in-memory append leaves
    /// the row uncommitted and the whole row is retried.
    #[allow(clippy::too_many_arguments)]
    async fn commit_success(
        &self,
        index: usize,
        id: &str,
        effective: &EvaluationInput,
        outcomes: Vec<EvaluatorOutcome>,
        row_started: Instant,
        retry_count: u32,
        ctx: &RunContext<'_>,
    ) -> std::result::Result<(), String> {
        let duration_ms = row_started.elapsed().as_millis() as u64;
        let combined_score = self
            .options
            .combine_scores
            .as_ref()
            .map(|combiner| CombinedScore::Numeric(combiner.combine(&outcomes)));
        let result = RowResult {
            id: id.to_string(),
            index,
            input: effective.clone(),
            outcomes,
            combined_score,
            completed_at: Utc::now(),
            duration_ms,
            retry_count,
            error: None,
        };
        let total_tokens = result.total_tokens();

        if let Some(sink) = ctx.sink {
            sink.lock()
                .await
                .export_result(&result)
                .await
                .map_err(|err| err.to_string())?;
        }
        if let Some(hook) = &self.options.on_result {
            hook.on_result(&result).await.map_err(|err| err.to_string())?;
        }
        {
            let mut book = self.book.lock().await;
            book.results.push(result.clone());
            book.processed.insert(index);
        }
        ctx.tracker
            .record_success(duration_ms, (total_tokens > 0).then_some(total_tokens), index)
            .await;
        if let Some(recorder) = ctx.recorder {
            recorder
                .commit_row(result, Some(ctx.tracker.current().await))
                .await;
        }
        Ok(())
    }

    /// Terminal failure: the raw row (pre-merge), empty outcomes, and the
    /// last error. Failed rows are not streamed to the sink.
    #[allow(clippy::too_many_arguments)]
    async fn commit_failure(
        &self,
        index: usize,
        id: &str,
        raw_row: &EvaluationInput,
        error_message: &str,
        row_started: Instant,
        retry_count: u32,
        ctx: &RunContext<'_>,
    ) {
        let duration_ms = row_started.elapsed().as_millis() as u64;
        let combined_score = self
            .options
            .combine_scores
            .as_ref()
            .map(|_| CombinedScore::NotAvailable);
        let result = RowResult {
            id: id.to_string(),
            index,
            input: raw_row.clone(),
            outcomes: Vec::new(),
            combined_score,
            completed_at: Utc::now(),
            duration_ms,
            retry_count,
            error: Some(error_message.to_string()),
        };

        {
            let mut book = self.book.lock().await;
            book.results.push(result.clone());
            book.processed.insert(index);
        }
        ctx.tracker
            .record_failure(duration_ms, error_message, index)
            .await;
        if let Some(recorder) = ctx.recorder {
            recorder
                .commit_row(result, Some(ctx.tracker.current().await))
                .await;
        }
    }
}
